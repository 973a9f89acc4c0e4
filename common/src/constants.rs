//! Shared constants for the nfsdig probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in map capacities, name lengths and wire formats.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Capacity of the per-thread and per-task in-flight maps
pub const MAX_ENTRIES: u32 = 1024;

/// Capacity of the client operation start map (one slot per thread)
pub const MAX_OP_STARTS: u32 = 10240;

/// Capacity of every completed-event queue
pub const MAX_QUEUE_ENTRIES: u32 = 65536;

/// Capacity of the per-packet and per-XID record maps
pub const MAX_PACKET_RECORDS: u32 = 10000;

// ============================================================================
// Fixed String Lengths
// ============================================================================

/// Length of the kernel task command name (`comm`)
pub const TASK_COMM_LEN: usize = 16;

/// Length of a captured file name, NUL terminator included
pub const FILE_NAME_LEN: usize = 32;

/// Length of a captured RPC procedure name, NUL terminator included
pub const PROC_NAME_LEN: usize = 32;

// ============================================================================
// VFS
// ============================================================================

/// `kiocb.ki_flags` bit set for O_DIRECT I/O
pub const IOCB_DIRECT: u32 = 1 << 17;

// ============================================================================
// Network and RPC Wire Format
// ============================================================================

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

/// IPv4 ethertype
pub const ETH_P_IP: u16 = 0x0800;

/// Minimal IPv4 header length
pub const IP_HLEN: usize = 20;

/// Minimal TCP header length
pub const TCP_HLEN: usize = 20;

/// UDP header length
pub const UDP_HLEN: usize = 8;

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

/// Well-known NFS port, matched on either side regardless of the port filter
pub const NFS_PORT: u16 = 2049;

/// RPC record marker prepended to every message on stream transports
pub const RPC_RECORD_MARK_LEN: usize = 4;

/// Fixed part of an RPC call header on a stream transport: record marker,
/// xid, message type, rpc version, program, program version, procedure,
/// credential flavor and credential length
pub const RPC_CALL_HEADER_LEN: usize = 36;

/// RPC message type of a call
pub const RPC_MSG_CALL: u32 = 0;

/// RPC program number of NFS
pub const RPC_PROG_NFS: u32 = 100003;

/// NFS program version handled by the COMPOUND path
pub const NFS_VERSION_4: u32 = 4;

/// NFSv4 COMPOUND procedure number
pub const NFS_PROC_COMPOUND: u32 = 1;

// ============================================================================
// Fault Injection
// ============================================================================

/// Upper bound on busy-wait iterations of an injected delay
pub const MAX_DELAY_SPINS: u32 = 1000;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Entry probes that stored an in-flight record
pub const STAT_RECORDED: u32 = 0;

/// Exit probes that emitted a completed event
pub const STAT_EMITTED: u32 = 1;

/// Exit probes that found no in-flight record
pub const STAT_PAIRING_MISS: u32 = 2;

/// Paired exits whose latency truncated to zero
pub const STAT_SUPPRESSED: u32 = 3;

/// Inserts rejected because a map was full
pub const STAT_STORE_FULL: u32 = 4;

/// Pushes rejected because a queue was full
pub const STAT_QUEUE_FULL: u32 = 5;

/// Entries skipped by the pid filter
pub const STAT_FILTERED: u32 = 6;

/// Error events emitted from RPC status codes
pub const STAT_ERRORS: u32 = 7;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 8;
