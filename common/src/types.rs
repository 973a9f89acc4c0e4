//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code. Every struct spells out its
//! padding so that no uninitialised byte ever crosses a map boundary.

use crate::constants::{FILE_NAME_LEN, PROC_NAME_LEN, TASK_COMM_LEN};

// ============================================================================
// Correlation Keys
// ============================================================================

/// Thread identity (pid + tid)
///
/// Keys VFS I/O and client operation pairing. Unique per concurrently
/// executing call on a thread.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadKey {
    /// Thread group id (user-visible pid)
    pub pid: u32,
    /// Kernel thread id
    pub tid: u32,
}

impl ThreadKey {
    /// Split a `bpf_get_current_pid_tgid()` value
    #[inline(always)]
    pub const fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self {
            pid: (pid_tgid >> 32) as u32,
            tid: pid_tgid as u32,
        }
    }
}

/// RPC task identity
///
/// `task_id` is zero for the placeholder written at submission time, before
/// the kernel has assigned the task an id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcKey {
    pub task_id: u32,
    pub client_id: u32,
}

impl RpcKey {
    /// Key used between submission and the first lifecycle tracepoint
    #[inline(always)]
    pub const fn placeholder(client_id: u32) -> Self {
        Self { task_id: 0, client_id }
    }
}

/// NFSv4 server operation identity
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NfsdOpKey {
    /// Discriminant of [`crate::registry::NfsdOp`]
    pub op_type: u32,
    pub pid: u32,
}

// ============================================================================
// VFS I/O
// ============================================================================

/// In-flight VFS read/write
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IoStart {
    /// Entry timestamp (nanoseconds, monotonic)
    pub timestamp: u64,
    /// Dentry name, NUL terminated
    pub file: [u8; FILE_NAME_LEN],
    /// 1 when the kiocb carried IOCB_DIRECT
    pub is_direct: u8,
    pub _padding: [u8; 7],
}

/// Completed VFS read/write
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IoEvent {
    /// Exit timestamp (nanoseconds)
    pub timestamp: u64,
    /// Measured latency (nanoseconds)
    pub latency_ns: u64,
    /// Return value of the traced function (bytes moved or -errno)
    pub size: i64,
    pub pid: u32,
    /// Discriminant of [`crate::registry::IoOp`]
    pub op: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub file: [u8; FILE_NAME_LEN],
    pub is_direct: u8,
    pub _padding: [u8; 7],
}

// ============================================================================
// Client Operations
// ============================================================================

/// In-flight client file/inode/dentry operation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OpStart {
    pub timestamp: u64,
}

/// Completed client operation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OpEvent {
    pub timestamp: u64,
    /// Measured latency (microseconds, truncated)
    pub latency_us: u64,
    pub pid: u32,
    /// Discriminant of [`crate::registry::ClientOp`]
    pub op: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

// ============================================================================
// NFSv4 Server Operations
// ============================================================================

/// In-flight server operation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NfsdOpStart {
    pub timestamp: u64,
    pub pid: u32,
    /// Transaction id of the request being served (0 when unknown)
    pub xid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Completed server operation
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NfsdOpEvent {
    pub timestamp: u64,
    /// Measured latency (microseconds, truncated)
    pub latency_us: u64,
    pub pid: u32,
    pub xid: u32,
    /// Discriminant of [`crate::registry::NfsdOp`]
    pub op: u32,
    pub _padding: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

// ============================================================================
// RPC Task Lifecycle
// ============================================================================

/// Lifecycle phase an [`RpcRecord`] was last written in
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcPhase {
    Submitted = 0,
    Begun = 1,
    CallDone = 2,
    End = 3,
}

impl RpcPhase {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Submitted),
            1 => Some(Self::Begun),
            2 => Some(Self::CallDone),
            3 => Some(Self::End),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Begun => "begun",
            Self::CallDone => "call_done",
            Self::End => "end",
        }
    }
}

/// RPC task state, stored in flight and emitted at call-done and task-end
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcRecord {
    /// Submission time, refreshed when the task id is bound
    pub timestamp: u64,
    /// Begin to wakeup (nanoseconds)
    pub wake_lat: u64,
    /// Begin to task end (nanoseconds)
    pub end_lat: u64,
    /// Address of the last call-done action
    pub end_action: u64,
    /// Owning process
    pub owner: u32,
    /// [`RpcPhase`] discriminant
    pub phase: u32,
    pub task_id: u32,
    pub client_id: u32,
    /// Procedure name captured at submission
    pub proc_name: [u8; PROC_NAME_LEN],
}

impl RpcRecord {
    pub fn phase(&self) -> Option<RpcPhase> {
        RpcPhase::from_u32(self.phase)
    }
}

/// Waiting-RPC link used for IOPS tracking
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcTaskInfo {
    /// Start of the VFS call that caused the RPC
    pub timestamp: u64,
    pub pid: u32,
    pub _padding: u32,
}

/// Non-zero status observed by an RPC lifecycle tracepoint
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorEvent {
    pub timestamp: u64,
    pub status: i64,
    pub pid: u32,
    pub task_id: u32,
    /// Empty when no record was paired
    pub proc_name: [u8; PROC_NAME_LEN],
}

// ============================================================================
// Packet Classifier
// ============================================================================

/// One classified packet
///
/// Addresses and ports are stored in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: u64,
    /// Transport payload bytes (accumulated across packets on the XID path)
    pub data_size: u64,
    /// RPC transaction id, 0 when none was extracted
    pub xid: u32,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// 1 when the payload is an NFSv4 COMPOUND call
    pub nfs_compound: u8,
    pub _padding: [u8; 6],
}

/// Global running packet counters
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub total_packets: u64,
    pub nfs_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub total_bytes: u64,
    pub nfs_bytes: u64,
}

/// Packet filter set at load time
///
/// Host byte order. A zero field is unset and matches everything.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketFilter {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub _padding: [u8; 3],
}

// ============================================================================
// Fixed Strings
// ============================================================================

/// Copy `src` into a fixed buffer, truncating and keeping a NUL terminator
#[inline(always)]
pub fn fill_name<const N: usize>(dst: &mut [u8; N], src: &[u8]) {
    let mut i = 0;
    while i + 1 < N && i < src.len() && src[i] != 0 {
        dst[i] = src[i];
        i += 1;
    }
    while i < N {
        dst[i] = 0;
        i += 1;
    }
}

/// View a NUL-terminated fixed buffer as text
///
/// Invalid UTF-8 yields the longest valid prefix.
pub fn name_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match core::str::from_utf8(&buf[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or(""),
    }
}

// Compile-time size and alignment checks
const _: () = {
    assert!(core::mem::size_of::<ThreadKey>() == 8);
    assert!(core::mem::size_of::<RpcKey>() == 8);
    assert!(core::mem::size_of::<NfsdOpKey>() == 8);
    assert!(core::mem::size_of::<IoStart>() == 48);
    assert!(core::mem::size_of::<IoEvent>() == 88);
    assert!(core::mem::size_of::<OpEvent>() == 40);
    assert!(core::mem::size_of::<NfsdOpStart>() == 32);
    assert!(core::mem::size_of::<NfsdOpEvent>() == 48);
    assert!(core::mem::size_of::<RpcRecord>() == 80);
    assert!(core::mem::size_of::<RpcTaskInfo>() == 16);
    assert!(core::mem::size_of::<ErrorEvent>() == 56);
    assert!(core::mem::size_of::<PacketRecord>() == 40);
    assert!(core::mem::size_of::<PacketStats>() == 48);
    assert!(core::mem::size_of::<PacketFilter>() == 16);
    assert!(core::mem::size_of::<RpcRecord>() % core::mem::align_of::<RpcRecord>() == 0);
    assert!(core::mem::size_of::<PacketRecord>() % core::mem::align_of::<PacketRecord>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for ThreadKey {}
    unsafe impl aya::Pod for RpcKey {}
    unsafe impl aya::Pod for NfsdOpKey {}
    unsafe impl aya::Pod for IoEvent {}
    unsafe impl aya::Pod for OpEvent {}
    unsafe impl aya::Pod for NfsdOpEvent {}
    unsafe impl aya::Pod for RpcRecord {}
    unsafe impl aya::Pod for RpcTaskInfo {}
    unsafe impl aya::Pod for ErrorEvent {}
    unsafe impl aya::Pod for PacketRecord {}
    unsafe impl aya::Pod for PacketStats {}
    unsafe impl aya::Pod for PacketFilter {}
}
