//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! draining, aggregation and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from nfsdig_common)
//! - **Userspace Types**: Types used only in userspace for aggregation and export

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the nfsdig-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use nfsdig_common::constants;
    pub use nfsdig_common::types::{
        ErrorEvent, IoEvent, NfsdOpEvent, OpEvent, PacketRecord, PacketStats, RpcPhase, RpcRecord,
    };
}

pub use kernel::{ErrorEvent, IoEvent, NfsdOpEvent, OpEvent, PacketRecord, PacketStats, RpcRecord};

use kernel::constants::MAX_STATS;

/// Everything drained from the probes in one interval
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub io: Vec<IoEvent>,
    pub ops: Vec<OpEvent>,
    pub nfsd: Vec<NfsdOpEvent>,
    pub rpc: Vec<RpcRecord>,
    pub errors: Vec<ErrorEvent>,
    /// Per-packet records
    pub packets: Vec<PacketRecord>,
    /// COMPOUND calls aggregated by transaction id
    pub compounds: Vec<PacketRecord>,
    /// Running packet counters (cumulative since load)
    pub packet_stats: PacketStats,
    /// Probe health counters (cumulative since load)
    pub probe_stats: [u64; MAX_STATS as usize],
    /// (pid, I/O start) pairs whose RPC task completed
    pub linked: Vec<(u32, u64)>,
}

impl Batch {
    /// Number of completed events in the batch
    pub fn event_count(&self) -> usize {
        self.io.len() + self.ops.len() + self.nfsd.len() + self.rpc.len() + self.errors.len()
    }
}

// ============================================================================
// Interval Report
// ============================================================================

/// VFS read/write totals for one interval
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct IoSummary {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Average read latency in the output unit
    pub read_latency: Option<u64>,
    /// Average write latency in the output unit
    pub write_latency: Option<u64>,
}

/// RPC totals for one interval
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcSummary {
    /// Completed tasks (end phase)
    pub calls: u64,
    pub avg_wake_latency: Option<u64>,
    pub avg_end_latency: Option<u64>,
}

/// Packet counters for one interval
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct XdpSummary {
    pub total_packets: u64,
    pub nfs_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub total_bytes: u64,
    pub nfs_bytes: u64,
    /// Packets that passed the filter and were recorded
    pub recorded_packets: u64,
}

/// Probe family a trace row belongs to
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Io,
    Ops,
    Nfsd,
    Rpc,
}

impl Family {
    pub const ALL: [Family; 4] = [Family::Io, Family::Ops, Family::Nfsd, Family::Rpc];

    /// CSV file the family is written to
    pub fn file_name(self) -> &'static str {
        match self {
            Family::Io => "io.csv",
            Family::Ops => "ops.csv",
            Family::Nfsd => "nfsd.csv",
            Family::Rpc => "rpc.csv",
        }
    }
}

/// One completed event, ready for a trace-mode CSV row
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    pub family: Family,
    pub pid: u32,
    pub comm: String,
    /// Traced kernel function or RPC procedure
    pub syscall: String,
    /// Latency in the output unit
    pub latency: u64,
    /// Byte count, status or xid, when the family has one
    pub ret: Option<i64>,
}

/// A non-zero RPC status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorRow {
    pub pid: u32,
    pub proc_name: String,
    pub status: i64,
}

/// A COMPOUND exchange seen by the classifier
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompoundRow {
    pub xid: u32,
    pub source: String,
    pub destination: String,
    pub protocol: u8,
    pub data_size: u64,
}

/// What one drain interval produced
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct IntervalReport {
    /// Average latency per selected client op, in column order
    pub ops: Vec<Option<u64>>,
    /// Average latency per selected server op, in column order
    pub nfsd: Vec<Option<u64>>,
    pub io: IoSummary,
    pub rpc: RpcSummary,
    pub xdp: XdpSummary,
    /// I/O completions linked to an RPC task, per pid
    pub linked_ios: BTreeMap<u32, u64>,
    pub traces: Vec<TraceRow>,
    pub errors: Vec<ErrorRow>,
    pub compounds: Vec<CompoundRow>,
}

// ============================================================================
// Run Summary
// ============================================================================

/// Totals over the whole run, written as JSON on shutdown
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct RunSummary {
    /// ISO 8601 timestamp when the run ended
    pub timestamp: String,
    pub duration_seconds: u64,
    pub intervals: u64,
    pub io_events: u64,
    pub op_events: u64,
    pub nfsd_events: u64,
    pub rpc_events: u64,
    pub errors: u64,
    pub linked_ios: u64,
    /// Latest packet counters
    pub packets: XdpSummary,
    /// Probe health counters by name
    pub probe_stats: BTreeMap<String, u64>,
}
