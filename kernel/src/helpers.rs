//! Helper functions for eBPF programs
//!
//! Wrappers around BPF helpers, load-time configuration globals and the
//! probe health counters.

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns};
use nfsdig_common::{types::PacketFilter, Outcome, ProbeCtx};

use crate::maps::STATS;

// ============================================================================
// Load-time Configuration
// ============================================================================
//
// Read-only globals patched by the loader before the programs are verified.

/// Only trace this process (0 = all)
#[no_mangle]
static FILTER_PID: u32 = 0;

/// Chance (percent) of delaying an `nfs_permission` exit
#[no_mangle]
static DELAY_PROBABILITY: u64 = 0;

/// Injected delay (microseconds)
#[no_mangle]
static DELAY_US: u32 = 20;

/// XDP address/port/protocol filter
#[no_mangle]
static PACKET_FILTER: PacketFilter = PacketFilter {
    src_ip: 0,
    dst_ip: 0,
    src_port: 2049,
    dst_port: 2049,
    protocol: 0,
    _padding: [0; 3],
};

#[inline(always)]
pub fn filter_pid() -> u32 {
    unsafe { core::ptr::read_volatile(&FILTER_PID) }
}

#[inline(always)]
pub fn delay_probability() -> u64 {
    unsafe { core::ptr::read_volatile(&DELAY_PROBABILITY) }
}

#[inline(always)]
pub fn delay_us() -> u32 {
    unsafe { core::ptr::read_volatile(&DELAY_US) }
}

#[inline(always)]
pub fn packet_filter() -> PacketFilter {
    unsafe { core::ptr::read_volatile(&PACKET_FILTER) }
}

// ============================================================================
// Current Task
// ============================================================================

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Snapshot of the current task for the correlation core
#[inline(always)]
pub fn probe_ctx() -> ProbeCtx {
    ProbeCtx {
        now: get_timestamp(),
        pid_tgid: bpf_get_current_pid_tgid(),
        comm: bpf_get_current_comm().unwrap_or([0u8; 16]),
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Increment a statistics counter
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    unsafe {
        if let Some(count) = STATS.get_ptr_mut(stat_id) {
            *count += 1;
        }
    }
}

/// Count a handler outcome and turn it into the program return value
#[inline(always)]
pub fn finish(outcome: Outcome) -> u32 {
    if let Some(stat_id) = outcome.stat_index() {
        increment_stat(stat_id);
    }
    0
}
