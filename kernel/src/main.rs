//! nfsdig - Kernel Space Programs
//!
//! Probes on the Linux NFS client, the NFS server and the SUNRPC layer,
//! plus an XDP classifier for NFS traffic. Each probe is a thin adapter:
//! it reads its arguments out of kernel structures and hands them to the
//! correlation core in `nfsdig-common`, with the BPF maps wrapped as
//! stores and sinks.
//!
//! ## Architecture
//!
//! ```text
//! kprobe  nfs_file_read/...     -> IO_STARTS ----+
//! kretprobe                     -> IO_EVENTS     |  LINK_BEGIN[pid]
//!                                                v
//! kprobe  rpc_execute           -> RPC_TASKS[(0, client)]
//! tp      rpc_task_begin        -> RPC_TASKS[(task, client)] -> WAITING_RPC[task]
//! tp      rpc_task_wakeup/...   -> RPC_EVENTS
//! tp      rpc_task_end          -> RPC_EVENTS, LINK_END[pid]
//!
//! kprobe/kretprobe nfs_*        -> OP_STARTS -> OP_EVENTS
//! kprobe/kretprobe nfsd4_*      -> NFSD_OP_STARTS -> NFSD_OP_EVENTS
//! xdp                           -> PACKET_STATS, PACKET_RECORDS, XID_RECORDS
//!
//! Userspace                     -> drain queues and maps, export CSV
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The resulting object is loaded by the `nfsdig` daemon.

#![no_std]
#![no_main]

mod helpers;
mod kernel_types;
mod maps;
mod nfsd;
mod rpc;
mod vfs;
mod xdp;

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
