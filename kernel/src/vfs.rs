//! NFS client probes
//!
//! VFS read/write entry points (timed in nanoseconds, with file name and
//! direct-I/O flag) and the client file/inode/dentry operations (timed in
//! microseconds). Pairing is per thread.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::debug;
use nfsdig_common::{
    constants::FILE_NAME_LEN,
    fault,
    pairing::{io_entry, io_exit, op_entry, op_exit},
    ClientOp, IoOp, Outcome,
};

use crate::{
    helpers::*,
    kernel_types::{file_name, kiocb_file, kiocb_is_direct},
    maps::*,
};

// ============================================================================
// VFS Read/Write
// ============================================================================

/// Where the traced function keeps its `struct file *`
#[derive(Clone, Copy)]
enum FileArg {
    /// Argument `n` is a `struct kiocb *`
    Kiocb(usize),
    /// Argument `n` is a `struct file *`
    File(usize),
}

#[inline(always)]
fn try_io_entry(ctx: &ProbeContext, arg: FileArg) -> Result<Outcome, i64> {
    let mut name = [0u8; FILE_NAME_LEN];
    let is_direct = match arg {
        FileArg::Kiocb(n) => {
            let iocb: *const u8 = ctx.arg(n).ok_or(-1i64)?;
            if let Ok(file) = kiocb_file(iocb) {
                let _ = file_name(file, &mut name);
            }
            kiocb_is_direct(iocb)
        }
        FileArg::File(n) => {
            let file: *const u8 = ctx.arg(n).ok_or(-1i64)?;
            let _ = file_name(file, &mut name);
            false
        }
    };
    Ok(io_entry(
        &probe_ctx(),
        filter_pid(),
        &name,
        is_direct,
        &mut MapStore(&IO_STARTS),
        &mut MapStore(&LINK_BEGIN),
    ))
}

#[inline(always)]
fn try_io_exit(ctx: &RetProbeContext, op: IoOp) -> Result<Outcome, i64> {
    let ret: i64 = ctx.ret().unwrap_or(0);
    let outcome = io_exit(&probe_ctx(), op, ret, &mut MapStore(&IO_STARTS), &mut QueueSink(&IO_EVENTS));
    if outcome == Outcome::QueueFull {
        debug!(ctx, "io event dropped: queue full");
    }
    Ok(outcome)
}

macro_rules! io_probe {
    ($entry:ident, $exit:ident, $op:expr, $arg:expr) => {
        #[kprobe]
        pub fn $entry(ctx: ProbeContext) -> u32 {
            match try_io_entry(&ctx, $arg) {
                Ok(outcome) => finish(outcome),
                Err(_) => 0,
            }
        }

        #[kretprobe]
        pub fn $exit(ctx: RetProbeContext) -> u32 {
            match try_io_exit(&ctx, $op) {
                Ok(outcome) => finish(outcome),
                Err(_) => 0,
            }
        }
    };
}

io_probe!(trace_entry_nfs_file_read, trace_exit_nfs_file_read, IoOp::Read, FileArg::Kiocb(0));
io_probe!(trace_entry_nfs_file_write, trace_exit_nfs_file_write, IoOp::Write, FileArg::Kiocb(0));
io_probe!(
    trace_entry_nfs_file_splice_read,
    trace_exit_nfs_file_splice_read,
    IoOp::SpliceRead,
    FileArg::File(0)
);
io_probe!(
    trace_entry_iter_file_splice_write,
    trace_exit_iter_file_splice_write,
    IoOp::SpliceWrite,
    FileArg::File(1)
);

// ============================================================================
// Client Operations
// ============================================================================

#[inline(always)]
fn op_entry_handler() -> u32 {
    finish(op_entry(&probe_ctx(), filter_pid(), &mut MapStore(&OP_STARTS)))
}

#[inline(always)]
fn op_exit_handler(op: ClientOp) -> u32 {
    finish(op_exit(&probe_ctx(), op, &mut MapStore(&OP_STARTS), &mut QueueSink(&OP_EVENTS)))
}

macro_rules! client_op {
    ($($entry:ident, $exit:ident => $op:expr;)+) => {
        $(
            #[kprobe]
            pub fn $entry(_ctx: ProbeContext) -> u32 {
                op_entry_handler()
            }

            #[kretprobe]
            pub fn $exit(_ctx: RetProbeContext) -> u32 {
                op_exit_handler($op)
            }
        )+
    };
}

client_op! {
    trace_entry_nfs_file_mmap, trace_exit_nfs_file_mmap => ClientOp::FileMmap;
    trace_entry_nfs4_file_open, trace_exit_nfs4_file_open => ClientOp::FileOpen;
    trace_entry_nfs4_file_flush, trace_exit_nfs4_file_flush => ClientOp::FileFlush;
    trace_entry_nfs_file_release, trace_exit_nfs_file_release => ClientOp::FileRelease;
    trace_entry_nfs_file_fsync, trace_exit_nfs_file_fsync => ClientOp::FileFsync;
    trace_entry_nfs_lock, trace_exit_nfs_lock => ClientOp::Lock;
    trace_entry_nfs_flock, trace_exit_nfs_flock => ClientOp::Flock;
    trace_entry_nfs_check_flags, trace_exit_nfs_check_flags => ClientOp::CheckFlags;
    trace_entry_nfs4_setlease, trace_exit_nfs4_setlease => ClientOp::SetLease;
    trace_entry_nfs4_copy_file_range, trace_exit_nfs4_copy_file_range => ClientOp::CopyFileRange;
    trace_entry_nfs4_file_llseek, trace_exit_nfs4_file_llseek => ClientOp::FileLlseek;
    trace_entry_nfs42_fallocate, trace_exit_nfs42_fallocate => ClientOp::Fallocate;
    trace_entry_nfs42_remap_file_range, trace_exit_nfs42_remap_file_range => ClientOp::RemapFileRange;
    trace_entry_nfs_create, trace_exit_nfs_create => ClientOp::Create;
    trace_entry_nfs_lookup, trace_exit_nfs_lookup => ClientOp::Lookup;
    trace_entry_nfs_atomic_open, trace_exit_nfs_atomic_open => ClientOp::AtomicOpen;
    trace_entry_nfs_link, trace_exit_nfs_link => ClientOp::Link;
    trace_entry_nfs_unlink, trace_exit_nfs_unlink => ClientOp::Unlink;
    trace_entry_nfs_symlink, trace_exit_nfs_symlink => ClientOp::Symlink;
    trace_entry_nfs_mkdir, trace_exit_nfs_mkdir => ClientOp::Mkdir;
    trace_entry_nfs_rmdir, trace_exit_nfs_rmdir => ClientOp::Rmdir;
    trace_entry_nfs_mknod, trace_exit_nfs_mknod => ClientOp::Mknod;
    trace_entry_nfs_rename, trace_exit_nfs_rename => ClientOp::Rename;
    trace_entry_nfs_getattr, trace_exit_nfs_getattr => ClientOp::Getattr;
    trace_entry_nfs_setattr, trace_exit_nfs_setattr => ClientOp::Setattr;
    trace_entry_nfs4_listxattr, trace_exit_nfs4_listxattr => ClientOp::Listxattr;
    trace_entry_nfs4_lookup_revalidate, trace_exit_nfs4_lookup_revalidate => ClientOp::LookupRevalidate;
    trace_entry_nfs_weak_revalidate, trace_exit_nfs_weak_revalidate => ClientOp::WeakRevalidate;
    trace_entry_nfs_dentry_delete, trace_exit_nfs_dentry_delete => ClientOp::DentryDelete;
    trace_entry_nfs_dentry_iput, trace_exit_nfs_dentry_iput => ClientOp::DentryIput;
    trace_entry_nfs_d_automount, trace_exit_nfs_d_automount => ClientOp::DAutomount;
    trace_entry_nfs_d_release, trace_exit_nfs_d_release => ClientOp::DRelease;
}

// ============================================================================
// nfs_permission (fault injection)
// ============================================================================

#[kprobe]
pub fn trace_entry_nfs_permission(_ctx: ProbeContext) -> u32 {
    op_entry_handler()
}

/// Optionally stall before timing, so the delay shows up in the latency
#[kretprobe]
pub fn trace_exit_nfs_permission(ctx: RetProbeContext) -> u32 {
    let now = get_timestamp();
    if fault::should_inject(now, delay_probability()) {
        let spins = fault::spin_until(fault::delay_deadline(now, delay_us()), get_timestamp);
        debug!(&ctx, "nfs_permission: delayed, {} clock reads", spins);
    }
    op_exit_handler(ClientOp::Permission)
}
