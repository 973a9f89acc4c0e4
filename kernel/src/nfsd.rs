//! NFSv4 server operation probes
//!
//! Every `nfsd4_*` operation handler gets an entry/exit pair keyed by
//! (op, pid), so one nfsd thread may have several distinct operations of a
//! COMPOUND in flight. The first argument is the `struct svc_rqst *` whose
//! transaction id travels into the event.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use nfsdig_common::{
    pairing::{nfsd_op_entry, nfsd_op_exit},
    NfsdOp,
};

use crate::{
    helpers::*,
    kernel_types::svc_rqst_xid,
    maps::*,
};

#[inline(always)]
fn nfsd_entry_handler(ctx: &ProbeContext, op: NfsdOp) -> u32 {
    let xid = match ctx.arg::<*const u8>(0) {
        Some(rqst) => svc_rqst_xid(rqst),
        None => 0,
    };
    finish(nfsd_op_entry(
        &probe_ctx(),
        filter_pid(),
        op,
        xid,
        &mut MapStore(&NFSD_OP_STARTS),
    ))
}

#[inline(always)]
fn nfsd_exit_handler(op: NfsdOp) -> u32 {
    finish(nfsd_op_exit(
        &probe_ctx(),
        op,
        &mut MapStore(&NFSD_OP_STARTS),
        &mut QueueSink(&NFSD_OP_EVENTS),
    ))
}

macro_rules! nfsd_op {
    ($($entry:ident, $exit:ident => $op:expr;)+) => {
        $(
            #[kprobe]
            pub fn $entry(ctx: ProbeContext) -> u32 {
                nfsd_entry_handler(&ctx, $op)
            }

            #[kretprobe]
            pub fn $exit(_ctx: RetProbeContext) -> u32 {
                nfsd_exit_handler($op)
            }
        )+
    };
}

nfsd_op! {
    trace_entry_nfsd4_access, trace_exit_nfsd4_access => NfsdOp::Access;
    trace_entry_nfsd4_close, trace_exit_nfsd4_close => NfsdOp::Close;
    trace_entry_nfsd4_commit, trace_exit_nfsd4_commit => NfsdOp::Commit;
    trace_entry_nfsd4_create, trace_exit_nfsd4_create => NfsdOp::Create;
    trace_entry_nfsd4_delegreturn, trace_exit_nfsd4_delegreturn => NfsdOp::Delegreturn;
    trace_entry_nfsd4_getattr, trace_exit_nfsd4_getattr => NfsdOp::Getattr;
    trace_entry_nfsd4_getfh, trace_exit_nfsd4_getfh => NfsdOp::Getfh;
    trace_entry_nfsd4_link, trace_exit_nfsd4_link => NfsdOp::Link;
    trace_entry_nfsd4_lock, trace_exit_nfsd4_lock => NfsdOp::Lock;
    trace_entry_nfsd4_lockt, trace_exit_nfsd4_lockt => NfsdOp::Lockt;
    trace_entry_nfsd4_locku, trace_exit_nfsd4_locku => NfsdOp::Locku;
    trace_entry_nfsd4_lookup, trace_exit_nfsd4_lookup => NfsdOp::Lookup;
    trace_entry_nfsd4_lookupp, trace_exit_nfsd4_lookupp => NfsdOp::Lookupp;
    trace_entry_nfsd4_nverify, trace_exit_nfsd4_nverify => NfsdOp::Nverify;
    trace_entry_nfsd4_open, trace_exit_nfsd4_open => NfsdOp::Open;
    trace_entry_nfsd4_open_confirm, trace_exit_nfsd4_open_confirm => NfsdOp::OpenConfirm;
    trace_entry_nfsd4_open_downgrade, trace_exit_nfsd4_open_downgrade => NfsdOp::OpenDowngrade;
    trace_entry_nfsd4_putfh, trace_exit_nfsd4_putfh => NfsdOp::Putfh;
    trace_entry_nfsd4_putrootfh, trace_exit_nfsd4_putrootfh => NfsdOp::Putrootfh;
    trace_entry_nfsd4_read, trace_exit_nfsd4_read => NfsdOp::Read;
    trace_entry_nfsd4_readdir, trace_exit_nfsd4_readdir => NfsdOp::Readdir;
    trace_entry_nfsd4_readlink, trace_exit_nfsd4_readlink => NfsdOp::Readlink;
    trace_entry_nfsd4_remove, trace_exit_nfsd4_remove => NfsdOp::Remove;
    trace_entry_nfsd4_rename, trace_exit_nfsd4_rename => NfsdOp::Rename;
    trace_entry_nfsd4_renew, trace_exit_nfsd4_renew => NfsdOp::Renew;
    trace_entry_nfsd4_restorefh, trace_exit_nfsd4_restorefh => NfsdOp::Restorefh;
    trace_entry_nfsd4_savefh, trace_exit_nfsd4_savefh => NfsdOp::Savefh;
    trace_entry_nfsd4_secinfo, trace_exit_nfsd4_secinfo => NfsdOp::Secinfo;
    trace_entry_nfsd4_setattr, trace_exit_nfsd4_setattr => NfsdOp::Setattr;
    trace_entry_nfsd4_setclientid, trace_exit_nfsd4_setclientid => NfsdOp::Setclientid;
    trace_entry_nfsd4_setclientid_confirm, trace_exit_nfsd4_setclientid_confirm => NfsdOp::SetclientidConfirm;
    trace_entry_nfsd4_verify, trace_exit_nfsd4_verify => NfsdOp::Verify;
    trace_entry_nfsd4_write, trace_exit_nfsd4_write => NfsdOp::Write;
    trace_entry_nfsd4_release_lockowner, trace_exit_nfsd4_release_lockowner => NfsdOp::ReleaseLockowner;
    trace_entry_nfsd4_exchange_id, trace_exit_nfsd4_exchange_id => NfsdOp::ExchangeId;
    trace_entry_nfsd4_backchannel_ctl, trace_exit_nfsd4_backchannel_ctl => NfsdOp::BackchannelCtl;
    trace_entry_nfsd4_bind_conn_to_session, trace_exit_nfsd4_bind_conn_to_session => NfsdOp::BindConnToSession;
    trace_entry_nfsd4_create_session, trace_exit_nfsd4_create_session => NfsdOp::CreateSession;
    trace_entry_nfsd4_destroy_session, trace_exit_nfsd4_destroy_session => NfsdOp::DestroySession;
    trace_entry_nfsd4_sequence, trace_exit_nfsd4_sequence => NfsdOp::Sequence;
    trace_entry_nfsd4_destroy_clientid, trace_exit_nfsd4_destroy_clientid => NfsdOp::DestroyClientid;
    trace_entry_nfsd4_reclaim_complete, trace_exit_nfsd4_reclaim_complete => NfsdOp::ReclaimComplete;
    trace_entry_nfsd4_secinfo_no_name, trace_exit_nfsd4_secinfo_no_name => NfsdOp::SecinfoNoName;
    trace_entry_nfsd4_test_stateid, trace_exit_nfsd4_test_stateid => NfsdOp::TestStateid;
    trace_entry_nfsd4_free_stateid, trace_exit_nfsd4_free_stateid => NfsdOp::FreeStateid;
    trace_entry_nfsd4_getdeviceinfo, trace_exit_nfsd4_getdeviceinfo => NfsdOp::Getdeviceinfo;
    trace_entry_nfsd4_layoutget, trace_exit_nfsd4_layoutget => NfsdOp::Layoutget;
    trace_entry_nfsd4_layoutcommit, trace_exit_nfsd4_layoutcommit => NfsdOp::Layoutcommit;
    trace_entry_nfsd4_layoutreturn, trace_exit_nfsd4_layoutreturn => NfsdOp::Layoutreturn;
    trace_entry_nfsd4_allocate, trace_exit_nfsd4_allocate => NfsdOp::Allocate;
    trace_entry_nfsd4_deallocate, trace_exit_nfsd4_deallocate => NfsdOp::Deallocate;
    trace_entry_nfsd4_clone, trace_exit_nfsd4_clone => NfsdOp::CloneRange;
    trace_entry_nfsd4_copy, trace_exit_nfsd4_copy => NfsdOp::CopyRange;
    trace_entry_nfsd4_seek, trace_exit_nfsd4_seek => NfsdOp::Seek;
    trace_entry_nfsd4_offload_status, trace_exit_nfsd4_offload_status => NfsdOp::OffloadStatus;
    trace_entry_nfsd4_offload_cancel, trace_exit_nfsd4_offload_cancel => NfsdOp::OffloadCancel;
    trace_entry_nfsd4_copy_notify, trace_exit_nfsd4_copy_notify => NfsdOp::CopyNotify;
    trace_entry_nfsd4_getxattr, trace_exit_nfsd4_getxattr => NfsdOp::Getxattr;
    trace_entry_nfsd4_setxattr, trace_exit_nfsd4_setxattr => NfsdOp::Setxattr;
    trace_entry_nfsd4_listxattrs, trace_exit_nfsd4_listxattrs => NfsdOp::Listxattrs;
    trace_entry_nfsd4_removexattr, trace_exit_nfsd4_removexattr => NfsdOp::Removexattr;
}
