//! Kernel structure access
//!
//! Partial layouts of the kernel structures the probes read, expressed as
//! field offsets (x86_64, 6.x kernels). A layout mismatch shows up as
//! failed or garbage reads, never as a fault.

use aya_ebpf::{
    helpers::{bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes},
    programs::TracePointContext,
};
use nfsdig_common::{constants::IOCB_DIRECT, rpc::RpcTaskArgs};

// struct kiocb
const KIOCB_KI_FILP: usize = 0;
const KIOCB_KI_FLAGS: usize = 32;

// struct file -> f_path.dentry
const FILE_F_PATH_DENTRY: usize = 16 + 8;

// struct dentry -> d_name.name
const DENTRY_D_NAME_NAME: usize = 32 + 8;

// struct rpc_task
const RPC_TASK_TK_MSG_RPC_PROC: usize = 112;
const RPC_TASK_TK_CLIENT: usize = 160;
const RPC_TASK_TK_OWNER: usize = 208;

// struct rpc_procinfo
const RPC_PROCINFO_P_NAME: usize = 40;

// struct rpc_clnt
const RPC_CLNT_CL_CLID: usize = 4;

// struct svc_rqst
const SVC_RQST_RQ_XID: usize = 1256;

// sunrpc:rpc_task_* tracepoint record (after the 8-byte common header)
const TP_TASK_ID: usize = 8;
const TP_CLIENT_ID: usize = 12;
const TP_ACTION: usize = 16;
const TP_STATUS: usize = 32;

/// Read a `T` at `base + offset`
#[inline(always)]
pub fn read_field<T>(base: *const u8, offset: usize) -> Result<T, i64> {
    if base.is_null() {
        return Err(-1);
    }
    unsafe { bpf_probe_read_kernel(base.add(offset) as *const T) }
}

/// Copy a NUL-terminated kernel string into `dst`
#[inline(always)]
pub fn read_str(src: *const u8, dst: &mut [u8]) -> Result<(), i64> {
    if src.is_null() {
        return Err(-1);
    }
    unsafe { bpf_probe_read_kernel_str_bytes(src, dst) }?;
    Ok(())
}

// ============================================================================
// VFS
// ============================================================================

/// Name of the dentry behind a `struct file *`
#[inline(always)]
pub fn file_name(file: *const u8, dst: &mut [u8]) -> Result<(), i64> {
    let dentry: *const u8 = read_field(file, FILE_F_PATH_DENTRY)?;
    let name: *const u8 = read_field(dentry, DENTRY_D_NAME_NAME)?;
    read_str(name, dst)
}

/// File behind a `struct kiocb *`
#[inline(always)]
pub fn kiocb_file(iocb: *const u8) -> Result<*const u8, i64> {
    read_field(iocb, KIOCB_KI_FILP)
}

/// Whether a `struct kiocb *` carries IOCB_DIRECT
#[inline(always)]
pub fn kiocb_is_direct(iocb: *const u8) -> bool {
    match read_field::<u32>(iocb, KIOCB_KI_FLAGS) {
        Ok(flags) => flags & IOCB_DIRECT != 0,
        Err(_) => false,
    }
}

// ============================================================================
// SUNRPC
// ============================================================================

/// What `rpc_execute` needs from a `struct rpc_task *`
pub struct TaskSubmission {
    pub client_id: u32,
    pub owner: u32,
    pub proc_name: *const u8,
}

#[inline(always)]
pub fn rpc_task_submission(task: *const u8) -> Result<TaskSubmission, i64> {
    let procinfo: *const u8 = read_field(task, RPC_TASK_TK_MSG_RPC_PROC)?;
    let clnt: *const u8 = read_field(task, RPC_TASK_TK_CLIENT)?;
    Ok(TaskSubmission {
        client_id: read_field(clnt, RPC_CLNT_CL_CLID)?,
        owner: read_field(task, RPC_TASK_TK_OWNER)?,
        proc_name: read_field(procinfo, RPC_PROCINFO_P_NAME).unwrap_or(core::ptr::null()),
    })
}

/// Transaction id of the request a `struct svc_rqst *` is serving
#[inline(always)]
pub fn svc_rqst_xid(rqst: *const u8) -> u32 {
    read_field::<u32>(rqst, SVC_RQST_RQ_XID)
        .map(u32::from_be)
        .unwrap_or(0)
}

/// Decode a `sunrpc:rpc_task_*` tracepoint record
#[inline(always)]
pub fn rpc_task_args(ctx: &TracePointContext) -> Result<RpcTaskArgs, i64> {
    unsafe {
        Ok(RpcTaskArgs {
            task_id: ctx.read_at::<u32>(TP_TASK_ID)?,
            client_id: ctx.read_at::<u32>(TP_CLIENT_ID)?,
            action: ctx.read_at::<u64>(TP_ACTION)?,
            status: ctx.read_at::<i32>(TP_STATUS)? as i64,
        })
    }
}
