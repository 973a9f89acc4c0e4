//! RPC task lifecycle probes
//!
//! `rpc_execute` (kprobe) stores the placeholder record; the four
//! `sunrpc:rpc_task_*` tracepoints drive it through begin, wakeup,
//! call-done and end.

use aya_ebpf::{
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::warn;
use nfsdig_common::{constants::PROC_NAME_LEN, pairing::ProbeCtx, rpc::RpcTaskArgs, Outcome, RpcMaps};

use crate::{
    helpers::*,
    kernel_types::{read_str, rpc_task_args, rpc_task_submission},
    maps::*,
};

type KernelRpcMaps = RpcMaps<
    MapStore<nfsdig_common::RpcKey, nfsdig_common::RpcRecord>,
    MapStore<u32, nfsdig_common::RpcTaskInfo>,
    MapStore<u32, u64>,
    MapStore<u32, u64>,
    QueueSink<nfsdig_common::RpcRecord>,
    QueueSink<nfsdig_common::ErrorEvent>,
>;

#[inline(always)]
fn rpc_maps() -> KernelRpcMaps {
    RpcMaps {
        tasks: MapStore(&RPC_TASKS),
        waiting: MapStore(&WAITING_RPC),
        link_begin: MapStore(&LINK_BEGIN),
        link_end: MapStore(&LINK_END),
        events: QueueSink(&RPC_EVENTS),
        errors: QueueSink(&ERROR_EVENTS),
    }
}

/// Track RPC task submission
///
/// Attached to: rpc_execute
#[kprobe]
pub fn rpc_execute(ctx: ProbeContext) -> u32 {
    match try_rpc_execute(&ctx) {
        Ok(outcome) => finish(outcome),
        Err(_) => 0,
    }
}

fn try_rpc_execute(ctx: &ProbeContext) -> Result<Outcome, i64> {
    let task: *const u8 = ctx.arg(0).ok_or(-1i64)?;
    let submission = rpc_task_submission(task)?;
    let mut proc_name = [0u8; PROC_NAME_LEN];
    let _ = read_str(submission.proc_name, &mut proc_name);

    let outcome = rpc_maps().submit(
        &probe_ctx(),
        filter_pid(),
        submission.client_id,
        submission.owner,
        &proc_name,
    );
    if outcome == Outcome::StoreFull {
        warn!(ctx, "rpc_execute: task map full, client {}", submission.client_id);
    }
    Ok(outcome)
}

#[inline(always)]
fn lifecycle<F>(ctx: &TracePointContext, phase: F) -> u32
where
    F: FnOnce(&mut KernelRpcMaps, &ProbeCtx, &RpcTaskArgs) -> Outcome,
{
    match rpc_task_args(ctx) {
        Ok(args) => finish(phase(&mut rpc_maps(), &probe_ctx(), &args)),
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn rpc_task_begin(ctx: TracePointContext) -> u32 {
    lifecycle(&ctx, KernelRpcMaps::task_begin)
}

#[tracepoint]
pub fn rpc_task_wakeup(ctx: TracePointContext) -> u32 {
    lifecycle(&ctx, KernelRpcMaps::task_wakeup)
}

#[tracepoint]
pub fn rpc_task_call_done(ctx: TracePointContext) -> u32 {
    lifecycle(&ctx, KernelRpcMaps::task_call_done)
}

#[tracepoint]
pub fn rpc_task_end(ctx: TracePointContext) -> u32 {
    lifecycle(&ctx, KernelRpcMaps::task_end)
}
