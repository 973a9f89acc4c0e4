//! RPC task lifecycle
//!
//! One RPC task is observed at five points: submission (`rpc_execute`) and
//! the `sunrpc` tracepoints task-begin, task-wakeup, task-call-done and
//! task-end. The task id is only known from task-begin on, so submission
//! stores a placeholder under `(0, client_id)` that task-begin re-keys.
//!
//! Call-done may fire several times for a retried call. Each firing emits a
//! `CallDone` copy of the record and leaves it in place. Task-end emits the
//! final `End` record and deletes it.
//!
//! A non-zero tracepoint status always produces an [`ErrorEvent`], whether
//! or not the task was paired.

use crate::constants::PROC_NAME_LEN;
use crate::emit::EventSink;
use crate::pairing::{emit, Outcome, ProbeCtx};
use crate::store::CorrelationStore;
use crate::types::*;

/// Fields shared by the `sunrpc:rpc_task_*` tracepoints
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcTaskArgs {
    pub task_id: u32,
    pub client_id: u32,
    /// Address of the task's current action
    pub action: u64,
    pub status: i64,
}

impl RpcTaskArgs {
    #[inline(always)]
    pub const fn key(&self) -> RpcKey {
        RpcKey {
            task_id: self.task_id,
            client_id: self.client_id,
        }
    }
}

/// Stores and sinks touched by the lifecycle handlers
pub struct RpcMaps<T, W, B, E, R, X> {
    /// In-flight task records
    pub tasks: T,
    /// task id -> start of the I/O that caused it
    pub waiting: W,
    /// pid -> start of its latest VFS I/O
    pub link_begin: B,
    /// pid -> start of the I/O whose RPC completed
    pub link_end: E,
    pub events: R,
    pub errors: X,
}

impl<T, W, B, E, R, X> RpcMaps<T, W, B, E, R, X>
where
    T: CorrelationStore<RpcKey, RpcRecord>,
    W: CorrelationStore<u32, RpcTaskInfo>,
    B: CorrelationStore<u32, u64>,
    E: CorrelationStore<u32, u64>,
    R: EventSink<RpcRecord>,
    X: EventSink<ErrorEvent>,
{
    /// Task submission: store the placeholder with owner and procedure name
    pub fn submit(&mut self, ctx: &ProbeCtx, filter_pid: u32, client_id: u32, owner: u32, proc_name: &[u8]) -> Outcome {
        if ctx.filtered_out(filter_pid) {
            return Outcome::Filtered;
        }
        let mut record = RpcRecord {
            timestamp: ctx.now,
            owner,
            phase: RpcPhase::Submitted as u32,
            client_id,
            ..Default::default()
        };
        fill_name(&mut record.proc_name, proc_name);
        match self.tasks.put(&RpcKey::placeholder(client_id), &record) {
            Ok(()) => Outcome::Recorded,
            Err(e) => e.into(),
        }
    }

    /// Task begin: bind the task id, then link the task to the caller's I/O
    pub fn task_begin(&mut self, ctx: &ProbeCtx, args: &RpcTaskArgs) -> Outcome {
        let mut outcome = Outcome::Miss;
        let mut proc_name = [0u8; PROC_NAME_LEN];

        if let Some(mut record) = self.tasks.take(&RpcKey::placeholder(args.client_id)) {
            record.timestamp = ctx.now;
            record.task_id = args.task_id;
            record.phase = RpcPhase::Begun as u32;
            proc_name = record.proc_name;
            outcome = match self.tasks.put(&args.key(), &record) {
                Ok(()) => Outcome::Recorded,
                Err(e) => e.into(),
            };
        }

        if args.status != 0 {
            return self.error(ctx, args, &proc_name);
        }

        let pid = ctx.pid();
        if let Some(started) = self.link_begin.get(&pid) {
            let info = RpcTaskInfo {
                timestamp: started,
                pid,
                _padding: 0,
            };
            let _ = self.waiting.get_or_init(&args.task_id, &info);
        }
        outcome
    }

    /// Task wakeup: record begin-to-wakeup latency in place
    pub fn task_wakeup(&mut self, ctx: &ProbeCtx, args: &RpcTaskArgs) -> Outcome {
        let now = ctx.now;
        let updated = self.tasks.update(&args.key(), |record| {
            record.wake_lat = now.saturating_sub(record.timestamp);
        });
        if args.status != 0 {
            return self.error(ctx, args, &proc_of(&updated));
        }
        match updated {
            Some(_) => Outcome::Updated,
            None => Outcome::Miss,
        }
    }

    /// Task call-done: emit the accumulated record, keep it for later phases
    pub fn task_call_done(&mut self, ctx: &ProbeCtx, args: &RpcTaskArgs) -> Outcome {
        let action = args.action;
        let updated = self.tasks.update(&args.key(), |record| {
            record.end_action = action;
            record.phase = RpcPhase::CallDone as u32;
        });
        let outcome = match &updated {
            Some(record) => emit(&mut self.events, record),
            None => Outcome::Miss,
        };
        if args.status != 0 {
            return self.error(ctx, args, &proc_of(&updated));
        }
        outcome
    }

    /// Task end: emit the final record, delete it and resolve the IOPS link
    pub fn task_end(&mut self, ctx: &ProbeCtx, args: &RpcTaskArgs) -> Outcome {
        let taken = self.tasks.take(&args.key());
        let outcome = match taken {
            Some(mut record) => {
                record.end_lat = ctx.now.saturating_sub(record.timestamp);
                record.timestamp = ctx.now;
                record.phase = RpcPhase::End as u32;
                emit(&mut self.events, &record)
            }
            None => Outcome::Miss,
        };
        // The waiting entry goes either way; a failed task links nothing
        let waiting = self.waiting.take(&args.task_id);
        if args.status != 0 {
            return self.error(ctx, args, &proc_of(&taken));
        }

        if let Some(info) = waiting {
            let _ = self.link_end.get_or_init(&info.pid, &info.timestamp);
        }
        outcome
    }

    fn error(&mut self, ctx: &ProbeCtx, args: &RpcTaskArgs, proc_name: &[u8; PROC_NAME_LEN]) -> Outcome {
        let event = ErrorEvent {
            timestamp: ctx.now,
            status: args.status,
            pid: ctx.pid(),
            task_id: args.task_id,
            proc_name: *proc_name,
        };
        match self.errors.push(&event) {
            Ok(()) => Outcome::Error,
            Err(e) => e.into(),
        }
    }
}

#[inline(always)]
fn proc_of(record: &Option<RpcRecord>) -> [u8; PROC_NAME_LEN] {
    match record {
        Some(r) => r.proc_name,
        None => [0; PROC_NAME_LEN],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::BoundedQueue;
    use crate::store::{FixedMap, Slot};

    type Map<K, V> = FixedMap<K, V, [Slot<K, V>; 16]>;
    type Queue<T> = BoundedQueue<T, [Option<T>; 16]>;
    type Maps = RpcMaps<
        Map<RpcKey, RpcRecord>,
        Map<u32, RpcTaskInfo>,
        Map<u32, u64>,
        Map<u32, u64>,
        Queue<RpcRecord>,
        Queue<ErrorEvent>,
    >;

    fn maps() -> Maps {
        RpcMaps {
            tasks: Map::inline(),
            waiting: Map::inline(),
            link_begin: Map::inline(),
            link_end: Map::inline(),
            events: Queue::inline(),
            errors: Queue::inline(),
        }
    }

    fn ctx(now: u64, pid: u32) -> ProbeCtx {
        ProbeCtx {
            now,
            pid_tgid: (pid as u64) << 32 | pid as u64,
            ..Default::default()
        }
    }

    fn args(task_id: u32, client_id: u32, status: i64) -> RpcTaskArgs {
        RpcTaskArgs {
            task_id,
            client_id,
            action: 0xffff_0000,
            status,
        }
    }

    #[test]
    fn test_submit_begin_end_emits_one_event() {
        let mut m = maps();
        m.submit(&ctx(100, 9), 0, 5, 9, b"READ");
        assert_eq!(m.task_begin(&ctx(200, 9), &args(42, 5, 0)), Outcome::Recorded);
        assert_eq!(m.task_end(&ctx(700, 9), &args(42, 5, 0)), Outcome::Emitted);

        let event = m.events.pop().unwrap();
        assert_eq!(name_str(&event.proc_name), "READ");
        assert_eq!(event.end_lat, 500);
        assert_eq!(event.owner, 9);
        assert_eq!(event.task_id, 42);
        assert_eq!(event.phase(), Some(RpcPhase::End));
        assert!(m.events.pop().is_none());
        assert!(m.tasks.is_empty());
    }

    #[test]
    fn test_rekey_is_idempotent() {
        let mut m = maps();
        m.submit(&ctx(100, 1), 0, 5, 1, b"WRITE");
        m.task_begin(&ctx(150, 1), &args(42, 5, 0));

        assert!(m.tasks.get(&RpcKey::placeholder(5)).is_none());
        assert!(m.tasks.get(&RpcKey { task_id: 42, client_id: 5 }).is_some());

        // A second begin for another task of the same client finds nothing to bind
        assert_eq!(m.task_begin(&ctx(160, 1), &args(43, 5, 0)), Outcome::Miss);
        assert!(m.tasks.get(&RpcKey { task_id: 43, client_id: 5 }).is_none());
    }

    #[test]
    fn test_wakeup_and_call_done_keep_the_record() {
        let mut m = maps();
        m.submit(&ctx(0, 1), 0, 2, 1, b"GETATTR");
        m.task_begin(&ctx(1_000, 1), &args(7, 2, 0));
        assert_eq!(m.task_wakeup(&ctx(1_300, 1), &args(7, 2, 0)), Outcome::Updated);
        assert_eq!(m.task_call_done(&ctx(1_400, 1), &args(7, 2, 0)), Outcome::Emitted);
        assert_eq!(m.task_call_done(&ctx(1_500, 1), &args(7, 2, 0)), Outcome::Emitted);
        m.task_end(&ctx(2_000, 1), &args(7, 2, 0));

        let first = m.events.pop().unwrap();
        assert_eq!(first.phase(), Some(RpcPhase::CallDone));
        assert_eq!(first.wake_lat, 300);
        assert_eq!(first.end_action, 0xffff_0000);
        let second = m.events.pop().unwrap();
        assert_eq!(second.phase(), Some(RpcPhase::CallDone));
        let last = m.events.pop().unwrap();
        assert_eq!(last.phase(), Some(RpcPhase::End));
        assert_eq!(last.wake_lat, 300);
        assert_eq!(last.end_lat, 1_000);
        assert!(m.events.pop().is_none());
    }

    #[test]
    fn test_error_carries_procedure_name() {
        let mut m = maps();
        m.submit(&ctx(0, 4), 0, 3, 4, b"OPEN");
        assert_eq!(m.task_begin(&ctx(10, 4), &args(11, 3, -5)), Outcome::Error);

        let err = m.errors.pop().unwrap();
        assert_eq!(err.status, -5);
        assert_eq!(err.pid, 4);
        assert_eq!(name_str(&err.proc_name), "OPEN");
        // The task id was still bound
        assert!(m.tasks.get(&RpcKey { task_id: 11, client_id: 3 }).is_some());
    }

    #[test]
    fn test_error_without_pairing_is_still_reported() {
        let mut m = maps();
        assert_eq!(m.task_end(&ctx(10, 4), &args(99, 3, -110)), Outcome::Error);
        let err = m.errors.pop().unwrap();
        assert_eq!(err.status, -110);
        assert_eq!(err.task_id, 99);
        assert_eq!(name_str(&err.proc_name), "");
        assert!(m.events.is_empty());
    }

    #[test]
    fn test_iops_link_follows_the_task() {
        let mut m = maps();
        m.link_begin.put(&8, &500).unwrap();
        m.submit(&ctx(600, 8), 0, 1, 8, b"READ");
        m.task_begin(&ctx(700, 8), &args(30, 1, 0));
        assert_eq!(
            m.waiting.get(&30),
            Some(RpcTaskInfo { timestamp: 500, pid: 8, _padding: 0 })
        );

        m.task_end(&ctx(900, 0), &args(30, 1, 0));
        assert!(m.waiting.get(&30).is_none());
        assert_eq!(m.link_end.get(&8), Some(500));
    }

    #[test]
    fn test_failed_task_end_releases_waiting_entry() {
        let mut m = maps();
        m.link_begin.put(&8, &500).unwrap();
        m.submit(&ctx(600, 8), 0, 1, 8, b"READ");
        m.task_begin(&ctx(700, 8), &args(30, 1, 0));
        assert!(m.waiting.get(&30).is_some());

        assert_eq!(m.task_end(&ctx(900, 8), &args(30, 1, -5)), Outcome::Error);

        assert!(m.waiting.get(&30).is_none());
        assert!(m.waiting.is_empty());
        assert!(m.link_end.get(&8).is_none());
        assert_eq!(m.errors.pop().unwrap().status, -5);
    }

    #[test]
    fn test_events_without_submission_are_misses() {
        let mut m = maps();
        assert_eq!(m.task_wakeup(&ctx(1, 1), &args(1, 1, 0)), Outcome::Miss);
        assert_eq!(m.task_call_done(&ctx(1, 1), &args(1, 1, 0)), Outcome::Miss);
        assert_eq!(m.task_end(&ctx(1, 1), &args(1, 1, 0)), Outcome::Miss);
        assert!(m.events.is_empty());
        assert!(m.errors.is_empty());
    }
}
