//! Begin/end pairing
//!
//! Every traced function is a two-state machine. The entry half stores an
//! in-flight record under a correlation key, the exit half takes it back,
//! computes the latency and emits one completed event. An exit without a
//! stored record is a no-op, and a latency that truncates to zero in the
//! event's unit is suppressed.
//!
//! The handlers here are pure functions over a [`ProbeCtx`] and the stores
//! and sinks they touch, so the same code runs in the kernel (over BPF maps)
//! and in the replay harness (over [`crate::FixedMap`] / [`crate::BoundedQueue`]).

use crate::constants::*;
use crate::emit::{EmitError, EventSink};
use crate::registry::{ClientOp, IoOp, NfsdOp};
use crate::store::{CorrelationStore, StoreError};
use crate::types::*;

/// What the current task looked like when a probe fired
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeCtx {
    /// Monotonic clock (nanoseconds)
    pub now: u64,
    /// `bpf_get_current_pid_tgid()`
    pub pid_tgid: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl ProbeCtx {
    #[inline(always)]
    pub const fn pid(&self) -> u32 {
        (self.pid_tgid >> 32) as u32
    }

    #[inline(always)]
    pub const fn thread(&self) -> ThreadKey {
        ThreadKey::from_pid_tgid(self.pid_tgid)
    }

    /// True when a non-zero pid filter excludes the current process
    #[inline(always)]
    pub const fn filtered_out(&self, filter_pid: u32) -> bool {
        filter_pid != 0 && filter_pid != self.pid()
    }
}

/// Result of a single handler invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// In-flight state stored
    Recorded,
    /// In-flight state updated, nothing emitted
    Updated,
    /// Completed event pushed
    Emitted,
    /// Paired, but the latency truncated to zero
    Suppressed,
    /// No in-flight state for the key
    Miss,
    /// Excluded by the pid filter
    Filtered,
    /// Error event pushed for a non-zero status
    Error,
    StoreFull,
    QueueFull,
}

impl Outcome {
    /// Index into the STATS counters, if this outcome is counted
    pub const fn stat_index(self) -> Option<u32> {
        match self {
            Outcome::Recorded => Some(STAT_RECORDED),
            Outcome::Emitted => Some(STAT_EMITTED),
            Outcome::Suppressed => Some(STAT_SUPPRESSED),
            Outcome::Miss => Some(STAT_PAIRING_MISS),
            Outcome::Filtered => Some(STAT_FILTERED),
            Outcome::Error => Some(STAT_ERRORS),
            Outcome::StoreFull => Some(STAT_STORE_FULL),
            Outcome::QueueFull => Some(STAT_QUEUE_FULL),
            Outcome::Updated => None,
        }
    }
}

impl From<StoreError> for Outcome {
    fn from(_: StoreError) -> Self {
        Outcome::StoreFull
    }
}

impl From<EmitError> for Outcome {
    fn from(_: EmitError) -> Self {
        Outcome::QueueFull
    }
}

/// Unit a completed event reports its latency in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyUnit {
    Nanos,
    Micros,
}

impl LatencyUnit {
    /// `end - start` truncated to this unit, `None` when not positive
    #[inline(always)]
    pub const fn elapsed(self, start: u64, end: u64) -> Option<u64> {
        if end <= start {
            return None;
        }
        let delta = match self {
            LatencyUnit::Nanos => end - start,
            LatencyUnit::Micros => (end - start) / 1000,
        };
        if delta == 0 {
            None
        } else {
            Some(delta)
        }
    }
}

/// In-flight record with an entry timestamp
pub trait InFlight: Copy {
    fn started_at(&self) -> u64;
}

impl InFlight for IoStart {
    fn started_at(&self) -> u64 {
        self.timestamp
    }
}

impl InFlight for OpStart {
    fn started_at(&self) -> u64 {
        self.timestamp
    }
}

impl InFlight for NfsdOpStart {
    fn started_at(&self) -> u64 {
        self.timestamp
    }
}

// ============================================================================
// Generic Pair
// ============================================================================

/// Entry half: upsert the in-flight record (last writer wins)
#[inline(always)]
pub fn begin<K, V, S>(store: &mut S, key: &K, record: &V) -> Outcome
where
    S: CorrelationStore<K, V>,
{
    match store.put(key, record) {
        Ok(()) => Outcome::Recorded,
        Err(e) => e.into(),
    }
}

/// Exit half: take the record, time it and emit `build(record, latency)`
#[inline(always)]
pub fn end<K, V, E, S, Q, F>(
    store: &mut S,
    sink: &mut Q,
    key: &K,
    now: u64,
    unit: LatencyUnit,
    build: F,
) -> Outcome
where
    V: InFlight,
    S: CorrelationStore<K, V>,
    Q: EventSink<E>,
    F: FnOnce(&V, u64) -> E,
{
    let Some(start) = store.take(key) else {
        return Outcome::Miss;
    };
    let Some(latency) = unit.elapsed(start.started_at(), now) else {
        return Outcome::Suppressed;
    };
    emit(sink, &build(&start, latency))
}

#[inline(always)]
pub fn emit<E, Q: EventSink<E>>(sink: &mut Q, event: &E) -> Outcome {
    match sink.push(event) {
        Ok(()) => Outcome::Emitted,
        Err(e) => e.into(),
    }
}

// ============================================================================
// VFS I/O
// ============================================================================

/// Entry of a VFS read/write
///
/// Also stamps `link_begin[pid]`, the start of the I/O that the next RPC
/// task of this process is attributed to.
pub fn io_entry<S, L>(
    ctx: &ProbeCtx,
    filter_pid: u32,
    file: &[u8],
    is_direct: bool,
    starts: &mut S,
    link_begin: &mut L,
) -> Outcome
where
    S: CorrelationStore<ThreadKey, IoStart>,
    L: CorrelationStore<u32, u64>,
{
    if ctx.filtered_out(filter_pid) {
        return Outcome::Filtered;
    }
    let mut record = IoStart {
        timestamp: ctx.now,
        is_direct: is_direct as u8,
        ..Default::default()
    };
    fill_name(&mut record.file, file);
    let _ = link_begin.put(&ctx.pid(), &ctx.now);
    begin(starts, &ctx.thread(), &record)
}

/// Exit of a VFS read/write; `ret` is the traced function's return value
pub fn io_exit<S, Q>(ctx: &ProbeCtx, op: IoOp, ret: i64, starts: &mut S, sink: &mut Q) -> Outcome
where
    S: CorrelationStore<ThreadKey, IoStart>,
    Q: EventSink<IoEvent>,
{
    end(starts, sink, &ctx.thread(), ctx.now, LatencyUnit::Nanos, |start, latency| IoEvent {
        timestamp: ctx.now,
        latency_ns: latency,
        size: ret,
        pid: ctx.pid(),
        op: op.as_u32(),
        comm: ctx.comm,
        file: start.file,
        is_direct: start.is_direct,
        _padding: [0; 7],
    })
}

// ============================================================================
// Client Operations
// ============================================================================

pub fn op_entry<S>(ctx: &ProbeCtx, filter_pid: u32, starts: &mut S) -> Outcome
where
    S: CorrelationStore<ThreadKey, OpStart>,
{
    if ctx.filtered_out(filter_pid) {
        return Outcome::Filtered;
    }
    begin(starts, &ctx.thread(), &OpStart { timestamp: ctx.now })
}

pub fn op_exit<S, Q>(ctx: &ProbeCtx, op: ClientOp, starts: &mut S, sink: &mut Q) -> Outcome
where
    S: CorrelationStore<ThreadKey, OpStart>,
    Q: EventSink<OpEvent>,
{
    end(starts, sink, &ctx.thread(), ctx.now, LatencyUnit::Micros, |_, latency| OpEvent {
        timestamp: ctx.now,
        latency_us: latency,
        pid: ctx.pid(),
        op: op.as_u32(),
        comm: ctx.comm,
    })
}

// ============================================================================
// NFSv4 Server Operations
// ============================================================================

#[inline(always)]
fn nfsd_key(ctx: &ProbeCtx, op: NfsdOp) -> NfsdOpKey {
    NfsdOpKey {
        op_type: op.as_u32(),
        pid: ctx.pid(),
    }
}

pub fn nfsd_op_entry<S>(ctx: &ProbeCtx, filter_pid: u32, op: NfsdOp, xid: u32, starts: &mut S) -> Outcome
where
    S: CorrelationStore<NfsdOpKey, NfsdOpStart>,
{
    if ctx.filtered_out(filter_pid) {
        return Outcome::Filtered;
    }
    let record = NfsdOpStart {
        timestamp: ctx.now,
        pid: ctx.pid(),
        xid,
        comm: ctx.comm,
    };
    begin(starts, &nfsd_key(ctx, op), &record)
}

pub fn nfsd_op_exit<S, Q>(ctx: &ProbeCtx, op: NfsdOp, starts: &mut S, sink: &mut Q) -> Outcome
where
    S: CorrelationStore<NfsdOpKey, NfsdOpStart>,
    Q: EventSink<NfsdOpEvent>,
{
    end(starts, sink, &nfsd_key(ctx, op), ctx.now, LatencyUnit::Micros, |start, latency| NfsdOpEvent {
        timestamp: ctx.now,
        latency_us: latency,
        pid: ctx.pid(),
        xid: start.xid,
        op: op.as_u32(),
        _padding: 0,
        comm: ctx.comm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::BoundedQueue;
    use crate::store::{FixedMap, Slot};

    type Starts<K, V> = FixedMap<K, V, [Slot<K, V>; 16]>;
    type Queue<T> = BoundedQueue<T, [Option<T>; 16]>;

    fn ctx(now: u64, pid: u32, tid: u32) -> ProbeCtx {
        let mut comm = [0u8; TASK_COMM_LEN];
        fill_name(&mut comm, b"dd");
        ProbeCtx {
            now,
            pid_tgid: ((pid as u64) << 32) | tid as u64,
            comm,
        }
    }

    #[test]
    fn test_overwritten_entry_uses_latest_timestamp() {
        let mut starts: Starts<ThreadKey, OpStart> = Starts::inline();
        let mut sink: Queue<OpEvent> = Queue::inline();

        assert_eq!(op_entry(&ctx(100_000, 1, 1), 0, &mut starts), Outcome::Recorded);
        assert_eq!(op_entry(&ctx(150_000, 1, 1), 0, &mut starts), Outcome::Recorded);
        assert_eq!(
            op_exit(&ctx(200_000, 1, 1), ClientOp::Lookup, &mut starts, &mut sink),
            Outcome::Emitted
        );

        let event = sink.pop().unwrap();
        assert_eq!(event.latency_us, 50);
        assert_eq!(event.op, ClientOp::Lookup.as_u32());
        assert!(sink.pop().is_none());
    }

    #[test]
    fn test_exit_without_entry_is_noop() {
        let mut starts: Starts<ThreadKey, IoStart> = Starts::inline();
        let mut sink: Queue<IoEvent> = Queue::inline();
        assert_eq!(
            io_exit(&ctx(10, 1, 1), IoOp::Read, 4096, &mut starts, &mut sink),
            Outcome::Miss
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_second_exit_emits_nothing() {
        let mut starts: Starts<ThreadKey, IoStart> = Starts::inline();
        let mut links: Starts<u32, u64> = Starts::inline();
        let mut sink: Queue<IoEvent> = Queue::inline();

        io_entry(&ctx(100, 7, 8), 0, b"data.bin", true, &mut starts, &mut links);
        assert_eq!(io_exit(&ctx(300, 7, 8), IoOp::Read, 512, &mut starts, &mut sink), Outcome::Emitted);
        assert_eq!(io_exit(&ctx(400, 7, 8), IoOp::Read, 512, &mut starts, &mut sink), Outcome::Miss);

        let event = sink.pop().unwrap();
        assert_eq!(event.latency_ns, 200);
        assert_eq!(event.size, 512);
        assert_eq!(event.is_direct, 1);
        assert_eq!(name_str(&event.file), "data.bin");
        assert_eq!(name_str(&event.comm), "dd");
        assert_eq!(links.get(&7), Some(100));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_threads_pair_independently() {
        let mut starts: Starts<ThreadKey, IoStart> = Starts::inline();
        let mut links: Starts<u32, u64> = Starts::inline();
        let mut sink: Queue<IoEvent> = Queue::inline();

        io_entry(&ctx(100, 7, 1), 0, b"a", false, &mut starts, &mut links);
        io_entry(&ctx(120, 7, 2), 0, b"b", false, &mut starts, &mut links);
        io_exit(&ctx(200, 7, 2), IoOp::Write, 1, &mut starts, &mut sink);
        io_exit(&ctx(500, 7, 1), IoOp::Write, 1, &mut starts, &mut sink);

        assert_eq!(sink.pop().unwrap().latency_ns, 80);
        assert_eq!(sink.pop().unwrap().latency_ns, 400);
    }

    #[test]
    fn test_sub_microsecond_latency_is_suppressed() {
        let mut starts: Starts<ThreadKey, OpStart> = Starts::inline();
        let mut sink: Queue<OpEvent> = Queue::inline();

        op_entry(&ctx(1_000, 1, 1), 0, &mut starts);
        assert_eq!(
            op_exit(&ctx(1_999, 1, 1), ClientOp::Getattr, &mut starts, &mut sink),
            Outcome::Suppressed
        );
        assert!(sink.is_empty());
        // The record was still consumed
        assert_eq!(starts.len(), 0);
    }

    #[test]
    fn test_clock_going_backwards_is_suppressed() {
        assert_eq!(LatencyUnit::Nanos.elapsed(500, 400), None);
        assert_eq!(LatencyUnit::Nanos.elapsed(500, 500), None);
        assert_eq!(LatencyUnit::Micros.elapsed(0, 2_500), Some(2));
    }

    #[test]
    fn test_pid_filter_applies_at_entry() {
        let mut starts: Starts<ThreadKey, OpStart> = Starts::inline();
        assert_eq!(op_entry(&ctx(1, 5, 5), 9, &mut starts), Outcome::Filtered);
        assert_eq!(op_entry(&ctx(1, 9, 5), 9, &mut starts), Outcome::Recorded);
        assert_eq!(starts.len(), 1);
    }

    #[test]
    fn test_nfsd_ops_keyed_by_op_and_pid() {
        let mut starts: Starts<NfsdOpKey, NfsdOpStart> = Starts::inline();
        let mut sink: Queue<NfsdOpEvent> = Queue::inline();

        nfsd_op_entry(&ctx(1_000, 3, 3), 0, NfsdOp::Sequence, 0xabcd, &mut starts);
        nfsd_op_entry(&ctx(2_000, 3, 3), 0, NfsdOp::Read, 0xabcd, &mut starts);
        nfsd_op_exit(&ctx(9_000, 3, 3), NfsdOp::Read, &mut starts, &mut sink);
        nfsd_op_exit(&ctx(11_000, 3, 3), NfsdOp::Sequence, &mut starts, &mut sink);

        let read = sink.pop().unwrap();
        assert_eq!(read.op, NfsdOp::Read.as_u32());
        assert_eq!(read.latency_us, 7);
        assert_eq!(read.xid, 0xabcd);
        let seq = sink.pop().unwrap();
        assert_eq!(seq.op, NfsdOp::Sequence.as_u32());
        assert_eq!(seq.latency_us, 10);
    }

    #[test]
    fn test_full_sink_reports_queue_full() {
        let mut starts: Starts<ThreadKey, OpStart> = Starts::inline();
        let mut sink: BoundedQueue<OpEvent, [Option<OpEvent>; 0]> = BoundedQueue::inline();
        op_entry(&ctx(0, 1, 1), 0, &mut starts);
        assert_eq!(
            op_exit(&ctx(5_000, 1, 1), ClientOp::Mkdir, &mut starts, &mut sink),
            Outcome::QueueFull
        );
    }

    #[test]
    fn test_outcome_stat_indices() {
        assert_eq!(Outcome::Miss.stat_index(), Some(STAT_PAIRING_MISS));
        assert_eq!(Outcome::Updated.stat_index(), None);
    }
}
