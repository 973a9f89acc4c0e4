//! Offline replay of probe firings
//!
//! Runs the correlation core from `nfsdig-common` in user space, over
//! [`FixedMap`] and [`BoundedQueue`] instances sized like the kernel maps.
//! A script is one JSON object per line:
//!
//! ```text
//! {"at": 100, "pid": 7, "probe": "io_entry", "file": "data.bin"}
//! {"at": 250, "pid": 7, "probe": "io_exit", "op": "nfs_file_read", "ret": 4096}
//! {"at": 300, "pid": 7, "probe": "rpc_execute", "client_id": 5, "owner": 7, "proc_name": "READ"}
//! {"at": 400, "pid": 7, "probe": "rpc_task_begin", "task_id": 42, "client_id": 5}
//! {"at": 900, "probe": "packet", "data": "ffffffffffff..."}
//! ```
//!
//! `at` is nanoseconds on the probes' clock. Firings are applied in file
//! order, so a script spells out one exact interleaving of concurrent
//! threads.

use crate::{config::Config, events::EventSource, types::Batch};
use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use nfsdig_common::{
    classifier, constants::*, fault, fill_name, pairing, BoundedQueue, ClientOp, CorrelationStore,
    ErrorEvent, FixedMap, IoEvent, IoOp, IoStart, NfsdOp, NfsdOpEvent, NfsdOpKey, NfsdOpStart, OpEvent,
    OpStart, Outcome, PacketFilter, PacketRecord, PacketStats, ProbeCtx, RpcKey, RpcMaps, RpcRecord,
    RpcTaskArgs, RpcTaskInfo, Slot, SlotKey, ThreadKey,
};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    io::BufRead,
    sync::atomic::AtomicU32,
    time::Duration,
};

// ============================================================================
// Script Format
// ============================================================================

/// One probe firing
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Firing {
    /// Probe clock, nanoseconds
    pub at: u64,
    #[serde(default)]
    pub pid: u32,
    /// Thread id, defaults to `pid`
    #[serde(default)]
    pub tid: Option<u32>,
    #[serde(default)]
    pub comm: String,
    #[serde(flatten)]
    pub probe: Probe,
}

/// Which probe fired, with its arguments
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum Probe {
    IoEntry {
        #[serde(default)]
        file: String,
        #[serde(default)]
        direct: bool,
    },
    IoExit {
        op: String,
        #[serde(default)]
        ret: i64,
    },
    OpEntry,
    OpExit {
        op: String,
    },
    NfsdEntry {
        op: String,
        #[serde(default)]
        xid: u32,
    },
    NfsdExit {
        op: String,
    },
    RpcExecute {
        client_id: u32,
        #[serde(default)]
        owner: u32,
        #[serde(default)]
        proc_name: String,
    },
    RpcTaskBegin(TaskFields),
    RpcTaskWakeup(TaskFields),
    RpcTaskCallDone(TaskFields),
    RpcTaskEnd(TaskFields),
    /// A frame seen by the XDP classifier, hex encoded
    Packet {
        data: String,
    },
}

/// Fields of the `sunrpc:rpc_task_*` tracepoints
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFields {
    pub task_id: u32,
    pub client_id: u32,
    #[serde(default)]
    pub action: u64,
    #[serde(default)]
    pub status: i64,
}

impl From<TaskFields> for RpcTaskArgs {
    fn from(f: TaskFields) -> Self {
        RpcTaskArgs {
            task_id: f.task_id,
            client_id: f.client_id,
            action: f.action,
            status: f.status,
        }
    }
}

/// Parse a JSON-lines script; blank lines and `#` comments are skipped
pub fn parse_script<R: BufRead>(reader: R) -> Result<Vec<Firing>> {
    let mut firings = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read replay line {}", n + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let firing: Firing = serde_json::from_str(line)
            .with_context(|| format!("Invalid firing on replay line {}", n + 1))?;
        firings.push(firing);
    }
    Ok(firings)
}

/// Decode a hex string, ignoring whitespace and `:` separators
pub fn decode_hex(hex: &str) -> Result<Bytes> {
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits");
    }
    let mut buf = BytesMut::with_capacity(digits.len() / 2);
    for pair in digits.chunks(2) {
        let text = std::str::from_utf8(pair).context("Invalid hex digit")?;
        let byte = u8::from_str_radix(text, 16).with_context(|| format!("Invalid hex byte: {}", text))?;
        buf.put_u8(byte);
    }
    Ok(buf.freeze())
}

// ============================================================================
// User-space Maps
// ============================================================================

type Map<K, V> = FixedMap<K, V, Vec<Slot<K, V>>>;
type Events<T> = BoundedQueue<T, Vec<Option<T>>>;

fn map<K: SlotKey, V: Copy>(capacity: u32) -> Map<K, V> {
    FixedMap::new(vec![Slot::Empty; capacity as usize])
}

fn events<T: Copy>(capacity: u32) -> Events<T> {
    BoundedQueue::new(vec![None; capacity as usize])
}

/// The kernel maps, rebuilt in user space with the same capacities
struct Maps {
    io_starts: Map<ThreadKey, IoStart>,
    op_starts: Map<ThreadKey, OpStart>,
    nfsd_starts: Map<NfsdOpKey, NfsdOpStart>,
    rpc_tasks: Map<RpcKey, RpcRecord>,
    link_begin: Map<u32, u64>,
    waiting_rpc: Map<u32, RpcTaskInfo>,
    link_end: Map<u32, u64>,
    io_events: Events<IoEvent>,
    op_events: Events<OpEvent>,
    nfsd_events: Events<NfsdOpEvent>,
    rpc_events: Events<RpcRecord>,
    error_events: Events<ErrorEvent>,
    packet_records: Map<u32, PacketRecord>,
    xid_records: Map<u32, PacketRecord>,
    packet_counter: AtomicU32,
    packet_stats: PacketStats,
    stats: [u64; MAX_STATS as usize],
}

impl Maps {
    fn new() -> Self {
        Self {
            io_starts: map(MAX_ENTRIES),
            op_starts: map(MAX_OP_STARTS),
            nfsd_starts: map(MAX_ENTRIES),
            rpc_tasks: map(MAX_ENTRIES),
            link_begin: map(MAX_ENTRIES),
            waiting_rpc: map(MAX_ENTRIES),
            link_end: map(MAX_ENTRIES),
            io_events: events(MAX_QUEUE_ENTRIES),
            op_events: events(MAX_QUEUE_ENTRIES),
            nfsd_events: events(MAX_QUEUE_ENTRIES),
            rpc_events: events(MAX_QUEUE_ENTRIES),
            error_events: events(MAX_QUEUE_ENTRIES),
            packet_records: map(MAX_PACKET_RECORDS),
            xid_records: map(MAX_PACKET_RECORDS),
            packet_counter: AtomicU32::new(0),
            packet_stats: PacketStats::default(),
            stats: [0; MAX_STATS as usize],
        }
    }
}

fn pop_all<T: Copy>(queue: &mut Events<T>) -> Vec<T> {
    std::iter::from_fn(|| queue.pop()).collect()
}

/// Read every record, then delete what was read
fn read_then_delete<V: Copy>(map: &mut Map<u32, V>) -> Vec<(u32, V)> {
    let entries: Vec<(u32, V)> = map.iter().map(|(k, v)| (*k, *v)).collect();
    for (key, _) in &entries {
        map.remove(key);
    }
    entries
}

// ============================================================================
// Replayer
// ============================================================================

/// Load-time settings the kernel programs would see as globals
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySettings {
    pub filter_pid: u32,
    pub delay_probability: u64,
    pub delay_us: u32,
    pub packet_filter: PacketFilter,
}

impl From<&Config> for ReplaySettings {
    fn from(config: &Config) -> Self {
        Self {
            filter_pid: config.filter_pid,
            delay_probability: config.delay_probability,
            delay_us: config.delay_us,
            packet_filter: config.packet_filter,
        }
    }
}

/// Deterministic dispatcher for scripted probe firings
pub struct Replayer {
    firings: VecDeque<Firing>,
    settings: ReplaySettings,
    /// Interval length on the probe clock
    period_ns: u64,
    /// End of the interval being drained
    boundary: Option<u64>,
    maps: Box<Maps>,
}

impl Replayer {
    pub fn new(firings: Vec<Firing>, settings: ReplaySettings, period: Duration) -> Self {
        Self {
            firings: firings.into(),
            settings,
            period_ns: (period.as_nanos() as u64).max(1),
            boundary: None,
            maps: Box::new(Maps::new()),
        }
    }

    /// Nothing left to fire
    pub fn finished(&self) -> bool {
        self.firings.is_empty()
    }

    /// Apply one firing, as the matching kernel program would
    pub fn fire(&mut self, firing: &Firing) -> Result<Outcome> {
        let mut ctx = ProbeCtx {
            now: firing.at,
            pid_tgid: ((firing.pid as u64) << 32) | firing.tid.unwrap_or(firing.pid) as u64,
            comm: [0; TASK_COMM_LEN],
        };
        fill_name(&mut ctx.comm, firing.comm.as_bytes());

        let s = self.settings;
        let m = &mut *self.maps;
        let outcome = match &firing.probe {
            Probe::IoEntry { file, direct } => pairing::io_entry(
                &ctx,
                s.filter_pid,
                file.as_bytes(),
                *direct,
                &mut m.io_starts,
                &mut m.link_begin,
            ),
            Probe::IoExit { op, ret } => {
                let op = IoOp::from_name(op).with_context(|| format!("Unknown I/O op: {}", op))?;
                pairing::io_exit(&ctx, op, *ret, &mut m.io_starts, &mut m.io_events)
            }
            Probe::OpEntry => pairing::op_entry(&ctx, s.filter_pid, &mut m.op_starts),
            Probe::OpExit { op } => {
                let op = ClientOp::from_name(op).with_context(|| format!("Unknown client op: {}", op))?;
                if op == ClientOp::Permission && fault::should_inject(ctx.now, s.delay_probability) {
                    // Virtual clock: each read advances one microsecond
                    let deadline = fault::delay_deadline(ctx.now, s.delay_us);
                    let mut clock = ctx.now;
                    fault::spin_until(deadline, || {
                        clock += 1_000;
                        clock
                    });
                    ctx.now = clock;
                }
                pairing::op_exit(&ctx, op, &mut m.op_starts, &mut m.op_events)
            }
            Probe::NfsdEntry { op, xid } => {
                let op = NfsdOp::from_name(op).with_context(|| format!("Unknown server op: {}", op))?;
                pairing::nfsd_op_entry(&ctx, s.filter_pid, op, *xid, &mut m.nfsd_starts)
            }
            Probe::NfsdExit { op } => {
                let op = NfsdOp::from_name(op).with_context(|| format!("Unknown server op: {}", op))?;
                pairing::nfsd_op_exit(&ctx, op, &mut m.nfsd_starts, &mut m.nfsd_events)
            }
            Probe::RpcExecute {
                client_id,
                owner,
                proc_name,
            } => rpc_maps(m).submit(&ctx, s.filter_pid, *client_id, *owner, proc_name.as_bytes()),
            Probe::RpcTaskBegin(f) => rpc_maps(m).task_begin(&ctx, &(*f).into()),
            Probe::RpcTaskWakeup(f) => rpc_maps(m).task_wakeup(&ctx, &(*f).into()),
            Probe::RpcTaskCallDone(f) => rpc_maps(m).task_call_done(&ctx, &(*f).into()),
            Probe::RpcTaskEnd(f) => rpc_maps(m).task_end(&ctx, &(*f).into()),
            Probe::Packet { data } => {
                let frame = decode_hex(data).context("Invalid packet data")?;
                let classified = classifier::classify(&frame[..], &s.packet_filter, ctx.now);
                classifier::account(&mut m.packet_stats, &classified);
                if classified.record.is_some() {
                    classifier::record(
                        &classified,
                        &m.packet_counter,
                        &mut m.packet_records,
                        &mut m.xid_records,
                    )
                } else {
                    // The XDP program counts nothing for unrecorded frames
                    return Ok(Outcome::Filtered);
                }
            }
        };

        if let Some(index) = outcome.stat_index() {
            m.stats[index as usize] += 1;
        }
        Ok(outcome)
    }
}

type ReplayRpcMaps<'a> = RpcMaps<
    &'a mut Map<RpcKey, RpcRecord>,
    &'a mut Map<u32, RpcTaskInfo>,
    &'a mut Map<u32, u64>,
    &'a mut Map<u32, u64>,
    &'a mut Events<RpcRecord>,
    &'a mut Events<ErrorEvent>,
>;

fn rpc_maps(m: &mut Maps) -> ReplayRpcMaps<'_> {
    RpcMaps {
        tasks: &mut m.rpc_tasks,
        waiting: &mut m.waiting_rpc,
        link_begin: &mut m.link_begin,
        link_end: &mut m.link_end,
        events: &mut m.rpc_events,
        errors: &mut m.error_events,
    }
}

impl EventSource for Replayer {
    /// Fire everything up to the next interval boundary, then drain
    fn drain(&mut self) -> Result<Batch> {
        let boundary = match (self.boundary, self.firings.front()) {
            (Some(b), _) => b,
            (None, Some(first)) => first.at + self.period_ns,
            (None, None) => self.period_ns,
        };
        while self.firings.front().is_some_and(|f| f.at < boundary) {
            if let Some(firing) = self.firings.pop_front() {
                self.fire(&firing)?;
            }
        }
        self.boundary = Some(boundary + self.period_ns);

        let m = &mut *self.maps;
        Ok(Batch {
            io: pop_all(&mut m.io_events),
            ops: pop_all(&mut m.op_events),
            nfsd: pop_all(&mut m.nfsd_events),
            rpc: pop_all(&mut m.rpc_events),
            errors: pop_all(&mut m.error_events),
            packets: read_then_delete(&mut m.packet_records)
                .into_iter()
                .map(|(_, r)| r)
                .collect(),
            compounds: read_then_delete(&mut m.xid_records)
                .into_iter()
                .map(|(_, r)| r)
                .collect(),
            packet_stats: m.packet_stats,
            probe_stats: m.stats,
            linked: read_then_delete(&mut m.link_end),
        })
    }
}
