//! Metrics collection and aggregation
//!
//! Turns one drained [`Batch`] into an [`IntervalReport`] and keeps the
//! run totals.

use crate::{
    config::{OpSelection, OutputUnit},
    types::*,
};
use log::debug;
use nfsdig_common::{
    constants::MAX_STATS, name_str, ClientOp, IoOp, NfsdOp, RpcPhase,
};
use std::{collections::HashMap, net::Ipv4Addr};

/// Names of the probe health counters, by STATS index
pub const STAT_NAMES: [&str; MAX_STATS as usize] = [
    "recorded",
    "emitted",
    "pairing_miss",
    "suppressed",
    "store_full",
    "queue_full",
    "filtered",
    "errors",
];

/// Running sum for an average
#[derive(Debug, Default, Clone, Copy)]
struct Mean {
    sum: u64,
    count: u64,
}

impl Mean {
    fn add(&mut self, value: u64) {
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> Option<u64> {
        (self.count > 0).then(|| self.sum / self.count)
    }
}

/// Metrics collector for aggregating drained events
pub struct MetricsCollector {
    unit: OutputUnit,
    /// Client op columns, in output order
    client_ops: Vec<ClientOp>,
    /// Server op columns, in output order
    nfsd_ops: Vec<NfsdOp>,
    /// Counters seen at the previous drain
    last_packets: PacketStats,
    last_probe_stats: [u64; MAX_STATS as usize],
    totals: RunSummary,
}

impl MetricsCollector {
    /// Create a new metrics collector
    ///
    /// # Arguments
    ///
    /// * `unit` - Latency unit of the report
    /// * `ops` - Operations that get a metrics column
    pub fn new(unit: OutputUnit, ops: &OpSelection) -> Self {
        Self {
            unit,
            client_ops: ops.client.clone(),
            nfsd_ops: ops.nfsd.clone(),
            last_packets: PacketStats::default(),
            last_probe_stats: [0; MAX_STATS as usize],
            totals: RunSummary::default(),
        }
    }

    pub fn client_ops(&self) -> &[ClientOp] {
        &self.client_ops
    }

    pub fn nfsd_ops(&self) -> &[NfsdOp] {
        &self.nfsd_ops
    }

    /// Aggregate one interval
    pub fn ingest(&mut self, batch: &Batch) -> IntervalReport {
        let mut report = IntervalReport::default();

        self.aggregate_ops(batch, &mut report);
        self.aggregate_io(batch, &mut report);
        self.aggregate_rpc(batch, &mut report);
        self.aggregate_packets(batch, &mut report);

        for (pid, _) in &batch.linked {
            *report.linked_ios.entry(*pid).or_insert(0) += 1;
        }

        report.errors = batch
            .errors
            .iter()
            .map(|e| ErrorRow {
                pid: e.pid,
                proc_name: name_str(&e.proc_name).to_string(),
                status: e.status,
            })
            .collect();

        self.log_probe_stats(&batch.probe_stats);

        self.totals.intervals += 1;
        self.totals.io_events += batch.io.len() as u64;
        self.totals.op_events += batch.ops.len() as u64;
        self.totals.nfsd_events += batch.nfsd.len() as u64;
        self.totals.rpc_events += batch.rpc.len() as u64;
        self.totals.errors += batch.errors.len() as u64;
        self.totals.linked_ios += batch.linked.len() as u64;

        report
    }

    fn aggregate_ops(&self, batch: &Batch, report: &mut IntervalReport) {
        let mut client: HashMap<ClientOp, Mean> = HashMap::new();
        for ev in &batch.ops {
            // Zero in the output unit is suppressed like zero in the probe's unit
            let latency = self.unit.from_micros(ev.latency_us);
            if latency == 0 {
                continue;
            }
            let op = ClientOp::from_u32(ev.op);
            if let Some(op) = op {
                client.entry(op).or_default().add(ev.latency_us);
            }
            report.traces.push(TraceRow {
                family: Family::Ops,
                pid: ev.pid,
                comm: name_str(&ev.comm).to_string(),
                syscall: op.map(|op| op.name().to_string()).unwrap_or_else(|| format!("op{}", ev.op)),
                latency,
                ret: None,
            });
        }

        let mut nfsd: HashMap<NfsdOp, Mean> = HashMap::new();
        for ev in &batch.nfsd {
            let latency = self.unit.from_micros(ev.latency_us);
            if latency == 0 {
                continue;
            }
            let op = NfsdOp::from_u32(ev.op);
            if let Some(op) = op {
                nfsd.entry(op).or_default().add(ev.latency_us);
            }
            report.traces.push(TraceRow {
                family: Family::Nfsd,
                pid: ev.pid,
                comm: name_str(&ev.comm).to_string(),
                syscall: op.map(|op| op.name().to_string()).unwrap_or_else(|| format!("op{}", ev.op)),
                latency,
                ret: Some(ev.xid as i64),
            });
        }

        report.ops = self
            .client_ops
            .iter()
            .map(|op| client.get(op).and_then(Mean::value).map(|us| self.unit.from_micros(us)))
            .collect();
        report.nfsd = self
            .nfsd_ops
            .iter()
            .map(|op| nfsd.get(op).and_then(Mean::value).map(|us| self.unit.from_micros(us)))
            .collect();
    }

    fn aggregate_io(&self, batch: &Batch, report: &mut IntervalReport) {
        let mut reads = Mean::default();
        let mut writes = Mean::default();

        for ev in &batch.io {
            let op = IoOp::from_u32(ev.op);
            let bytes = ev.size.max(0) as u64;
            let latency = self.unit.from_nanos(ev.latency_ns);
            // Counts and bytes include calls too fast for the output unit
            let mean = match op {
                Some(op) if op.is_read() => {
                    report.io.reads += 1;
                    report.io.read_bytes += bytes;
                    Some(&mut reads)
                }
                Some(_) => {
                    report.io.writes += 1;
                    report.io.write_bytes += bytes;
                    Some(&mut writes)
                }
                None => None,
            };
            if latency == 0 {
                continue;
            }
            if let Some(mean) = mean {
                mean.add(ev.latency_ns);
            }

            let mut syscall = op.map(|op| op.name().to_string()).unwrap_or_else(|| format!("op{}", ev.op));
            if ev.is_direct != 0 {
                syscall.push_str("(direct)");
            }
            report.traces.push(TraceRow {
                family: Family::Io,
                pid: ev.pid,
                comm: name_str(&ev.comm).to_string(),
                syscall,
                latency,
                ret: Some(ev.size),
            });
        }

        report.io.read_latency = reads.value().map(|ns| self.unit.from_nanos(ns));
        report.io.write_latency = writes.value().map(|ns| self.unit.from_nanos(ns));
    }

    fn aggregate_rpc(&self, batch: &Batch, report: &mut IntervalReport) {
        let mut wake = Mean::default();
        let mut end = Mean::default();

        for record in &batch.rpc {
            let phase = record.phase();
            if phase == Some(RpcPhase::End) {
                report.rpc.calls += 1;
                if self.unit.from_nanos(record.end_lat) > 0 {
                    end.add(record.end_lat);
                }
                if self.unit.from_nanos(record.wake_lat) > 0 {
                    wake.add(record.wake_lat);
                }
            }

            let latency = match phase {
                Some(RpcPhase::End) => self.unit.from_nanos(record.end_lat),
                _ => self.unit.from_nanos(record.wake_lat),
            };
            if latency == 0 {
                continue;
            }
            report.traces.push(TraceRow {
                family: Family::Rpc,
                pid: record.owner,
                comm: phase.map(RpcPhase::as_str).unwrap_or("unknown").to_string(),
                syscall: name_str(&record.proc_name).to_string(),
                latency,
                ret: None,
            });
        }

        report.rpc.avg_wake_latency = wake.value().map(|ns| self.unit.from_nanos(ns));
        report.rpc.avg_end_latency = end.value().map(|ns| self.unit.from_nanos(ns));
    }

    fn aggregate_packets(&mut self, batch: &Batch, report: &mut IntervalReport) {
        let now = batch.packet_stats;
        let last = self.last_packets;
        report.xdp = XdpSummary {
            total_packets: now.total_packets.saturating_sub(last.total_packets),
            nfs_packets: now.nfs_packets.saturating_sub(last.nfs_packets),
            tcp_packets: now.tcp_packets.saturating_sub(last.tcp_packets),
            udp_packets: now.udp_packets.saturating_sub(last.udp_packets),
            total_bytes: now.total_bytes.saturating_sub(last.total_bytes),
            nfs_bytes: now.nfs_bytes.saturating_sub(last.nfs_bytes),
            recorded_packets: batch.packets.len() as u64,
        };
        self.last_packets = now;

        self.totals.packets.total_packets += report.xdp.total_packets;
        self.totals.packets.nfs_packets += report.xdp.nfs_packets;
        self.totals.packets.tcp_packets += report.xdp.tcp_packets;
        self.totals.packets.udp_packets += report.xdp.udp_packets;
        self.totals.packets.total_bytes += report.xdp.total_bytes;
        self.totals.packets.nfs_bytes += report.xdp.nfs_bytes;
        self.totals.packets.recorded_packets += report.xdp.recorded_packets;

        report.compounds = batch
            .compounds
            .iter()
            .map(|r| CompoundRow {
                xid: r.xid,
                source: format!("{}:{}", Ipv4Addr::from(r.src_ip), r.src_port),
                destination: format!("{}:{}", Ipv4Addr::from(r.dst_ip), r.dst_port),
                protocol: r.protocol,
                data_size: r.data_size,
            })
            .collect();
    }

    fn log_probe_stats(&mut self, stats: &[u64; MAX_STATS as usize]) {
        let delta: Vec<String> = STAT_NAMES
            .iter()
            .zip(stats.iter().zip(self.last_probe_stats.iter()))
            .map(|(name, (now, last))| format!("{}={}", name, now.saturating_sub(*last)))
            .collect();
        debug!("Probe stats: {}", delta.join(" "));
        self.last_probe_stats = *stats;
    }

    /// Run totals
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of the run in seconds
    pub fn summary(&self, elapsed_secs: u64) -> RunSummary {
        let mut summary = self.totals.clone();
        summary.timestamp = chrono::Utc::now().to_rfc3339();
        summary.duration_seconds = elapsed_secs;
        summary.probe_stats = STAT_NAMES
            .iter()
            .zip(self.last_probe_stats.iter())
            .map(|(name, count)| (name.to_string(), *count))
            .collect();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfsdig_common::{fill_name, types::*};

    fn collector(unit: OutputUnit) -> MetricsCollector {
        MetricsCollector::new(unit, &OpSelection::all())
    }

    fn op_event(op: ClientOp, latency_us: u64) -> OpEvent {
        let mut comm = [0u8; 16];
        fill_name(&mut comm, b"ls");
        OpEvent {
            timestamp: 1,
            latency_us,
            pid: 42,
            op: op.as_u32(),
            comm,
        }
    }

    fn io_event(op: IoOp, latency_ns: u64, size: i64) -> IoEvent {
        IoEvent {
            latency_ns,
            size,
            pid: 7,
            op: op.as_u32(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ops_average_per_column() {
        let mut collector = collector(OutputUnit::Micros);
        let batch = Batch {
            ops: vec![
                op_event(ClientOp::Getattr, 10),
                op_event(ClientOp::Getattr, 20),
                op_event(ClientOp::Lookup, 7),
            ],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        let getattr = ClientOp::ALL.iter().position(|op| *op == ClientOp::Getattr).unwrap();
        let lookup = ClientOp::ALL.iter().position(|op| *op == ClientOp::Lookup).unwrap();
        assert_eq!(report.ops.len(), ClientOp::ALL.len());
        assert_eq!(report.ops[getattr], Some(15));
        assert_eq!(report.ops[lookup], Some(7));
        assert_eq!(report.ops.iter().filter(|v| v.is_some()).count(), 2);
        assert_eq!(report.traces.len(), 3);
        assert_eq!(report.traces[0].syscall, "nfs_getattr");
        assert_eq!(report.traces[0].comm, "ls");
    }

    #[test]
    fn test_unselected_ops_have_no_column() {
        let ops = OpSelection::from_names(&["nfs_lookup".to_string()]).unwrap();
        let mut collector = MetricsCollector::new(OutputUnit::Micros, &ops);
        let batch = Batch {
            ops: vec![op_event(ClientOp::Getattr, 10)],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        assert_eq!(report.ops, vec![None]);
        assert!(report.nfsd.is_empty());
    }

    #[test]
    fn test_io_summary() {
        let mut collector = collector(OutputUnit::Micros);
        let batch = Batch {
            io: vec![
                io_event(IoOp::Read, 4_000, 4096),
                io_event(IoOp::SpliceRead, 2_000, 4096),
                io_event(IoOp::Write, 9_999, 512),
                io_event(IoOp::Write, 1_000, -5),
            ],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        assert_eq!(report.io.reads, 2);
        assert_eq!(report.io.writes, 2);
        assert_eq!(report.io.read_bytes, 8192);
        assert_eq!(report.io.write_bytes, 512);
        assert_eq!(report.io.read_latency, Some(3));
        assert_eq!(report.io.write_latency, Some(5));
    }

    #[test]
    fn test_rpc_summary_counts_end_phase_only() {
        let mut collector = collector(OutputUnit::Micros);
        let mut end = RpcRecord {
            wake_lat: 2_000,
            end_lat: 10_000,
            phase: RpcPhase::End as u32,
            owner: 9,
            ..Default::default()
        };
        fill_name(&mut end.proc_name, b"READ");
        let call_done = RpcRecord {
            phase: RpcPhase::CallDone as u32,
            ..end
        };
        let batch = Batch {
            rpc: vec![call_done, end],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        assert_eq!(report.rpc.calls, 1);
        assert_eq!(report.rpc.avg_end_latency, Some(10));
        assert_eq!(report.rpc.avg_wake_latency, Some(2));
        assert_eq!(report.traces[1].syscall, "READ");
        assert_eq!(report.traces[1].comm, "end");
        assert_eq!(report.traces[0].comm, "call_done");
    }

    #[test]
    fn test_sub_millisecond_ops_dropped_in_millis() {
        let mut collector = collector(OutputUnit::Millis);
        let batch = Batch {
            ops: vec![op_event(ClientOp::Getattr, 500), op_event(ClientOp::Lookup, 2_500)],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        let getattr = ClientOp::ALL.iter().position(|op| *op == ClientOp::Getattr).unwrap();
        let lookup = ClientOp::ALL.iter().position(|op| *op == ClientOp::Lookup).unwrap();
        assert_eq!(report.ops[getattr], None);
        assert_eq!(report.ops[lookup], Some(2));
        assert_eq!(report.traces.len(), 1);
        assert_eq!(report.traces[0].syscall, "nfs_lookup");
        assert!(report.traces.iter().all(|row| row.latency > 0));
    }

    #[test]
    fn test_sub_microsecond_io_dropped_in_micros() {
        let mut collector = collector(OutputUnit::Micros);
        let batch = Batch {
            io: vec![io_event(IoOp::Read, 400, 4096), io_event(IoOp::Read, 3_000, 4096)],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        // Both reads are counted, only one is timed
        assert_eq!(report.io.reads, 2);
        assert_eq!(report.io.read_bytes, 8192);
        assert_eq!(report.io.read_latency, Some(3));
        assert_eq!(report.traces.len(), 1);
        assert_eq!(report.traces[0].latency, 3);
    }

    #[test]
    fn test_zero_after_conversion_never_averaged() {
        let mut collector = collector(OutputUnit::Millis);
        let mut fast = RpcRecord {
            wake_lat: 300_000,
            end_lat: 900_000,
            phase: RpcPhase::End as u32,
            ..Default::default()
        };
        fill_name(&mut fast.proc_name, b"GETATTR");
        let batch = Batch {
            rpc: vec![fast],
            io: vec![io_event(IoOp::Write, 999_999, 1)],
            nfsd: vec![NfsdOpEvent {
                latency_us: 999,
                op: NfsdOp::Read.as_u32(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        assert_eq!(report.rpc.calls, 1);
        assert_eq!(report.rpc.avg_end_latency, None);
        assert_eq!(report.rpc.avg_wake_latency, None);
        assert_eq!(report.io.writes, 1);
        assert_eq!(report.io.write_latency, None);
        assert!(report.nfsd.iter().all(Option::is_none));
        assert!(report.traces.is_empty());
    }

    #[test]
    fn test_packet_counters_are_per_interval() {
        let mut collector = collector(OutputUnit::Micros);
        let mut batch = Batch::default();
        batch.packet_stats.total_packets = 10;
        batch.packet_stats.nfs_bytes = 1000;
        collector.ingest(&batch);

        batch.packet_stats.total_packets = 25;
        batch.packet_stats.nfs_bytes = 1500;
        let report = collector.ingest(&batch);

        assert_eq!(report.xdp.total_packets, 15);
        assert_eq!(report.xdp.nfs_bytes, 500);
        assert_eq!(collector.summary(2).packets.total_packets, 25);
    }

    #[test]
    fn test_linked_ios_and_errors() {
        let mut collector = collector(OutputUnit::Millis);
        let mut err = ErrorEvent {
            status: -5,
            pid: 3,
            ..Default::default()
        };
        fill_name(&mut err.proc_name, b"WRITE");
        let batch = Batch {
            linked: vec![(3, 100), (3, 200), (4, 300)],
            errors: vec![err],
            ..Default::default()
        };

        let report = collector.ingest(&batch);

        assert_eq!(report.linked_ios.get(&3), Some(&2));
        assert_eq!(report.linked_ios.get(&4), Some(&1));
        assert_eq!(report.errors[0].proc_name, "WRITE");
        assert_eq!(report.errors[0].status, -5);

        let summary = collector.summary(1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.linked_ios, 3);
        assert_eq!(summary.intervals, 1);
    }
}
