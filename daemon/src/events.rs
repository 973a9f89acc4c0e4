//! Event draining
//!
//! The kernel programs leave completed events in BPF queues and packet
//! records in hash maps. Every interval the drainer empties them into a
//! [`Batch`], aggregates it and hands the report to the exporter.

use crate::{
    collector::MetricsCollector,
    exporter::CsvExporter,
    types::*,
};
use anyhow::{Context, Result};
use aya::{
    maps::{HashMap, MapData, PerCpuArray, Queue},
    Bpf,
};
use log::{debug, info, warn};
use nfsdig_common::constants::MAX_STATS;
use std::time::Duration;
use tokio::{
    signal,
    time::{interval, sleep, Instant, MissedTickBehavior},
};

/// Anything that can be drained into a [`Batch`]
pub trait EventSource {
    /// Collect everything produced since the previous drain
    fn drain(&mut self) -> Result<Batch>;
}

// ============================================================================
// Kernel Maps
// ============================================================================

/// The daemon's view of the loaded programs' output maps
pub struct KernelSource {
    io_events: Queue<MapData, IoEvent>,
    op_events: Queue<MapData, OpEvent>,
    nfsd_events: Queue<MapData, NfsdOpEvent>,
    rpc_events: Queue<MapData, RpcRecord>,
    error_events: Queue<MapData, ErrorEvent>,
    packet_records: HashMap<MapData, u32, PacketRecord>,
    xid_records: HashMap<MapData, u32, PacketRecord>,
    packet_stats: PerCpuArray<MapData, PacketStats>,
    stats: PerCpuArray<MapData, u64>,
    link_end: HashMap<MapData, u32, u64>,
}

fn take<T>(ebpf: &mut Bpf, name: &str) -> Result<T>
where
    T: TryFrom<aya::maps::Map, Error = aya::maps::MapError>,
{
    let map = ebpf
        .take_map(name)
        .with_context(|| format!("{} map not found in eBPF object", name))?;
    T::try_from(map).with_context(|| format!("Failed to open {} map", name))
}

impl KernelSource {
    /// Take ownership of the output maps
    pub fn new(ebpf: &mut Bpf) -> Result<Self> {
        Ok(Self {
            io_events: take(ebpf, "IO_EVENTS")?,
            op_events: take(ebpf, "OP_EVENTS")?,
            nfsd_events: take(ebpf, "NFSD_OP_EVENTS")?,
            rpc_events: take(ebpf, "RPC_EVENTS")?,
            error_events: take(ebpf, "ERROR_EVENTS")?,
            packet_records: take(ebpf, "PACKET_RECORDS")?,
            xid_records: take(ebpf, "XID_RECORDS")?,
            packet_stats: take(ebpf, "PACKET_STATS")?,
            stats: take(ebpf, "STATS")?,
            link_end: take(ebpf, "LINK_END")?,
        })
    }
}

/// Pop until the queue reports empty
fn pop_all<T: aya::Pod>(queue: &mut Queue<MapData, T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = queue.pop(0) {
        events.push(event);
    }
    events
}

/// Read every entry, then delete the keys that were read
///
/// An entry rewritten between the read and the delete is lost.
fn read_then_delete<V: aya::Pod>(map: &mut HashMap<MapData, u32, V>) -> Vec<(u32, V)> {
    let keys: Vec<u32> = map.keys().filter_map(|k| k.ok()).collect();
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        if let Ok(value) = map.get(&key, 0) {
            entries.push((key, value));
        }
        if let Err(e) = map.remove(&key) {
            debug!("Failed to delete key {}: {}", key, e);
        }
    }
    entries
}

impl EventSource for KernelSource {
    fn drain(&mut self) -> Result<Batch> {
        let mut batch = Batch {
            io: pop_all(&mut self.io_events),
            ops: pop_all(&mut self.op_events),
            nfsd: pop_all(&mut self.nfsd_events),
            rpc: pop_all(&mut self.rpc_events),
            errors: pop_all(&mut self.error_events),
            packets: read_then_delete(&mut self.packet_records)
                .into_iter()
                .map(|(_, r)| r)
                .collect(),
            compounds: read_then_delete(&mut self.xid_records)
                .into_iter()
                .map(|(_, r)| r)
                .collect(),
            linked: read_then_delete(&mut self.link_end),
            ..Default::default()
        };

        let per_cpu = self
            .packet_stats
            .get(&0, 0)
            .context("Failed to read PACKET_STATS")?;
        for cpu in per_cpu.iter() {
            batch.packet_stats.total_packets += cpu.total_packets;
            batch.packet_stats.nfs_packets += cpu.nfs_packets;
            batch.packet_stats.tcp_packets += cpu.tcp_packets;
            batch.packet_stats.udp_packets += cpu.udp_packets;
            batch.packet_stats.total_bytes += cpu.total_bytes;
            batch.packet_stats.nfs_bytes += cpu.nfs_bytes;
        }

        for index in 0..MAX_STATS {
            match self.stats.get(&index, 0) {
                Ok(per_cpu) => batch.probe_stats[index as usize] = per_cpu.iter().sum(),
                Err(e) => warn!("Failed to read STATS[{}]: {}", index, e),
            }
        }

        Ok(batch)
    }
}

// ============================================================================
// Processing Loop
// ============================================================================

/// Drains a source, aggregates and exports every interval
pub struct EventProcessor {
    collector: MetricsCollector,
    exporter: CsvExporter,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `collector` - Aggregates each drained batch
    /// * `exporter` - Writes the interval report
    pub fn new(collector: MetricsCollector, exporter: CsvExporter) -> Self {
        Self {
            collector,
            exporter,
        }
    }

    /// Drain once and export the result, stamped with the local time
    pub fn tick(&mut self, source: &mut dyn EventSource) -> Result<()> {
        let time = chrono::Local::now().format("%H:%M:%S").to_string();
        self.tick_at(source, &time)
    }

    /// Drain once and export the result under `time`
    pub fn tick_at(&mut self, source: &mut dyn EventSource, time: &str) -> Result<()> {
        let batch = source.drain()?;
        debug!(
            "Drained {} events, {} packet records, {} compounds",
            batch.event_count(),
            batch.packets.len(),
            batch.compounds.len()
        );
        let report = self.collector.ingest(&batch);
        self.exporter
            .write(time, &report)
            .context("Failed to export interval")?;
        Ok(())
    }

    /// Drain every `period` until `duration` elapses or Ctrl-C
    ///
    /// Returns the elapsed run time in seconds.
    pub async fn run(
        &mut self,
        source: &mut dyn EventSource,
        period: Duration,
        duration: Option<Duration>,
    ) -> Result<u64> {
        let start_time = Instant::now();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let deadline = async {
            match duration {
                Some(d) => sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(source)?;
                }
                _ = &mut deadline => {
                    info!("Duration reached, shutting down...");
                    break;
                }
                _ = signal::ctrl_c() => {
                    info!("Interrupted, shutting down...");
                    break;
                }
            }
        }

        // Whatever arrived since the last tick
        self.tick(source)?;
        Ok(start_time.elapsed().as_secs())
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    pub fn exporter(&self) -> &CsvExporter {
        &self.exporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpSelection, OutputMode, OutputUnit};
    use nfsdig_common::ClientOp;

    /// Hands out pre-built batches, then empty ones
    struct Scripted(Vec<Batch>);

    impl EventSource for Scripted {
        fn drain(&mut self) -> Result<Batch> {
            Ok(if self.0.is_empty() {
                Batch::default()
            } else {
                self.0.remove(0)
            })
        }
    }

    fn processor(dir: &std::path::Path) -> EventProcessor {
        let ops = OpSelection::all();
        let collector = MetricsCollector::new(OutputUnit::Micros, &ops);
        let exporter = CsvExporter::create(dir, OutputMode::Metrics, OutputUnit::Micros, &ops).unwrap();
        EventProcessor::new(collector, exporter)
    }

    #[test]
    fn test_tick_exports_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        let mut source = Scripted(vec![Batch {
            ops: vec![OpEvent {
                latency_us: 12,
                op: ClientOp::Getattr.as_u32(),
                ..Default::default()
            }],
            ..Default::default()
        }]);

        processor.tick_at(&mut source, "10:00:00").unwrap();

        let ops = std::fs::read_to_string(dir.path().join("ops.csv")).unwrap();
        let rows: Vec<&str> = ops.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].starts_with("10:00:00,"));
        assert!(rows[1].contains(",12"));
        assert_eq!(processor.collector().summary(0).op_events, 1);
    }

    #[tokio::test]
    async fn test_run_stops_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        let mut source = Scripted(Vec::new());

        processor
            .run(
                &mut source,
                Duration::from_millis(10),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let intervals = processor.collector().summary(0).intervals;
        assert!(intervals >= 2, "only {} intervals", intervals);
    }
}
