//! nfsdig - Userspace Program
//!
//! Loads the NFS tracing programs, attaches the kprobes, sunrpc
//! tracepoints and optionally the XDP classifier, then writes one CSV row
//! per interval.
//!
//! ## Usage
//!
//! ```bash
//! # Client and server op latencies, one row per second
//! sudo ./nfsdig --ebpf-object path/to/nfsdig
//!
//! # Per-event trace of one process for 30 seconds, in milliseconds
//! sudo ./nfsdig --pid 1234 --mode trace --unit ms --duration 30
//!
//! # Only getattr and read, plus the packet classifier on eth1
//! sudo ./nfsdig --ops nfs_getattr,nfsd4_read --xdp --iface eth1
//!
//! # Delay 10% of nfs_permission calls by 100us
//! sudo ./nfsdig --delay-probability 10 --delay-us 100
//!
//! # Run a recorded probe script without a kernel
//! ./nfsdig --replay session.jsonl
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use nfsdig::{
    collector::MetricsCollector,
    config::{Args, Config},
    events::{EventProcessor, KernelSource},
    exporter::{CsvExporter, JsonExporter},
    loader::{Globals, ProbeLoader},
    replay::{parse_script, Replayer},
    types::RunSummary,
};
use std::{fs::File, io::BufReader, path::Path};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = Config::try_from(args)?;

    info!("Starting nfsdig...");
    info!(
        "   Duration: {} seconds",
        config
            .duration
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|| "infinite".to_string())
    );
    info!("   Interval: {} seconds", config.interval.as_secs());
    info!("   Output: {:?} ({:?} mode, {})", config.output_dir, config.mode, config.unit.label());

    let collector = MetricsCollector::new(config.unit, &config.ops);
    let exporter = CsvExporter::create(&config.output_dir, config.mode, config.unit, &config.ops)?;
    let mut processor = EventProcessor::new(collector, exporter);

    let elapsed = match &config.replay {
        Some(script) => replay(&config, script, &mut processor)?,
        None => trace(&config, &mut processor).await?,
    };

    info!("Generating run summary...");
    let summary = processor.collector().summary(elapsed);
    let summary_path = config.output_dir.join("summary.json");
    JsonExporter::new(summary_path.clone(), true).export(&summary)?;
    info!("Summary written to {:?}", summary_path);

    print_summary(&summary);

    Ok(())
}

/// Load, attach and drain the kernel programs until the run ends
async fn trace(config: &Config, processor: &mut EventProcessor) -> Result<u64> {
    let mut loader = ProbeLoader::load(config.ebpf_object.clone(), &Globals::from(config))?;

    // Initialize eBPF logger (optional)
    loader.init_logger();

    loader.attach_kprobes(config)?;
    loader.attach_tracepoints(&config.tracks)?;
    if config.tracks.xdp {
        loader.attach_xdp(&config.iface, config.xdp_mode)?;
    }

    let mut source = KernelSource::new(loader.ebpf())?;

    info!("Collecting events... press Ctrl-C to stop");
    processor
        .run(&mut source, config.interval, config.duration)
        .await
}

/// Feed a recorded script through the probe logic, one interval per row
fn replay(config: &Config, script: &Path, processor: &mut EventProcessor) -> Result<u64> {
    info!("Replaying {:?}", script);
    let file = File::open(script).with_context(|| format!("Failed to open replay script: {:?}", script))?;
    let firings = parse_script(BufReader::new(file))?;
    info!("   {} probe firings", firings.len());

    let mut replayer = Replayer::new(firings, config.into(), config.interval);
    let mut intervals = 0;
    while !replayer.finished() {
        processor.tick(&mut replayer)?;
        intervals += 1;
    }
    // Events still in flight after the last firing
    processor.tick(&mut replayer)?;

    Ok(intervals * config.interval.as_secs())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║                     nfsdig                        ║
║         NFS latency and RPC tracing (eBPF)        ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(summary: &RunSummary) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Duration:           {} seconds", summary.duration_seconds);
    info!("  Intervals:          {}", summary.intervals);
    info!("");
    info!("  Events:");
    info!("    vfs read/write:   {:>8}", summary.io_events);
    info!("    client ops:       {:>8}", summary.op_events);
    info!("    server ops:       {:>8}", summary.nfsd_events);
    info!("    rpc records:      {:>8}", summary.rpc_events);
    info!("    rpc errors:       {:>8}", summary.errors);
    info!("    linked I/Os:      {:>8}", summary.linked_ios);
    info!("");
    info!("  Packets:");
    info!("    total:            {:>8}", summary.packets.total_packets);
    info!("    nfs:              {:>8}", summary.packets.nfs_packets);
    info!("    recorded:         {:>8}", summary.packets.recorded_packets);
    info!("");
    info!("  Probe Health:");
    for (name, count) in &summary.probe_stats {
        info!("    {:<17} {:>8}", format!("{}:", name), count);
    }
    info!("");
    info!("============================================");
}
