//! Command line and run configuration
//!
//! `Args` is what clap parses; `Config` is the validated form the rest of
//! the daemon works with.

use anyhow::{bail, Context, Result};
use clap::Parser;
use nfsdig_common::{
    constants::{IPPROTO_TCP, IPPROTO_UDP, NFS_PORT},
    ClientOp, IoOp, NfsdOp, PacketFilter,
};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

/// NFS client, server and RPC latency tracing with eBPF
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Only trace this process id (0 = all processes)
    #[clap(short, long, default_value_t = 0)]
    pub pid: u32,

    /// Comma-separated kernel functions to trace (default: all)
    #[clap(long, value_delimiter = ',')]
    pub ops: Vec<String>,

    /// Directory the CSV files are written to
    #[clap(short, long, default_value = "nfsdig-out")]
    pub output_dir: PathBuf,

    /// Sampling interval in seconds
    #[clap(short, long, default_value_t = 1)]
    pub interval: u64,

    /// Duration to run (in seconds, 0 = until Ctrl-C)
    #[clap(short, long, default_value_t = 0)]
    pub duration: u64,

    /// Latency unit in the output (us, ms)
    #[clap(long, default_value = "us")]
    pub unit: String,

    /// Output mode (metrics, trace)
    #[clap(short, long, default_value = "metrics")]
    pub mode: String,

    /// Chance in percent of delaying an nfs_permission call (0 = off)
    #[clap(long, default_value_t = 0)]
    pub delay_probability: u64,

    /// Injected nfs_permission delay in microseconds
    #[clap(long, default_value_t = 20)]
    pub delay_us: u32,

    /// XDP filter: source address
    #[clap(long)]
    pub src_ip: Option<Ipv4Addr>,

    /// XDP filter: destination address
    #[clap(long)]
    pub dst_ip: Option<Ipv4Addr>,

    /// XDP filter: source port (0 = unset)
    #[clap(long, default_value_t = NFS_PORT)]
    pub src_port: u16,

    /// XDP filter: destination port (0 = unset)
    #[clap(long, default_value_t = NFS_PORT)]
    pub dst_port: u16,

    /// XDP filter: protocol (tcp, udp, any or an IP protocol number)
    #[clap(long, default_value = "any")]
    pub protocol: String,

    /// Trace VFS read/write
    #[clap(long)]
    pub track_io: bool,

    /// Trace the RPC task lifecycle
    #[clap(long)]
    pub track_rpc: bool,

    /// Trace NFS client file/inode/dentry operations
    #[clap(long)]
    pub track_ops: bool,

    /// Trace NFSv4 server operations
    #[clap(long)]
    pub track_nfsd: bool,

    /// Attach the XDP packet classifier
    #[clap(long)]
    pub xdp: bool,

    /// Interface for the XDP classifier
    #[clap(long, default_value = "eth0")]
    pub iface: String,

    /// XDP attach mode (skb, drv, hw)
    #[clap(long, default_value = "skb")]
    pub xdp_mode: String,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    pub ebpf_object: Option<PathBuf>,

    /// Replay a JSON-lines script of probe firings instead of loading probes
    #[clap(long)]
    pub replay: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    pub verbose: bool,
}

/// Latency unit of the CSV columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputUnit {
    Micros,
    Millis,
}

impl OutputUnit {
    /// Convert a nanosecond latency, truncating
    pub fn from_nanos(self, ns: u64) -> u64 {
        match self {
            OutputUnit::Micros => ns / 1_000,
            OutputUnit::Millis => ns / 1_000_000,
        }
    }

    /// Convert a microsecond latency, truncating
    pub fn from_micros(self, us: u64) -> u64 {
        match self {
            OutputUnit::Micros => us,
            OutputUnit::Millis => us / 1_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OutputUnit::Micros => "us",
            OutputUnit::Millis => "ms",
        }
    }
}

/// What goes into the CSV files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One row per interval with per-op averages
    Metrics,
    /// One row per event
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    Skb,
    Driver,
    Hardware,
}

/// Probe families to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracks {
    pub io: bool,
    pub rpc: bool,
    pub ops: bool,
    pub nfsd: bool,
    pub xdp: bool,
}

/// Operations selected with `--ops`, per registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSelection {
    pub io: Vec<IoOp>,
    pub client: Vec<ClientOp>,
    pub nfsd: Vec<NfsdOp>,
}

impl OpSelection {
    /// Every operation of every registry
    pub fn all() -> Self {
        Self {
            io: IoOp::ALL.to_vec(),
            client: ClientOp::ALL.to_vec(),
            nfsd: NfsdOp::ALL.to_vec(),
        }
    }

    /// Resolve kernel function names against the registries
    ///
    /// An empty list selects everything. Otherwise a registry contributes
    /// only the operations that were named.
    pub fn from_names(names: &[String]) -> Result<Self> {
        let names: Vec<&str> = names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()).collect();
        if names.is_empty() {
            return Ok(Self::all());
        }

        let mut selection = Self {
            io: Vec::new(),
            client: Vec::new(),
            nfsd: Vec::new(),
        };
        for name in names {
            if let Some(op) = IoOp::from_name(name) {
                selection.io.push(op);
            } else if let Some(op) = ClientOp::from_name(name) {
                selection.client.push(op);
            } else if let Some(op) = NfsdOp::from_name(name) {
                selection.nfsd.push(op);
            } else {
                bail!("Unknown operation: {}", name);
            }
        }
        selection.io.sort();
        selection.io.dedup();
        selection.client.sort();
        selection.client.dedup();
        selection.nfsd.sort();
        selection.nfsd.dedup();
        Ok(selection)
    }
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub filter_pid: u32,
    pub ops: OpSelection,
    pub output_dir: PathBuf,
    pub interval: Duration,
    /// `None` runs until interrupted
    pub duration: Option<Duration>,
    pub unit: OutputUnit,
    pub mode: OutputMode,
    pub delay_probability: u64,
    pub delay_us: u32,
    pub packet_filter: PacketFilter,
    pub tracks: Tracks,
    pub iface: String,
    pub xdp_mode: XdpMode,
    pub ebpf_object: Option<PathBuf>,
    pub replay: Option<PathBuf>,
    pub verbose: bool,
}

impl TryFrom<Args> for Config {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        if args.interval == 0 {
            bail!("Interval must be >= 1 second");
        }
        if args.delay_probability > 100 {
            bail!(
                "Delay probability is a percentage, got {}",
                args.delay_probability
            );
        }

        let unit = match args.unit.to_lowercase().as_str() {
            "us" | "usec" => OutputUnit::Micros,
            "ms" | "msec" => OutputUnit::Millis,
            _ => bail!("Unsupported unit: {}. Use us or ms", args.unit),
        };

        let mode = match args.mode.to_lowercase().as_str() {
            "metrics" => OutputMode::Metrics,
            "trace" => OutputMode::Trace,
            _ => bail!("Unsupported mode: {}. Use metrics or trace", args.mode),
        };

        let xdp_mode = match args.xdp_mode.to_lowercase().as_str() {
            "skb" | "generic" => XdpMode::Skb,
            "drv" | "native" => XdpMode::Driver,
            "hw" | "offload" => XdpMode::Hardware,
            _ => bail!("Unsupported XDP mode: {}. Use skb, drv or hw", args.xdp_mode),
        };

        let protocol = parse_protocol(&args.protocol)?;
        let ops = OpSelection::from_names(&args.ops)?;

        // No track switch means every kprobe family
        let any_track = args.track_io || args.track_rpc || args.track_ops || args.track_nfsd;
        let tracks = Tracks {
            io: args.track_io || !any_track,
            rpc: args.track_rpc || !any_track,
            ops: args.track_ops || !any_track,
            nfsd: args.track_nfsd || !any_track,
            xdp: args.xdp,
        };

        let packet_filter = PacketFilter {
            src_ip: args.src_ip.map(u32::from).unwrap_or(0),
            dst_ip: args.dst_ip.map(u32::from).unwrap_or(0),
            src_port: args.src_port,
            dst_port: args.dst_port,
            protocol,
            _padding: [0; 3],
        };

        Ok(Self {
            filter_pid: args.pid,
            ops,
            output_dir: args.output_dir,
            interval: Duration::from_secs(args.interval),
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            unit,
            mode,
            delay_probability: args.delay_probability,
            delay_us: args.delay_us,
            packet_filter,
            tracks,
            iface: args.iface,
            xdp_mode,
            ebpf_object: args.ebpf_object,
            replay: args.replay,
            verbose: args.verbose,
        })
    }
}

fn parse_protocol(value: &str) -> Result<u8> {
    match value.to_lowercase().as_str() {
        "any" | "all" => Ok(0),
        "tcp" => Ok(IPPROTO_TCP),
        "udp" => Ok(IPPROTO_UDP),
        other => other
            .parse::<u8>()
            .with_context(|| format!("Unsupported protocol: {}. Use tcp, udp, any or a number", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &[&str]) -> Result<Config> {
        let mut argv = vec!["nfsdig"];
        argv.extend_from_slice(extra);
        Config::try_from(Args::try_parse_from(argv)?)
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();

        assert_eq!(cfg.filter_pid, 0);
        assert_eq!(cfg.unit, OutputUnit::Micros);
        assert_eq!(cfg.mode, OutputMode::Metrics);
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.duration, None);
        assert_eq!(cfg.ops, OpSelection::all());
        assert!(cfg.tracks.io && cfg.tracks.rpc && cfg.tracks.ops && cfg.tracks.nfsd);
        assert!(!cfg.tracks.xdp);
        assert_eq!(cfg.packet_filter.src_port, NFS_PORT);
        assert_eq!(cfg.packet_filter.dst_port, NFS_PORT);
        assert_eq!(cfg.packet_filter.protocol, 0);
    }

    #[test]
    fn test_ops_are_split_by_registry() {
        let cfg = config(&["--ops", "nfs_getattr,nfsd4_read,nfs_file_read,nfs_getattr"]).unwrap();

        assert_eq!(cfg.ops.io, vec![IoOp::Read]);
        assert_eq!(cfg.ops.client, vec![ClientOp::Getattr]);
        assert_eq!(cfg.ops.nfsd, vec![NfsdOp::Read]);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let err = config(&["--ops", "nfs_getattr,tcp_sendmsg"]).unwrap_err();
        assert!(err.to_string().contains("tcp_sendmsg"));
    }

    #[test]
    fn test_track_switches_narrow_the_probe_set() {
        let cfg = config(&["--track-rpc", "--xdp"]).unwrap();

        assert!(cfg.tracks.rpc);
        assert!(cfg.tracks.xdp);
        assert!(!cfg.tracks.io);
        assert!(!cfg.tracks.ops);
        assert!(!cfg.tracks.nfsd);
    }

    #[test]
    fn test_packet_filter() {
        let cfg = config(&[
            "--src-ip",
            "10.0.0.1",
            "--dst-port",
            "0",
            "--protocol",
            "udp",
        ])
        .unwrap();

        assert_eq!(cfg.packet_filter.src_ip, 0x0a00_0001);
        assert_eq!(cfg.packet_filter.dst_ip, 0);
        assert_eq!(cfg.packet_filter.dst_port, 0);
        assert_eq!(cfg.packet_filter.protocol, IPPROTO_UDP);
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&["--delay-probability", "101"]).is_err());
        assert!(config(&["--interval", "0"]).is_err());
        assert!(config(&["--unit", "s"]).is_err());
        assert!(config(&["--mode", "json"]).is_err());
        assert!(config(&["--protocol", "sctp"]).is_err());
        assert!(config(&["--xdp-mode", "fast"]).is_err());
    }

    #[test]
    fn test_unit_conversion_truncates() {
        assert_eq!(OutputUnit::Micros.from_nanos(1_999), 1);
        assert_eq!(OutputUnit::Millis.from_nanos(1_999_999), 1);
        assert_eq!(OutputUnit::Millis.from_micros(999), 0);
        assert_eq!(OutputUnit::Micros.from_micros(999), 999);
    }

    #[test]
    fn test_duration_and_unit() {
        let cfg = config(&["-d", "30", "--unit", "ms", "-m", "trace"]).unwrap();

        assert_eq!(cfg.duration, Some(Duration::from_secs(30)));
        assert_eq!(cfg.unit, OutputUnit::Millis);
        assert_eq!(cfg.mode, OutputMode::Trace);
    }
}
