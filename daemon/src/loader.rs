//! eBPF program loader
//!
//! Handles loading the eBPF object with its load-time globals and attaching
//! the kprobes, sunrpc tracepoints and the XDP classifier.

use crate::config::{Config, Tracks, XdpMode};
use anyhow::{Context, Result};
use aya::{
    programs::{KProbe, TracePoint, Xdp, XdpFlags},
    Bpf, BpfLoader,
};
use aya_log::BpfLogger;
use log::{info, warn};
use nfsdig_common::PacketFilter;
use std::path::PathBuf;

/// sunrpc tracepoints driving the RPC task lifecycle
const RPC_TRACEPOINTS: [&str; 4] = [
    "rpc_task_begin",
    "rpc_task_wakeup",
    "rpc_task_call_done",
    "rpc_task_end",
];

/// XDP program name in the object
const XDP_PROGRAM: &str = "nfsdig_xdp";

/// Result of attaching an optional eBPF program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    /// Program successfully attached
    Attached,
    /// Kernel lacks the attach point; skipped with a warning
    Skipped,
}

/// Values patched into the object before verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Globals {
    pub filter_pid: u32,
    pub delay_probability: u64,
    pub delay_us: u32,
    pub packet_filter: PacketFilter,
}

impl From<&Config> for Globals {
    fn from(config: &Config) -> Self {
        Self {
            filter_pid: config.filter_pid,
            delay_probability: config.delay_probability,
            delay_us: config.delay_us,
            packet_filter: config.packet_filter,
        }
    }
}

impl From<XdpMode> for XdpFlags {
    fn from(mode: XdpMode) -> Self {
        match mode {
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hardware => XdpFlags::HW_MODE,
        }
    }
}

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    /// * `globals` - Load-time configuration of the kernel programs
    pub fn load(path: Option<PathBuf>, globals: &Globals) -> Result<Self> {
        info!("Loading eBPF program...");

        let data = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../kernel/target/bpfel-unknown-none/release/nfsdig"
                ))
                .to_vec()
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        let ebpf = BpfLoader::new()
            .set_global("FILTER_PID", &globals.filter_pid, true)
            .set_global("DELAY_PROBABILITY", &globals.delay_probability, true)
            .set_global("DELAY_US", &globals.delay_us, true)
            .set_global("PACKET_FILTER", &globals.packet_filter, true)
            .load(&data)
            .context("Failed to load eBPF program")?;

        info!("eBPF program loaded successfully");
        if globals.filter_pid != 0 {
            info!("   Tracing pid {} only", globals.filter_pid);
        }
        if globals.delay_probability != 0 {
            info!(
                "   Delaying {}% of nfs_permission calls by {}us",
                globals.delay_probability, globals.delay_us
            );
        }

        Ok(Self { ebpf })
    }

    /// Initialize eBPF logger
    ///
    /// Forwards kernel-side log records to the `log` facade.
    /// Non-fatal if it fails.
    pub fn init_logger(&mut self) {
        if let Err(e) = BpfLogger::init(&mut self.ebpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
    }

    /// Load `program` and attach it to `symbol`
    ///
    /// A program missing from the object or rejected by the verifier is an
    /// error. A symbol the running kernel does not have is skipped.
    fn attach_kprobe(&mut self, program: &str, symbol: &str) -> Result<AttachResult> {
        let probe: &mut KProbe = self
            .ebpf
            .program_mut(program)
            .with_context(|| format!("{} program not found in eBPF object", program))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", program))?;
        probe
            .load()
            .with_context(|| format!("Failed to load {}", program))?;
        match probe.attach(symbol, 0) {
            Ok(_) => Ok(AttachResult::Attached),
            Err(e) => {
                warn!("  ⚠ Failed to attach {} (not available on this kernel): {}", program, e);
                Ok(AttachResult::Skipped)
            }
        }
    }

    /// Attach an entry/exit pair for `symbol`
    fn attach_pair(&mut self, symbol: &str, entry: &str, exit: &str) -> Result<usize> {
        let mut attached = 0;
        for program in [entry, exit] {
            if self.attach_kprobe(program, symbol)? == AttachResult::Attached {
                attached += 1;
            }
        }
        if attached == 2 {
            info!("  ✓ Attached to {}", symbol);
        }
        Ok(attached)
    }

    /// Attach kprobes/kretprobes for every selected operation
    ///
    /// # Returns
    ///
    /// Number of programs attached
    pub fn attach_kprobes(&mut self, config: &Config) -> Result<usize> {
        let mut attached = 0;
        let tracks = config.tracks;

        if tracks.io {
            info!("Attaching kprobes for VFS read/write...");
            for op in &config.ops.io {
                attached += self.attach_pair(op.name(), op.entry_program(), op.exit_program())?;
            }
        }

        if tracks.ops {
            info!("Attaching kprobes for NFS client operations...");
            for op in &config.ops.client {
                attached += self.attach_pair(op.name(), op.entry_program(), op.exit_program())?;
            }
        }

        if tracks.nfsd {
            info!("Attaching kprobes for NFSv4 server operations...");
            for op in &config.ops.nfsd {
                attached += self.attach_pair(op.name(), op.entry_program(), op.exit_program())?;
            }
        }

        if tracks.rpc {
            info!("Attaching kprobe for RPC task submission...");
            if self.attach_kprobe("rpc_execute", "rpc_execute")? == AttachResult::Attached {
                info!("  ✓ Attached to rpc_execute");
                attached += 1;
            }
        }

        info!("{} kprobes attached", attached);
        Ok(attached)
    }

    /// Attach the sunrpc task lifecycle tracepoints
    ///
    /// Attaches to:
    /// - sunrpc:rpc_task_begin
    /// - sunrpc:rpc_task_wakeup
    /// - sunrpc:rpc_task_call_done
    /// - sunrpc:rpc_task_end
    pub fn attach_tracepoints(&mut self, tracks: &Tracks) -> Result<usize> {
        if !tracks.rpc {
            return Ok(0);
        }
        info!("Attaching tracepoints...");

        let mut attached = 0;
        for name in RPC_TRACEPOINTS {
            let program: &mut TracePoint = self
                .ebpf
                .program_mut(name)
                .with_context(|| format!("{} program not found in eBPF object", name))?
                .try_into()
                .with_context(|| format!("Failed to get {} as TracePoint", name))?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
            match program.attach("sunrpc", name) {
                Ok(_) => {
                    info!("  ✓ Attached to sunrpc:{} tracepoint", name);
                    attached += 1;
                }
                Err(e) => warn!(
                    "  ⚠ Failed to attach sunrpc:{} tracepoint (not available on this kernel): {}",
                    name, e
                ),
            }
        }

        Ok(attached)
    }

    /// Attach XDP program to network interface
    ///
    /// Unlike the kprobes, an XDP attach failure is fatal: the classifier
    /// was asked for explicitly.
    pub fn attach_xdp(&mut self, interface: &str, mode: XdpMode) -> Result<AttachResult> {
        info!("Attaching XDP program...");

        let program: &mut Xdp = self
            .ebpf
            .program_mut(XDP_PROGRAM)
            .with_context(|| format!("{} program not found in eBPF object", XDP_PROGRAM))?
            .try_into()
            .with_context(|| format!("Failed to get {} as XDP", XDP_PROGRAM))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", XDP_PROGRAM))?;
        program.attach(interface, mode.into()).with_context(|| {
            format!(
                "Failed to attach XDP to interface '{}' - check permissions and interface exists",
                interface
            )
        })?;
        info!("  ✓ Attached XDP to {} ({:?} mode)", interface, mode);
        Ok(AttachResult::Attached)
    }

    /// Get reference to the eBPF object
    ///
    /// Useful for accessing maps or programs directly.
    pub fn ebpf(&mut self) -> &mut Bpf {
        &mut self.ebpf
    }
}
