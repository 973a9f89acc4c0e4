//! nfsdig Userspace Library
//!
//! Loads the NFS probes, drains their maps every interval and writes the
//! CSV reports. The [`replay`] module drives the same correlation logic
//! from a recorded script, without a kernel.

pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod replay;
pub mod types;

pub use collector::MetricsCollector;
pub use config::{Args, Config};
pub use events::{EventProcessor, EventSource, KernelSource};
pub use exporter::{CsvExporter, JsonExporter};
pub use loader::{Globals, ProbeLoader};
pub use replay::Replayer;
pub use types::*;
