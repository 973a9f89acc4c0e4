//! Metrics exporters
//!
//! CSV files for the per-interval reports and a JSON run summary.

use crate::{
    config::{OpSelection, OutputMode, OutputUnit},
    types::*,
};
use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

const IO_HEADER: &str = "Time,Reads,Writes,ReadBytes,WriteBytes,ReadLatency,WriteLatency";
const RPC_HEADER: &str = "Time,Calls,AvgWakeLatency,AvgEndLatency";
const XDP_HEADER: &str = "Time,TotalPackets,NfsPackets,TcpPackets,UdpPackets,TotalBytes,NfsBytes";
const TRACE_HEADER: &str = "Time,PID,Comm,Syscall,Latency,Return";
const ERRORS_HEADER: &str = "Time,PID,Proc,Status";
const LINKED_HEADER: &str = "Time,PID,LinkedIOs";
const COMPOUNDS_HEADER: &str = "Time,Xid,Source,Destination,Protocol,DataSize";

/// One CSV file, header already written
struct CsvFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl CsvFile {
    fn create(dir: &Path, name: &str, header: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create output file: {:?}", path))?;
        let mut csv = Self {
            path,
            out: BufWriter::new(file),
        };
        csv.row(header)?;
        Ok(csv)
    }

    fn row(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{}", line)
            .with_context(|| format!("Failed to write to output file: {:?}", self.path))
    }

    fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("Failed to write to output file: {:?}", self.path))
    }
}

/// Empty cell for a missing value
fn cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Commas and newlines would break the row
fn text(value: &str) -> String {
    value.replace([',', '\n', '\r'], " ")
}

/// Header of a per-op latency file
fn latency_header<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let mut header = String::from("Time");
    for name in names {
        header.push(',');
        header.push_str(name);
        header.push_str("_latency");
    }
    header
}

/// Per-interval CSV writer
pub struct CsvExporter {
    mode: OutputMode,
    unit: OutputUnit,
    dir: PathBuf,
    ops: CsvFile,
    nfsd: CsvFile,
    io: CsvFile,
    rpc: CsvFile,
    xdp: CsvFile,
    errors: CsvFile,
    linked: CsvFile,
    compounds: Option<CsvFile>,
}

impl CsvExporter {
    /// Create the output directory and every file with its header
    ///
    /// # Arguments
    ///
    /// * `dir` - Output directory (created if missing)
    /// * `mode` - Metrics (one row per interval) or trace (one row per event)
    /// * `unit` - Latency unit, for the log line only; values arrive converted
    /// * `ops` - Operations with a metrics column
    pub fn create(dir: &Path, mode: OutputMode, unit: OutputUnit, ops: &OpSelection) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory: {:?}", dir))?;

        let exporter = match mode {
            OutputMode::Metrics => Self {
                mode,
                unit,
                dir: dir.to_path_buf(),
                ops: CsvFile::create(dir, "ops.csv", &latency_header(ops.client.iter().map(|op| op.name())))?,
                nfsd: CsvFile::create(dir, "nfsd.csv", &latency_header(ops.nfsd.iter().map(|op| op.name())))?,
                io: CsvFile::create(dir, "io.csv", IO_HEADER)?,
                rpc: CsvFile::create(dir, "rpc.csv", RPC_HEADER)?,
                xdp: CsvFile::create(dir, "xdp.csv", XDP_HEADER)?,
                errors: CsvFile::create(dir, "errors.csv", ERRORS_HEADER)?,
                linked: CsvFile::create(dir, "linked.csv", LINKED_HEADER)?,
                compounds: None,
            },
            OutputMode::Trace => Self {
                mode,
                unit,
                dir: dir.to_path_buf(),
                ops: CsvFile::create(dir, Family::Ops.file_name(), TRACE_HEADER)?,
                nfsd: CsvFile::create(dir, Family::Nfsd.file_name(), TRACE_HEADER)?,
                io: CsvFile::create(dir, Family::Io.file_name(), TRACE_HEADER)?,
                rpc: CsvFile::create(dir, Family::Rpc.file_name(), TRACE_HEADER)?,
                xdp: CsvFile::create(dir, "xdp.csv", XDP_HEADER)?,
                errors: CsvFile::create(dir, "errors.csv", ERRORS_HEADER)?,
                linked: CsvFile::create(dir, "linked.csv", LINKED_HEADER)?,
                compounds: Some(CsvFile::create(dir, "compounds.csv", COMPOUNDS_HEADER)?),
            },
        };
        log::info!(
            "Writing {:?} CSV files to {:?} (latency in {})",
            mode,
            dir,
            unit.label()
        );
        Ok(exporter)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn unit(&self) -> OutputUnit {
        self.unit
    }

    /// Append one interval
    pub fn write(&mut self, time: &str, report: &IntervalReport) -> Result<()> {
        match self.mode {
            OutputMode::Metrics => self.write_metrics(time, report)?,
            OutputMode::Trace => self.write_traces(time, report)?,
        }

        let x = &report.xdp;
        self.xdp.row(&format!(
            "{},{},{},{},{},{},{}",
            time, x.total_packets, x.nfs_packets, x.tcp_packets, x.udp_packets, x.total_bytes, x.nfs_bytes
        ))?;

        for e in &report.errors {
            self.errors
                .row(&format!("{},{},{},{}", time, e.pid, text(&e.proc_name), e.status))?;
        }

        for (pid, count) in &report.linked_ios {
            self.linked.row(&format!("{},{},{}", time, pid, count))?;
        }

        for file in [
            &mut self.ops,
            &mut self.nfsd,
            &mut self.io,
            &mut self.rpc,
            &mut self.xdp,
            &mut self.errors,
            &mut self.linked,
        ] {
            file.flush()?;
        }
        if let Some(compounds) = self.compounds.as_mut() {
            compounds.flush()?;
        }
        Ok(())
    }

    fn write_metrics(&mut self, time: &str, report: &IntervalReport) -> Result<()> {
        let mut ops = time.to_string();
        for value in &report.ops {
            ops.push(',');
            ops.push_str(&cell(*value));
        }
        self.ops.row(&ops)?;

        let mut nfsd = time.to_string();
        for value in &report.nfsd {
            nfsd.push(',');
            nfsd.push_str(&cell(*value));
        }
        self.nfsd.row(&nfsd)?;

        let io = &report.io;
        self.io.row(&format!(
            "{},{},{},{},{},{},{}",
            time,
            io.reads,
            io.writes,
            io.read_bytes,
            io.write_bytes,
            cell(io.read_latency),
            cell(io.write_latency)
        ))?;

        let rpc = &report.rpc;
        self.rpc.row(&format!(
            "{},{},{},{}",
            time,
            rpc.calls,
            cell(rpc.avg_wake_latency),
            cell(rpc.avg_end_latency)
        ))?;
        Ok(())
    }

    fn write_traces(&mut self, time: &str, report: &IntervalReport) -> Result<()> {
        for row in &report.traces {
            let file = match row.family {
                Family::Io => &mut self.io,
                Family::Ops => &mut self.ops,
                Family::Nfsd => &mut self.nfsd,
                Family::Rpc => &mut self.rpc,
            };
            file.row(&format!(
                "{},{},{},{},{},{}",
                time,
                row.pid,
                text(&row.comm),
                text(&row.syscall),
                row.latency,
                cell(row.ret)
            ))?;
        }

        if let Some(compounds) = self.compounds.as_mut() {
            for c in &report.compounds {
                compounds.row(&format!(
                    "{},{},{},{},{},{}",
                    time, c.xid, c.source, c.destination, c.protocol, c.data_size
                ))?;
            }
        }
        Ok(())
    }
}

/// JSON exporter for the run summary
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }

    pub fn export(&self, summary: &RunSummary) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(summary)?
        } else {
            serde_json::to_string(summary)?
        };

        let mut file = File::create(&self.output_path)
            .with_context(|| format!("Failed to create output file: {:?}", self.output_path))?;

        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", self.output_path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfsdig_common::{ClientOp, NfsdOp};

    fn selection() -> OpSelection {
        OpSelection {
            io: Vec::new(),
            client: vec![ClientOp::Lookup, ClientOp::Getattr],
            nfsd: vec![NfsdOp::Read],
        }
    }

    fn read(dir: &Path, name: &str) -> Vec<String> {
        fs::read_to_string(dir.join(name))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_metrics_headers() {
        let dir = tempfile::tempdir().unwrap();
        CsvExporter::create(dir.path(), OutputMode::Metrics, OutputUnit::Micros, &selection()).unwrap();

        assert_eq!(read(dir.path(), "ops.csv"), vec!["Time,nfs_lookup_latency,nfs_getattr_latency"]);
        assert_eq!(read(dir.path(), "nfsd.csv"), vec!["Time,nfsd4_read_latency"]);
        assert_eq!(read(dir.path(), "io.csv"), vec![IO_HEADER]);
        assert_eq!(read(dir.path(), "rpc.csv"), vec![RPC_HEADER]);
        assert_eq!(read(dir.path(), "xdp.csv"), vec![XDP_HEADER]);
        assert_eq!(read(dir.path(), "errors.csv"), vec![ERRORS_HEADER]);
        assert!(!dir.path().join("compounds.csv").exists());
    }

    #[test]
    fn test_metrics_row_leaves_missing_samples_blank() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter =
            CsvExporter::create(dir.path(), OutputMode::Metrics, OutputUnit::Micros, &selection()).unwrap();
        let report = IntervalReport {
            ops: vec![None, Some(42)],
            nfsd: vec![Some(7)],
            io: IoSummary {
                reads: 2,
                read_bytes: 8192,
                read_latency: Some(3),
                ..Default::default()
            },
            rpc: RpcSummary {
                calls: 1,
                avg_wake_latency: None,
                avg_end_latency: Some(10),
            },
            errors: vec![ErrorRow {
                pid: 5,
                proc_name: "READ".to_string(),
                status: -13,
            }],
            ..Default::default()
        };

        exporter.write("12:34:56", &report).unwrap();

        assert_eq!(read(dir.path(), "ops.csv")[1], "12:34:56,,42");
        assert_eq!(read(dir.path(), "nfsd.csv")[1], "12:34:56,7");
        assert_eq!(read(dir.path(), "io.csv")[1], "12:34:56,2,0,8192,0,3,");
        assert_eq!(read(dir.path(), "rpc.csv")[1], "12:34:56,1,,10");
        assert_eq!(read(dir.path(), "xdp.csv")[1], "12:34:56,0,0,0,0,0,0");
        assert_eq!(read(dir.path(), "errors.csv")[1], "12:34:56,5,READ,-13");
    }

    #[test]
    fn test_trace_rows_go_to_their_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter =
            CsvExporter::create(dir.path(), OutputMode::Trace, OutputUnit::Millis, &selection()).unwrap();
        let report = IntervalReport {
            traces: vec![
                TraceRow {
                    family: Family::Io,
                    pid: 10,
                    comm: "dd".to_string(),
                    syscall: "nfs_file_read".to_string(),
                    latency: 4,
                    ret: Some(4096),
                },
                TraceRow {
                    family: Family::Ops,
                    pid: 11,
                    comm: "ls".to_string(),
                    syscall: "nfs_getattr".to_string(),
                    latency: 1,
                    ret: None,
                },
            ],
            compounds: vec![CompoundRow {
                xid: 0xabcd,
                source: "10.0.0.1:800".to_string(),
                destination: "10.0.0.2:2049".to_string(),
                protocol: 6,
                data_size: 300,
            }],
            ..Default::default()
        };

        exporter.write("01:02:03", &report).unwrap();

        assert_eq!(read(dir.path(), "io.csv"), vec![TRACE_HEADER, "01:02:03,10,dd,nfs_file_read,4,4096"]);
        assert_eq!(read(dir.path(), "ops.csv"), vec![TRACE_HEADER, "01:02:03,11,ls,nfs_getattr,1,"]);
        assert_eq!(read(dir.path(), "nfsd.csv"), vec![TRACE_HEADER]);
        assert_eq!(
            read(dir.path(), "compounds.csv")[1],
            "01:02:03,43981,10.0.0.1:800,10.0.0.2:2049,6,300"
        );
    }

    #[test]
    fn test_text_cells_cannot_split_rows() {
        assert_eq!(text("a,b\nc"), "a b c");
    }

    #[test]
    fn test_json_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = RunSummary {
            duration_seconds: 60,
            io_events: 1000,
            ..Default::default()
        };

        JsonExporter::new(path.clone(), true).export(&summary).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["duration_seconds"], 60);
        assert_eq!(json["io_events"], 1000);
    }
}
