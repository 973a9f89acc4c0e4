//! nfs-fault - fault-injection harnesses
//!
//! Small programs run against an NFS mount while nfsdig is tracing it.
//!
//! ```bash
//! # Does an mtime-only update still advance ctime?
//! ./nfs-fault ctime /mnt/nfs
//!
//! # Read at an invalid offset to produce an error status
//! ./nfs-fault einval /mnt/nfs
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::{
    fs::{File, FileTimes, OpenOptions},
    io::{Read, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
    time::{Duration, UNIX_EPOCH},
};

/// Fault-injection harnesses for NFS mounts
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Verbose logging
    #[clap(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update only the modification time and check that ctime advanced
    Ctime {
        /// Directory on the mount under test
        dir: PathBuf,

        /// Wait between the two stats, in milliseconds
        #[clap(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Read at an invalid offset and report the errno
    Einval {
        /// Directory on the mount under test
        dir: PathBuf,
    },
}

const TEST_FILE: &str = "nfs-fault-testfile";

/// Modification time written by the ctime check
const MTIME_SECS: u64 = 1_000_000_000;

/// Whether ctime moved across an mtime-only update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CtimeCheck {
    before: (i64, i64),
    after: (i64, i64),
}

impl CtimeCheck {
    fn advanced(&self) -> bool {
        self.after > self.before
    }
}

fn ctime_of(file: &File) -> Result<(i64, i64)> {
    let meta = file.metadata().context("Failed to stat test file")?;
    Ok((meta.ctime(), meta.ctime_nsec()))
}

fn check_ctime(dir: &Path, wait: Duration) -> Result<CtimeCheck> {
    let path = dir.join(TEST_FILE);
    let file = File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;

    let before = ctime_of(&file)?;
    thread::sleep(wait);

    let mtime = UNIX_EPOCH + Duration::from_secs(MTIME_SECS);
    file.set_times(FileTimes::new().set_modified(mtime))
        .context("Failed to set modification time")?;

    let after = ctime_of(&file)?;
    Ok(CtimeCheck { before, after })
}

/// Outcome of reading past the largest valid offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvalidRead {
    /// Seek or read failed with this errno
    Failed(i32),
    /// The read returned data
    Read(usize),
}

fn read_invalid_offset(dir: &Path) -> Result<InvalidRead> {
    let path = dir.join(TEST_FILE);
    File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut file = OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    // lseek sees -1
    let errno = |e: std::io::Error| e.raw_os_error().unwrap_or(0);
    if let Err(e) = file.seek(SeekFrom::Start(u64::MAX)) {
        return Ok(InvalidRead::Failed(errno(e)));
    }

    let mut buf = [0u8; 1024];
    match file.read(&mut buf) {
        Ok(n) => Ok(InvalidRead::Read(n)),
        Err(e) => Ok(InvalidRead::Failed(errno(e))),
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match args.command {
        Command::Ctime { dir, wait_ms } => {
            let check = check_ctime(&dir, Duration::from_millis(wait_ms))?;
            info!("ctime before: {}.{:09}", check.before.0, check.before.1);
            info!("ctime after:  {}.{:09}", check.after.0, check.after.1);
            if check.advanced() {
                info!("update ctime success");
                Ok(ExitCode::SUCCESS)
            } else {
                warn!("failed to update ctime!");
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Einval { dir } => {
            match read_invalid_offset(&dir)? {
                InvalidRead::Failed(errno) => {
                    info!("Triggered error: {} ({})", std::io::Error::from_raw_os_error(errno), errno)
                }
                InvalidRead::Read(n) => warn!("Unexpected success: read {} bytes", n),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctime_advances_on_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_ctime(dir.path(), Duration::from_millis(20)).unwrap();
        assert!(check.advanced(), "{:?}", check);

        let mtime = std::fs::metadata(dir.path().join(TEST_FILE)).unwrap().mtime();
        assert_eq!(mtime, MTIME_SECS as i64);
    }

    #[test]
    fn test_invalid_offset_is_einval() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_invalid_offset(dir.path()).unwrap(), InvalidRead::Failed(22));
    }

    #[test]
    fn test_ctime_check_compares_nanoseconds() {
        let check = CtimeCheck {
            before: (10, 5),
            after: (10, 6),
        };
        assert!(check.advanced());
        assert!(!CtimeCheck { before: (10, 6), after: (10, 6) }.advanced());
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["nfs-fault", "ctime", "/mnt/nfs", "--wait-ms", "5"]).unwrap();
        match args.command {
            Command::Ctime { dir, wait_ms } => {
                assert_eq!(dir, PathBuf::from("/mnt/nfs"));
                assert_eq!(wait_ms, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Args::try_parse_from(["nfs-fault", "einval"]).is_err());
    }
}
