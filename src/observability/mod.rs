//! Logging setup.
//!
//! The daemon logs through `tracing` to `~/.remotecode/remotecode.log`. A
//! single `.old` generation is kept: when the live file crosses 5 MiB it is
//! renamed to `remotecode.log.old` and a fresh file is started. Rotation is
//! checked at startup and again before each write by the writer wrapper.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Writer that appends to the log file and rotates it at [`MAX_LOG_SIZE`].
struct RotatingWriter {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rotate_if_needed(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let old = self.path.with_extension("log.old");
        let _ = std::fs::rename(&self.path, &old);
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_SIZE {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() >= MAX_LOG_SIZE {
            let old = path.with_extension("log.old");
            std::fs::rename(path, old)?;
        }
    }
    Ok(())
}

/// Initialize tracing for the daemon. `verbose` raises the default filter
/// from `info` to `debug`; `RUST_LOG` wins when set.
pub fn init(log_path: PathBuf, verbose: bool) -> std::io::Result<()> {
    let default = if verbose {
        "remotecode=debug,info"
    } else {
        "remotecode=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let writer = Mutex::new(RotatingWriter::open(log_path)?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(())
}

/// Initialize stderr-only tracing (used before config is loaded and by
/// foreground runs).
pub fn init_stderr(verbose: bool) {
    let default = if verbose {
        "remotecode=debug,info"
    } else {
        "remotecode=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
