//! Tracing subscriber setup.
//!
//! Logs go to stderr, or to `gateway.log` in a log directory. Each startup
//! shifts the previous file to `gateway.log.1` and keeps three generations.
//! File output is flushed on every write.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "mcp_gateway=info,warn";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "gateway.log";

/// Rotated generations kept next to the live log file.
const KEEP_ROTATED: u32 = 3;

/// Where and how to log.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Log directory; `None` logs to stderr.
    pub dir: Option<PathBuf>,
    /// JSON lines instead of human-readable text.
    pub json: bool,
}

/// Platform data directory for the gateway.
///
/// Falls back to `~/.mcp-gateway/` when no data directory can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-gateway")
}

/// Install the global subscriber. Returns the log file path when logging
/// to a file.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, log_path, ansi) = match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let log_path = dir.join(LOG_FILE_NAME);
            shift_generations(&log_path, KEEP_ROTATED);

            let log = SyncedLog::open(&log_path)
                .with_context(|| format!("failed to open {}", log_path.display()))?;
            (BoxMakeWriter::new(log), Some(log_path), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path
            .as_ref()
            .map_or_else(|| "stderr".to_string(), |p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-gateway starting ==="
    );
    Ok(log_path)
}

// ─── Log file ────────────────────────────────────────────────────────────────

/// `gateway.log` with generation `n` becomes `gateway.log.n`.
fn generation(base: &Path, n: u32) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Move `base` to generation 1, shifting older generations up and dropping
/// the one past `keep`. Gaps in the chain are fine.
fn shift_generations(base: &Path, keep: u32) {
    if keep == 0 {
        return;
    }
    if let Err(e) = std::fs::remove_file(generation(base, keep)) {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("mcp-gateway: cannot drop oldest log: {e}");
        }
    }
    for n in (1..keep).rev() {
        let _ = std::fs::rename(generation(base, n), generation(base, n + 1));
    }
    if base.exists() {
        let _ = std::fs::rename(base, generation(base, 1));
    }
}

/// Shared append-mode log file; each write goes straight to disk.
#[derive(Clone)]
struct SyncedLog(Arc<Mutex<File>>);

impl SyncedLog {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut File) -> std::io::Result<T>) -> std::io::Result<T> {
        // A panic mid-write leaves the file usable.
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut file)
    }
}

impl Write for SyncedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for SyncedLog {
    type Writer = SyncedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
