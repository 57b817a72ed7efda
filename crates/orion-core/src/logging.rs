//! Per-sidecar transcript files.
//!
//! Every line written to or read from the child can be appended to
//! `{dir}/{id}.log` with a UTC timestamp and a direction tag. Diagnostics go
//! through the `log` facade; transcripts are a separate raw record.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::Utc;

/// Thread-safe handle to an append-only transcript file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Which stream a transcript line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Stdin => "STDIN",
            Direction::Stdout => "STDOUT",
            Direction::Stderr => "STDERR",
        })
    }
}

/// ISO 8601 UTC with milliseconds, e.g. `2026-02-04T10:15:30.123Z`.
fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Write a timestamped line to the transcript (if one is open).
pub fn log_line(handle: &LogHandle, direction: Direction, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let data = data.trim_end_matches('\n');
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{dir}/{id}.log`. Without a directory, or when the file
/// cannot be opened, the handle is a no-op sink.
pub fn open_log_file(dir: Option<&Path>, id: &str) -> LogHandle {
    let file = dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("Failed to create transcript dir {}: {e}", dir.display());
            return None;
        }
        let path = dir.join(format!("{id}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("Failed to open transcript {}: {e}", path.display());
                None
            }
        }
    });
    Arc::new(Mutex::new(file))
}

/// A handle that discards everything.
pub fn disabled() -> LogHandle {
    Arc::new(Mutex::new(None))
}
