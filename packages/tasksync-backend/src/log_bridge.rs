/// Logger setup: env_logger formatting to stderr, plus a bounded in-memory
/// ring of recent records (served on `GET /logs`) and an optional log file.
use env_logger::Logger;
use log::{Log, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, OnceLock};

const MAX_LOG_ENTRIES: usize = 2000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    fn push(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > MAX_LOG_ENTRIES {
                entries.pop_front();
            }
        }
    }

    fn recent_entries(&self, limit: usize) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

static LOG_RING: LazyLock<LogRing> = LazyLock::new(|| LogRing {
    entries: Mutex::new(VecDeque::with_capacity(MAX_LOG_ENTRIES)),
});

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn format_log_line(entry: &LogEntry) -> String {
    format!(
        "{} [{}] [{}] {}",
        entry.timestamp_ms,
        entry.level.to_uppercase(),
        entry.target,
        entry.message.replace('\n', "\\n")
    )
}

struct RingLogger {
    inner: Logger,
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);

        let entry = LogEntry {
            timestamp_ms: now_millis(),
            level: record.level().to_string().to_lowercase(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        };
        if let Some(file) = LOG_FILE.get() {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{}", format_log_line(&entry));
            }
        }
        LOG_RING.push(entry);
    }

    fn flush(&self) {
        self.inner.flush();
        if let Some(file) = LOG_FILE.get() {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Install the logger. `RUST_LOG` controls the filter, default `info`.
pub fn init(log_file: Option<PathBuf>) -> Result<(), SetLoggerError> {
    if let Some(path) = log_file {
        match open_log_file(&path) {
            Ok(file) => {
                let _ = LOG_FILE.set(Mutex::new(file));
            }
            Err(e) => eprintln!("failed to open log file {}: {}", path.display(), e),
        }
    }
    let inner =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let max_level = inner.filter();
    let logger = Box::leak(Box::new(RingLogger { inner }));
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Most recent `limit` records, oldest first.
pub fn recent_entries(limit: usize) -> Vec<LogEntry> {
    LOG_RING.recent_entries(limit.min(MAX_LOG_ENTRIES))
}
