// Migration logger
//
// Structured, leveled records kept in a bounded in-memory ring. Every record
// is mirrored to the `log` facade; an optional JSON-lines file sink receives
// each record as it is written, and the ring can be flushed into the options
// table so `status` can show recent activity from another process.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::{LOG_KEY, LOG_KV_PERSIST_LIMIT, LOG_RING_CAPACITY, TIMESTAMP_FORMAT};
use crate::error::Result;
use crate::store::{ContentStore, MediaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<MediaId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

struct LoggerInner {
    ring: VecDeque<LogRecord>,
    file_sink: Option<PathBuf>,
}

pub struct Logger {
    capacity: usize,
    min_level: LogLevel,
    inner: Mutex<LoggerInner>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LOG_RING_CAPACITY)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("capacity", &self.capacity)
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl Logger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            min_level: LogLevel::Debug,
            inner: Mutex::new(LoggerInner {
                ring: VecDeque::with_capacity(capacity.max(1)),
                file_sink: None,
            }),
        }
    }

    /// Append every record as one JSON line to `path`.
    pub fn with_file_sink(self, path: impl Into<PathBuf>) -> Self {
        self.lock().file_sink = Some(path.into());
        self
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoggerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log(
        &self,
        level: LogLevel,
        event: &str,
        item_id: Option<MediaId>,
        message: impl Into<String>,
        fields: serde_json::Value,
    ) {
        if level < self.min_level {
            return;
        }

        let record = LogRecord {
            ts: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
            level,
            event: event.to_string(),
            item_id,
            message: message.into(),
            fields,
        };

        match record.item_id {
            Some(id) => log::log!(target: "migrator", level.as_log_level(), "[{}] item {}: {}", record.event, id, record.message),
            None => log::log!(target: "migrator", level.as_log_level(), "[{}] {}", record.event, record.message),
        }

        let mut inner = self.lock();
        if let Some(path) = &inner.file_sink {
            if let Err(e) = append_line(path, &record) {
                log::warn!("Log file sink {} failed: {}", path.display(), e);
            }
        }
        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
    }

    pub fn debug(&self, event: &str, item_id: Option<MediaId>, message: impl Into<String>) {
        self.log(LogLevel::Debug, event, item_id, message, serde_json::Value::Null);
    }

    pub fn info(&self, event: &str, item_id: Option<MediaId>, message: impl Into<String>) {
        self.log(LogLevel::Info, event, item_id, message, serde_json::Value::Null);
    }

    pub fn warn(&self, event: &str, item_id: Option<MediaId>, message: impl Into<String>) {
        self.log(LogLevel::Warn, event, item_id, message, serde_json::Value::Null);
    }

    pub fn error(&self, event: &str, item_id: Option<MediaId>, message: impl Into<String>) {
        self.log(LogLevel::Error, event, item_id, message, serde_json::Value::Null);
    }

    /// Snapshot of the ring, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().ring.iter().cloned().collect()
    }

    /// Records concerning one item, oldest first.
    pub fn records_for(&self, item_id: MediaId) -> Vec<LogRecord> {
        self.lock()
            .ring
            .iter()
            .filter(|r| r.item_id == Some(item_id))
            .cloned()
            .collect()
    }

    /// Persist the newest records into the options table, merged with what
    /// is already there so records from earlier runs survive.
    pub fn flush_to_store(&self, store: &dyn ContentStore) -> Result<()> {
        let mut persisted = Self::load_persisted(store)?;
        let fresh = self.records();

        // Ring entries up to the persisted tail were flushed already
        let skip = match persisted.last() {
            Some(tail) => fresh.iter().rposition(|r| r == tail).map(|i| i + 1).unwrap_or(0),
            None => 0,
        };
        persisted.extend(fresh.into_iter().skip(skip));

        if persisted.len() > LOG_KV_PERSIST_LIMIT {
            let excess = persisted.len() - LOG_KV_PERSIST_LIMIT;
            persisted.drain(..excess);
        }

        store.kv_set(LOG_KEY, &serde_json::to_string(&persisted)?)
    }

    /// Records previously flushed to the store.
    pub fn load_persisted(store: &dyn ContentStore) -> Result<Vec<LogRecord>> {
        match store.kv_get(LOG_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }
}

fn append_line(path: &PathBuf, record: &LogRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    writeln!(file, "{}", line)
}
