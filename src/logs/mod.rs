//! Log Store - bounded in-memory buffer of structured log records
//!
//! Keeps the newest `capacity` records in append order and answers
//! filtered, offset-paginated queries for the operations dashboard.
//! Records normally arrive through [`LogStoreLayer`], which mirrors every
//! `tracing` event into the store.

pub mod layer;
pub mod subscriber;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

pub use layer::LogStoreLayer;
pub use subscriber::init_tracing;

/// Default number of records kept
pub const DEFAULT_CAPACITY: usize = 1000;
/// Default page size for queries
pub const DEFAULT_QUERY_LIMIT: usize = 50;
/// Source tag used when a caller gives none
pub const DEFAULT_SOURCE: &str = "core";

/// Severity of a record, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// All levels in ascending severity
    pub fn all() -> &'static [LogLevel] {
        &[
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ]
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}'")]
pub struct UnknownLevel(pub String);

impl std::str::FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" | "FATAL" => Ok(LogLevel::Critical),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

/// One immutable log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(message: impl Into<String>, level: LogLevel, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Filter and pagination parameters for [`LogStore::query`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub limit: usize,
    pub offset: usize,
    /// Minimum severity (inclusive)
    pub level: Option<LogLevel>,
    /// Exact source tag
    pub source: Option<String>,
    /// Inclusive lower bound on the record timestamp
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp
    pub end_time: Option<DateTime<Utc>>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
            level: None,
            source: None,
            start_time: None,
            end_time: None,
        }
    }
}

impl LogQuery {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the minimum level from a string. Unknown names leave the level
    /// unfiltered, matching how the dashboard passes free-form input.
    pub fn level_str(mut self, level: &str) -> Self {
        self.level = level.parse().ok();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(level) = self.level {
            if record.level < level {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &record.source != source {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// Window `[start, end)` over `len` filtered records, counted from the newest
fn page_bounds(len: usize, limit: usize, offset: usize) -> (usize, usize) {
    // Paging past the oldest record yields the whole filtered set
    if offset >= len {
        return (0, len);
    }
    let end = len - offset;
    let start = end.saturating_sub(limit);
    (start, end)
}

/// Fixed-capacity, append-only record buffer
pub struct LogStore {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl LogStore {
    /// Create a store holding at most `capacity` records (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message stamped with the current time
    pub fn append(&self, message: impl Into<String>, level: LogLevel, source: impl Into<String>) {
        self.push(LogRecord::new(message, level, source));
    }

    /// Append an INFO record from the default source
    pub fn info(&self, message: impl Into<String>) {
        self.append(message, LogLevel::Info, DEFAULT_SOURCE);
    }

    /// Append a prebuilt record, dropping the oldest past capacity
    pub fn push(&self, record: LogRecord) {
        let mut records = self.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    /// Filter, then paginate from the newest end.
    ///
    /// With filtered records `F` (oldest first) the result is
    /// `F[max(0, len - limit - offset) .. len - offset]`, or all of `F`
    /// once `offset >= len`. Records come back in append order.
    pub fn query(&self, query: &LogQuery) -> Vec<LogRecord> {
        let records = self.lock();
        let filtered: Vec<&LogRecord> = records.iter().filter(|r| query.matches(r)).collect();
        let (start, end) = page_bounds(filtered.len(), query.limit, query.offset);
        filtered[start..end].iter().map(|r| (*r).clone()).collect()
    }

    /// The newest `limit` records, unfiltered
    pub fn recent(&self, limit: usize) -> Vec<LogRecord> {
        self.query(&LogQuery::new(limit, 0))
    }

    /// Record count per level, for a dashboard summary
    pub fn level_counts(&self) -> BTreeMap<LogLevel, usize> {
        let mut counts = BTreeMap::new();
        for record in self.lock().iter() {
            *counts.entry(record.level).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every record
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
