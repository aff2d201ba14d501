use chrono::{DateTime, Local, Timelike};
use serde::{Serialize, Serializer};
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ActivityLogEntry {
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Local>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: LogType,
}

impl ActivityLogEntry {
    pub fn new(message: impl Into<String>, kind: LogType) -> Self {
        Self::at(message, kind, Local::now())
    }

    pub fn at(message: impl Into<String>, kind: LogType, timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp: truncate_to_seconds(timestamp),
            message: message.into(),
            kind,
        }
    }
}

/// Fixed-capacity history, most recent entry first.
#[derive(Clone, Debug)]
pub struct ActivityLog {
    entries: VecDeque<ActivityLogEntry>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts at the front, evicting the oldest entry once full.
    pub fn push(&mut self, entry: ActivityLogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<ActivityLogEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn serialize_timestamp<S: Serializer>(
    timestamp: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(timestamp))
}

fn truncate_to_seconds(timestamp: DateTime<Local>) -> DateTime<Local> {
    timestamp.with_nanosecond(0).unwrap_or(timestamp)
}
