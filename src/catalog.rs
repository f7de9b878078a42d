//! # Log Catalog
//!
//! Metadata for the logs stored on the device, learned from catalog-entry
//! replies. The device is authoritative: a later entry for the same id
//! replaces the earlier one.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::LogEntry;

/// Metadata of one stored log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMetadata {
    pub id: u16,
    /// Size in bytes, 0 when the device does not know it
    pub size: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub total_logs: u16,
    pub last_log_id: u16,
}

impl From<&LogEntry> for LogMetadata {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id,
            size: entry.size,
            timestamp: entry.timestamp(),
            total_logs: entry.num_logs,
            last_log_id: entry.last_log_num,
        }
    }
}

impl fmt::Display for LogMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Log {}  numLogs {} lastLog {} size {}",
            self.id, self.total_logs, self.last_log_id, self.size
        )?;
        if let Some(ts) = self.timestamp {
            write!(f, " {}", ts.format("%a %b %e %H:%M:%S %Y"))?;
        }
        Ok(())
    }
}

/// What a catalog entry did to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogUpdate {
    /// The device reported that it holds no logs
    NoLogs,
    /// The entry was stored
    Stored(LogMetadata),
}

/// Log id to metadata map plus the device's reported log count
#[derive(Debug, Clone, Default)]
pub struct LogCatalog {
    entries: BTreeMap<u16, LogMetadata>,
    log_count: Option<u16>,
}

impl LogCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry and the reported count
    pub fn clear(&mut self) {
        self.entries.clear();
        self.log_count = None;
    }

    /// Forget the reported count so a fresh listing can be awaited
    pub fn clear_count(&mut self) {
        self.log_count = None;
    }

    /// Log count from the latest catalog reply, if one arrived since the last clear
    pub fn log_count(&self) -> Option<u16> {
        self.log_count
    }

    /// Apply a catalog-entry reply
    ///
    /// An entry with `num_logs == 0` only records the zero count; stored
    /// entries are left alone.
    pub fn upsert(&mut self, entry: &LogEntry) -> CatalogUpdate {
        self.log_count = Some(entry.num_logs);
        if entry.num_logs == 0 {
            return CatalogUpdate::NoLogs;
        }
        let metadata = LogMetadata::from(entry);
        self.entries.insert(entry.id, metadata.clone());
        CatalogUpdate::Stored(metadata)
    }

    pub fn get(&self, id: u16) -> Option<&LogMetadata> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All known log ids, ascending
    pub fn ids(&self) -> Vec<u16> {
        self.entries.keys().copied().collect()
    }

    /// Log ids ordered oldest first; logs without a timestamp sort first
    ///
    /// Equal timestamps keep ascending id order.
    pub fn sorted_by_timestamp(&self) -> Vec<u16> {
        let mut ids = self.ids();
        ids.sort_by_key(|id| self.entries[id].timestamp);
        ids
    }

    /// Id of the most recent log
    pub fn latest(&self) -> Option<u16> {
        self.sorted_by_timestamp().last().copied()
    }
}
