//! # Log Transfer Protocol Constants and Types
//!
//! Message and command definitions for the flight controller log transfer
//! protocol. Framing and serialization belong to the link layer; these are the
//! decoded shapes the engine consumes and produces.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Maximum payload of a single data unit in bytes
pub const CHUNK_SIZE: u32 = 90;

/// Data request length meaning "send everything from the offset to the end"
pub const REQUEST_TO_END: u32 = 0xFFFF_FFFF;

/// Highest log id accepted by a catalog listing request
pub const LIST_ALL_END: u16 = 0xFFFF;

/// Maximum number of missing-range requests sent per retry wave
pub const MAX_RANGE_REQUESTS: usize = 20;

/// Scheduler loop rate parameter raised for faster transfer during a dump
pub const SCHED_LOOP_RATE: &str = "SCHED_LOOP_RATE";

/// Catalog entry describing one stored log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log id
    pub id: u16,

    /// Total number of logs on the device (0 means no logs at all)
    pub num_logs: u16,

    /// Id of the newest log
    pub last_log_num: u16,

    /// Log size in bytes (0 means unknown)
    pub size: u32,

    /// UTC timestamp in seconds since the epoch (0 means unknown)
    pub time_utc: u32,
}

impl LogEntry {
    /// Wall-clock timestamp of the log, if the device knew it
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if self.time_utc == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::from(self.time_utc), 0)
    }
}

/// One unit of log data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogData {
    /// Log id the unit belongs to
    pub id: u16,

    /// Byte offset of the unit within the log
    pub ofs: u32,

    /// Number of valid bytes in `data` (0..=90)
    pub count: u8,

    /// Raw payload, possibly padded past `count`
    pub data: Bytes,
}

impl LogData {
    /// Index of the chunk this unit covers
    pub fn chunk_index(&self) -> u32 {
        self.ofs / CHUNK_SIZE
    }

    /// Valid payload bytes, clamped to what was actually delivered
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.count)
            .min(self.data.len())
            .min(CHUNK_SIZE as usize);
        &self.data[..len]
    }

    /// Whether this unit terminates the log (zero or short count)
    pub fn is_terminal(&self) -> bool {
        u32::from(self.count) < CHUNK_SIZE
    }
}

/// Inbound message from the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Catalog entry reply to a list request
    LogEntry(LogEntry),

    /// Data unit reply to a data request
    LogData(LogData),

    /// Free-text device status
    StatusText(String),
}

/// Outbound command to the device
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask for catalog entries with ids in `start..=end`
    RequestList { start: u16, end: u16 },

    /// Ask for `length` bytes of a log starting at `offset`
    RequestData { log_id: u16, offset: u32, length: u32 },

    /// Finish the transfer and let the device resume logging
    RequestEnd,

    /// Erase every stored log
    EraseAll,

    /// Reboot the flight controller
    Reboot,

    /// Set a device parameter
    ParamSet { name: String, value: f32 },

    /// Save all device parameters to a backup file
    SaveParams { filename: String },
}

impl Command {
    /// Request for a full log transfer starting at byte 0
    pub fn request_full_log(log_id: u16) -> Self {
        Command::RequestData {
            log_id,
            offset: 0,
            length: REQUEST_TO_END,
        }
    }
}

/// Default file name for a downloaded log
pub fn default_log_filename(log_id: u16) -> String {
    format!("log{}.bin", log_id)
}
