//! # Error Types
//!
//! Custom error types for FPV Logdump using `thiserror`.

use thiserror::Error;

/// Main error type for FPV Logdump
#[derive(Debug, Error)]
pub enum LogDumpError {
    /// A download session is already open
    #[error("Download of log {0} already in progress, cancel it first")]
    AlreadyActive(u16),

    /// The operation needs catalog entries
    #[error("No logs in catalog, please use log list first")]
    EmptyCatalog,

    /// Operator command could not be parsed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Device link refused an outbound command
    #[error("Device link error: {0}")]
    Link(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors (byte sink open, seek or write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for FPV Logdump
pub type Result<T> = std::result::Result<T, LogDumpError>;
