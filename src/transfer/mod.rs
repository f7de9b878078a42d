//! # Log Transfer Module
//!
//! Reliable download of logs over the lossy link.
//!
//! This module handles:
//! - Tracking which 90-byte chunks have arrived
//! - Writing unordered data units at their byte offsets
//! - Re-requesting missing ranges on a fixed retry cadence
//! - Queuing several logs for sequential download

pub mod coverage;
pub mod queue;
pub mod session;

pub use coverage::{ChunkRange, CoverageTracker};
pub use queue::DownloadQueue;
pub use session::{DownloadSession, DownloadStatus, DownloadSummary};
