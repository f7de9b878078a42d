//! # Chunk Coverage Tracker
//!
//! Records which 90-byte chunks of the in-flight log have been written and
//! works out what to ask the device for again.
//!
//! ## Completion
//!
//! Completion is a *count* check: the log is complete when the number of
//! received chunks equals `1 + terminal_index`. Out-of-order delivery that
//! covers every chunk completes; a missing interior chunk never does.
//!
//! ## Missing ranges
//!
//! Gaps below the highest received chunk are coalesced into contiguous runs
//! and reported in ascending order:
//!
//! ```
//! use fpv_logdump::transfer::coverage::{ChunkRange, CoverageTracker};
//!
//! let mut coverage = CoverageTracker::new();
//! for chunk in [0u32, 1, 4, 5, 7] {
//!     coverage.mark_received(chunk * 90, 90);
//! }
//!
//! assert_eq!(
//!     coverage.missing_ranges(20),
//!     vec![ChunkRange { start: 2, len: 2 }, ChunkRange { start: 6, len: 1 }]
//! );
//! ```

use std::collections::BTreeSet;

use crate::protocol::CHUNK_SIZE;

/// Contiguous run of missing chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First missing chunk index
    pub start: u32,
    /// Number of consecutive missing chunks
    pub len: u32,
}

impl ChunkRange {
    /// Byte offset of the first missing chunk
    pub fn byte_offset(&self) -> u32 {
        self.start * CHUNK_SIZE
    }

    /// Length of the run in bytes
    pub fn byte_len(&self) -> u32 {
        self.len * CHUNK_SIZE
    }
}

/// Set of received chunk indices for one download
#[derive(Debug, Clone, Default)]
pub struct CoverageTracker {
    received: BTreeSet<u32>,
}

impl CoverageTracker {
    /// Creates an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every received chunk
    pub fn reset(&mut self) {
        self.received.clear();
    }

    /// Record a written unit; zero-length units cover nothing
    pub fn mark_received(&mut self, offset: u32, count: u32) {
        if count > 0 {
            self.received.insert(offset / CHUNK_SIZE);
        }
    }

    /// Number of distinct chunks received
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Highest chunk index received so far
    pub fn highest(&self) -> Option<u32> {
        self.received.iter().next_back().copied()
    }

    /// Whether every chunk up to and including the terminal unit has arrived
    ///
    /// `terminal_offset` is the byte offset of the short or zero-length unit
    /// that ends the log.
    pub fn is_complete(&self, terminal_offset: u32) -> bool {
        self.received.len() as u64 == 1 + u64::from(terminal_offset / CHUNK_SIZE)
    }

    /// Number of chunks missing below the highest received chunk
    pub fn missing_count(&self) -> usize {
        match self.highest() {
            Some(highest) => highest as usize + 1 - self.received.len(),
            None => 0,
        }
    }

    /// Coalesced gaps in `[0, highest]`, ascending, at most `limit` of them
    pub fn missing_ranges(&self, limit: usize) -> Vec<ChunkRange> {
        let mut ranges = Vec::new();
        let mut next_expected = 0u32;

        for &chunk in &self.received {
            if ranges.len() >= limit {
                break;
            }
            if chunk > next_expected {
                ranges.push(ChunkRange {
                    start: next_expected,
                    len: chunk - next_expected,
                });
            }
            next_expected = chunk + 1;
        }

        ranges
    }
}
