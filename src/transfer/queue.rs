//! # Download Queue
//!
//! Backlog of log ids waiting to be downloaded one after another. Entries are
//! popped from the end of the list.
//!
//! The builders deliberately produce different orders, and downstream tooling
//! relies on them:
//!
//! - [`DownloadQueue::enqueue_all`]: newest log first
//! - [`DownloadQueue::enqueue_from`]: skips the `n` oldest, then newest first
//! - [`DownloadQueue::enqueue_range`]: ascending id order
//!
//! ```
//! use fpv_logdump::transfer::queue::DownloadQueue;
//!
//! let mut queue = DownloadQueue::new();
//! queue.enqueue_range(5, 8);
//!
//! let drained: Vec<u16> = std::iter::from_fn(|| queue.pop()).collect();
//! assert_eq!(drained, vec![5, 6, 7, 8]);
//! ```

use crate::catalog::LogCatalog;

/// Ordered backlog of log ids, consumed from the end
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadQueue {
    pending: Vec<u16>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue every catalog entry, oldest at the bottom
    pub fn enqueue_all(&mut self, catalog: &LogCatalog) {
        self.pending = catalog.sorted_by_timestamp();
    }

    /// Queue ids `first..=last` so they pop in ascending order
    pub fn enqueue_range(&mut self, first: u16, last: u16) {
        self.pending = (first..=last).rev().collect();
    }

    /// Queue catalog entries except the `skip` oldest
    pub fn enqueue_from(&mut self, catalog: &LogCatalog, skip: usize) {
        self.pending = catalog.sorted_by_timestamp().into_iter().skip(skip).collect();
    }

    /// Take the next id to download
    pub fn pop(&mut self) -> Option<u16> {
        self.pending.pop()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Pending ids in storage order (the last one pops first)
    pub fn pending(&self) -> &[u16] {
        &self.pending
    }
}
