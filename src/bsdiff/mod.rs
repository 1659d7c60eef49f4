//! Bsdiff binary delta: suffix-array matching with fuzzy extension, encoded
//! as control records plus one diff and one extra buffer.

mod diff;
mod patch;

pub use diff::{diff, BsdiffStats};
pub use patch::apply;

use crate::suffix::SortConcurrency;

/// Size of the slices of the new buffer scanned independently.
pub const SCAN_BLOCK_SIZE: usize = 128 * 1024;

/// Scan workers per suffix-array partition.
pub const WORKERS_PER_PARTITION: usize = 12;

/// Depth of each worker's match channel.
pub const MATCH_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsdiffOptions {
    /// Equal slices of the old buffer sorted independently.
    pub partitions: usize,
    /// Scan workers; `None` means `partitions * 12`.
    pub workers: Option<usize>,
    pub sort_concurrency: SortConcurrency,
}

impl Default for BsdiffOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            workers: None,
            sort_concurrency: SortConcurrency::Sequential,
        }
    }
}

impl BsdiffOptions {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or(self.partitions.max(1) * WORKERS_PER_PARTITION)
            .max(1)
    }
}

/// One stretch of the new buffer: `add_length` bytes diffed against old at
/// `add_old_start`, then literal bytes up to `copy_end`. Positions in the
/// new buffer are absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Match {
    pub add_old_start: usize,
    pub add_new_start: usize,
    pub add_length: usize,
    pub copy_end: usize,
}
