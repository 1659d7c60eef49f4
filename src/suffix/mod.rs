//! Suffix arrays over byte buffers.
//!
//! Two constructions produce the same ordering: [`qsufsort`] (Larsson and
//! Sadakane doubling, optionally splitting groups in parallel) and [`dc3`]
//! (Kärkkäinen and Sanders skew). [`PartitionedSuffixArray`] bounds memory on
//! large buffers by sorting equal slices independently.

mod dc3;
mod psa;
mod qsufsort;

pub use dc3::dc3;
pub use psa::PartitionedSuffixArray;
pub use qsufsort::qsufsort;

use crate::error::{Error, Result};

/// How qsufsort splits the unsorted groups of each doubling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortConcurrency {
    #[default]
    Sequential,
    /// Split disjoint groups on this many threads.
    Parallel(usize),
}

impl SortConcurrency {
    /// Parallel over every logical CPU.
    pub fn parallel() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        SortConcurrency::Parallel(workers)
    }
}

/// Largest buffer addressable with 32-bit suffix indices (one slot is the
/// empty suffix).
pub const MAX_INPUT: usize = i32::MAX as usize - 1;

pub(crate) fn check_input_size(len: usize) -> Result<()> {
    if len > MAX_INPUT {
        return Err(Error::malformed(format!(
            "buffer of {len} bytes is too large for a 32-bit suffix array"
        )));
    }
    Ok(())
}

/// Length of the common prefix of `a` and `b`.
pub(crate) fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
pub(crate) fn assert_sorted(data: &[u8], sa: &[i32]) {
    assert_eq!(sa.len(), data.len());
    for pair in sa.windows(2) {
        assert!(
            data[pair[0] as usize..] < data[pair[1] as usize..],
            "suffix {} should sort before {}",
            pair[0],
            pair[1]
        );
    }
}
