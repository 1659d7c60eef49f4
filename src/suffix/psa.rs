use rayon::prelude::*;
use tracing::debug;

use crate::error::Result;
use crate::suffix::{match_len, qsufsort, SortConcurrency};

struct Partition {
    start: usize,
    end: usize,
    sa: Vec<i32>,
}

/// Suffix arrays of `p` equal slices of one buffer, built in parallel.
///
/// A match found in a slice may run past the slice end into the rest of the
/// buffer.
pub struct PartitionedSuffixArray<'a> {
    data: &'a [u8],
    partitions: Vec<Partition>,
}

impl<'a> PartitionedSuffixArray<'a> {
    pub fn new(data: &'a [u8], partitions: usize, concurrency: SortConcurrency) -> Result<Self> {
        let count = partitions.clamp(1, data.len().max(1));
        let slice = data.len().div_ceil(count);
        let bounds: Vec<(usize, usize)> = (0..count)
            .map(|i| ((i * slice).min(data.len()), ((i + 1) * slice).min(data.len())))
            .collect();

        let partitions = bounds
            .into_par_iter()
            .map(|(start, end)| {
                let sa = qsufsort(&data[start..end], concurrency)?;
                Ok(Partition { start, end, sa })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(bytes = data.len(), partitions = partitions.len(), "suffix arrays ready");
        Ok(Self { data, partitions })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Longest prefix of `needle` found in the buffer, as `(position, length)`.
    /// Ties go to the lower position.
    pub fn search(&self, needle: &[u8]) -> (usize, usize) {
        let mut best = (0usize, 0usize);
        for partition in &self.partitions {
            let (pos, len) = self.search_partition(partition, needle);
            if len > best.1 || (len == best.1 && len > 0 && pos < best.0) {
                best = (pos, len);
            }
        }
        best
    }

    fn search_partition(&self, partition: &Partition, needle: &[u8]) -> (usize, usize) {
        let sa = &partition.sa;
        if sa.is_empty() {
            return (partition.start, 0);
        }
        let text = &self.data[partition.start..partition.end];

        let (mut st, mut en) = (0usize, sa.len() - 1);
        while en - st >= 2 {
            let mid = st + (en - st) / 2;
            let suffix = &text[sa[mid] as usize..];
            let n = suffix.len().min(needle.len());
            if suffix[..n] < needle[..n] {
                st = mid;
            } else {
                en = mid;
            }
        }

        let at = |i: usize| partition.start + sa[i] as usize;
        let x = match_len(&self.data[at(st)..], needle);
        let y = match_len(&self.data[at(en)..], needle);
        if x > y || (x == y && at(st) < at(en)) {
            (at(st), x)
        } else {
            (at(en), y)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(data: &[u8], needle: &[u8]) -> usize {
        (0..data.len())
            .map(|i| match_len(&data[i..], needle))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn finds_longest_match_across_partitions() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        for parts in [1, 2, 3, 7] {
            let psa = PartitionedSuffixArray::new(&data, parts, SortConcurrency::Sequential).unwrap();
            let (pos, len) = psa.search(b"lazy cat");
            assert_eq!((pos, len), (35, 5), "{parts} partitions");

            // Each occurrence sits in its own partition here, so the tie
            // between them is decided across partitions.
            if parts == 2 {
                assert_eq!(psa.search(b"the ").0, 0);
            }
            let (pos, len) = psa.search(b"the ");
            assert_eq!(len, 4);
            assert!(pos == 0 || pos == 31);
        }
    }

    #[test]
    fn match_length_equals_brute_force() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 13) as u8).collect();
        let psa = PartitionedSuffixArray::new(&data, 4, SortConcurrency::Sequential).unwrap();
        for start in [0, 17, 999, 4990] {
            let needle = &data[start..(start + 40).min(data.len())];
            let (pos, len) = psa.search(needle);
            assert_eq!(len, brute_force(&data, needle));
            assert_eq!(&data[pos..pos + len], &needle[..len]);
        }
    }

    #[test]
    fn empty_buffer_matches_nothing() {
        let psa = PartitionedSuffixArray::new(b"", 4, SortConcurrency::Sequential).unwrap();
        assert_eq!(psa.search(b"abc").1, 0);
    }
}
