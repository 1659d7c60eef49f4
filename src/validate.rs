//! Checks a reconstructed tree against the signature of the tree it should
//! be, block by block, and reports every mismatch as a wound.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{compute_block_size, BlockHash, Wound, WoundKind, BLOCK_SIZE};
use crate::pool::{NullPool, Pool, ReadSeek};
use crate::signature::{hash_block, Signature};

const BS: usize = BLOCK_SIZE as usize;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub files_checked: usize,
    pub bytes_checked: u64,
    /// `FILE` wounds sent, after merging.
    pub wounds: u64,
    pub wounded_files: u64,
}

#[derive(Debug, Default)]
struct Tally {
    bytes: AtomicU64,
    wounds: AtomicU64,
    wounded_files: AtomicU64,
}

/// Pool whose writers hash what they receive against a signature instead of
/// storing it. Each writer reports its file when dropped.
pub struct ValidatingPool<'a> {
    inner: NullPool,
    signature: &'a Signature,
    wounds: Sender<Wound>,
    tally: Arc<Tally>,
}

impl<'a> ValidatingPool<'a> {
    pub fn new(signature: &'a Signature, wounds: Sender<Wound>) -> Self {
        Self {
            inner: NullPool::new(signature.container.clone()),
            signature,
            wounds,
            tally: Arc::new(Tally::default()),
        }
    }

    /// Wounds file `index` as a whole without reading anything.
    pub fn report_missing(&self, index: usize) -> Result<()> {
        let file = self.signature.container.file(index)?;
        warn!(path = %file.path, "missing from the tree");
        let size = file.size as i64;
        send(&self.wounds, &self.tally, index as i64, 0, size, WoundKind::File);
        self.tally.wounded_files.fetch_add(1, Ordering::Relaxed);
        send(&self.wounds, &self.tally, index as i64, 0, size, WoundKind::ClosedFile);
        Ok(())
    }

    fn report(&self) -> (u64, u64, u64) {
        (
            self.tally.bytes.load(Ordering::Relaxed),
            self.tally.wounds.load(Ordering::Relaxed),
            self.tally.wounded_files.load(Ordering::Relaxed),
        )
    }
}

impl Pool for ValidatingPool<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn size(&self, index: usize) -> u64 {
        self.inner.size(index)
    }

    fn reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek> {
        self.inner.reader(index)
    }

    fn writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        let sink = self.inner.writer(index)?;
        let file = self.signature.container.file(index)?;
        Ok(Box::new(ValidatingWriter {
            sink,
            path: file.path.clone(),
            file_index: index as i64,
            expected_size: file.size,
            hashes: self.signature.file_hashes(index).to_vec(),
            buf: Vec::with_capacity(BS),
            block_index: 0,
            written: 0,
            pending: None,
            wounded: false,
            wounds: self.wounds.clone(),
            tally: self.tally.clone(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

fn send(wounds: &Sender<Wound>, tally: &Tally, file_index: i64, start: i64, end: i64, kind: WoundKind) {
    if kind == WoundKind::File {
        tally.wounds.fetch_add(1, Ordering::Relaxed);
    }
    // A consumer that hung up no longer cares.
    let _ = wounds.send(Wound {
        file_index,
        start,
        end,
        kind,
    });
}

/// Drips writes into whole blocks and compares each with its expected hash.
struct ValidatingWriter {
    sink: Box<dyn Write + Send>,
    path: String,
    file_index: i64,
    expected_size: u64,
    hashes: Vec<BlockHash>,
    buf: Vec<u8>,
    block_index: u64,
    written: u64,
    /// Wounded range not sent yet, so neighbours can merge into it.
    pending: Option<(u64, u64)>,
    wounded: bool,
    wounds: Sender<Wound>,
    tally: Arc<Tally>,
}

impl ValidatingWriter {
    fn check_block(&mut self) {
        let k = self.block_index;
        let start = k * BLOCK_SIZE;
        if start < self.expected_size {
            let intact = self.hashes.get(k as usize).is_some_and(|expected| {
                let actual = hash_block(self.file_index, k as i64, &self.buf);
                actual.weak_hash == expected.weak_hash
                    && actual.short_size == expected.short_size
                    && actual.strong_hash == expected.strong_hash
            });
            if !intact {
                let end = start + compute_block_size(self.expected_size, k);
                self.wound(start, end);
            }
        }
        self.block_index += 1;
        self.buf.clear();
    }

    fn wound(&mut self, start: u64, end: u64) {
        match self.pending {
            Some((s, e)) if start <= e && end >= s => {
                self.pending = Some((s.min(start), e.max(end)));
            }
            _ => {
                self.flush_wound();
                self.pending = Some((start, end));
            }
        }
    }

    fn flush_wound(&mut self) {
        if let Some((start, end)) = self.pending.take() {
            warn!(path = %self.path, start, end, "wounded");
            send(&self.wounds, &self.tally, self.file_index, start as i64, end as i64, WoundKind::File);
            if !self.wounded {
                self.wounded = true;
                self.tally.wounded_files.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn close(&mut self) {
        if !self.buf.is_empty() {
            self.check_block();
        }
        if self.written > self.expected_size {
            self.wound(0, self.expected_size);
        } else if self.written < self.expected_size {
            self.wound(self.written, self.expected_size);
        }
        self.flush_wound();
        send(
            &self.wounds,
            &self.tally,
            self.file_index,
            0,
            self.expected_size as i64,
            WoundKind::ClosedFile,
        );
        self.tally.bytes.fetch_add(self.written, Ordering::Relaxed);
    }
}

impl Write for ValidatingWriter {
    fn write(&mut self, mut data: &[u8]) -> io::Result<usize> {
        self.sink.write_all(data)?;
        let len = data.len();
        self.written += len as u64;
        while !data.is_empty() {
            let take = (BS - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == BS {
                self.check_block();
            }
        }
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl Drop for ValidatingWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Validates every file of `signature`'s container as found under `dir`.
/// Wounds go to `wounds`; only I/O failures end the walk early.
pub fn validate(
    signature: &Signature,
    dir: &Path,
    wounds: &Sender<Wound>,
    cancel: &CancelToken,
) -> Result<ValidationReport> {
    let mut pool = ValidatingPool::new(signature, wounds.clone());
    let mut report = ValidationReport::default();

    for (index, file) in signature.container.files.iter().enumerate() {
        cancel.check()?;
        let path = dir.join(&file.path);
        let handle = match File::open(&path) {
            Ok(handle) if handle.metadata()?.is_file() => Some(handle),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::Io(e).context(format!("opening {}", path.display()))),
        };

        match handle {
            Some(handle) => {
                let mut writer = pool.writer(index)?;
                // One byte past the expected size is enough to tell it is too long.
                let mut limited = BufReader::new(handle).take(file.size + 1);
                io::copy(&mut limited, &mut writer).with_context(|| format!("reading {}", path.display()))?;
            }
            None => pool.report_missing(index)?,
        }
        report.files_checked += 1;
    }
    pool.close()?;

    (report.bytes_checked, report.wounds, report.wounded_files) = pool.report();
    info!(
        files = report.files_checked,
        bytes = report.bytes_checked,
        wounds = report.wounds,
        wounded_files = report.wounded_files,
        "validation finished"
    );
    debug!(dir = %dir.display(), "validated");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Container, WalkOptions};
    use crate::pool::FsPool;
    use crossbeam_channel::unbounded;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(files: &[(&str, &[u8])]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, data) in files {
            let full = tmp.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, data).unwrap();
        }
        tmp
    }

    fn signature(dir: &Path) -> Signature {
        let container = Container::walk(dir, &WalkOptions::default()).unwrap();
        let mut pool = FsPool::new(container.clone(), dir);
        Signature::compute(&container, &mut pool, &CancelToken::new()).unwrap()
    }

    fn run(sig: &Signature, dir: &Path) -> (ValidationReport, Vec<Wound>) {
        let (tx, rx) = unbounded();
        let report = validate(sig, dir, &tx, &CancelToken::new()).unwrap();
        drop(tx);
        (report, rx.iter().collect())
    }

    fn file_wounds(wounds: &[Wound]) -> Vec<(i64, i64)> {
        wounds
            .iter()
            .filter(|w| w.kind == WoundKind::File)
            .map(|w| (w.start, w.end))
            .collect()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect()
    }

    #[test]
    fn hello_against_world_is_one_file_wound() {
        let expected = tree(&[("f", &b"world"[..])]);
        let actual = tree(&[("f", &b"hello"[..])]);
        let (report, wounds) = run(&signature(expected.path()), actual.path());

        assert_eq!(
            wounds,
            vec![
                Wound {
                    file_index: 0,
                    start: 0,
                    end: 5,
                    kind: WoundKind::File
                },
                Wound {
                    file_index: 0,
                    start: 0,
                    end: 5,
                    kind: WoundKind::ClosedFile
                },
            ]
        );
        assert_eq!(report.wounds, 1);
        assert_eq!(report.wounded_files, 1);
    }

    #[test]
    fn intact_tree_only_closes_files() {
        let d = data(3 * BS + 100);
        let dir = tree(&[("a", d.as_slice()), ("b/empty", &b""[..])]);
        let (report, wounds) = run(&signature(dir.path()), dir.path());
        assert_eq!(report.wounds, 0);
        assert_eq!(report.files_checked, 2);
        assert_eq!(report.bytes_checked, d.len() as u64);
        assert!(wounds.iter().all(|w| w.kind == WoundKind::ClosedFile));
        assert_eq!(wounds.len(), 2);
    }

    #[test]
    fn corrupted_byte_wounds_its_block_and_neighbours_merge() {
        let d = data(4 * BS);
        let expected = tree(&[("f", d.as_slice())]);
        let sig = signature(expected.path());

        let mut one = d.clone();
        one[BS + 7] ^= 1;
        let actual = tree(&[("f", one.as_slice())]);
        let (_, wounds) = run(&sig, actual.path());
        assert_eq!(file_wounds(&wounds), vec![(BS as i64, 2 * BS as i64)]);

        let mut two = d.clone();
        two[BS + 7] ^= 1;
        two[2 * BS + 7] ^= 1;
        let actual = tree(&[("f", two.as_slice())]);
        let (report, wounds) = run(&sig, actual.path());
        assert_eq!(file_wounds(&wounds), vec![(BS as i64, 3 * BS as i64)]);
        assert_eq!(report.wounds, 1);
    }

    #[test]
    fn missing_and_resized_files_are_wounded() {
        let d = data(2 * BS + 10);
        let expected = tree(&[("long", d.as_slice()), ("gone", &b"x"[..]), ("short", d.as_slice())]);
        let sig = signature(expected.path());
        let index = |p: &str| sig.container.files.iter().position(|f| f.path == p).unwrap() as i64;

        let mut longer = d.clone();
        longer.push(0);
        let actual = tree(&[("long", longer.as_slice()), ("short", &d[..BS + 5])]);
        let (report, wounds) = run(&sig, actual.path());

        let of = |i: i64| -> Vec<(i64, i64)> {
            wounds
                .iter()
                .filter(|w| w.kind == WoundKind::File && w.file_index == i)
                .map(|w| (w.start, w.end))
                .collect()
        };
        let size = d.len() as i64;
        assert_eq!(of(index("gone")), vec![(0, 1)]);
        assert_eq!(of(index("long")), vec![(0, size)]);
        assert_eq!(of(index("short")), vec![(BS as i64, size)]);
        assert_eq!(report.wounded_files, 3);
        let closed = wounds.iter().filter(|w| w.kind == WoundKind::ClosedFile).count();
        assert_eq!(closed, 3);
    }

    #[test]
    fn missing_empty_file_is_still_wounded() {
        let expected = tree(&[("empty", &b""[..])]);
        let sig = signature(expected.path());
        let actual = TempDir::new().unwrap();
        let (report, wounds) = run(&sig, actual.path());
        assert_eq!(report.wounds, 1);
        assert_eq!(file_wounds(&wounds), vec![(0, 0)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_flipped_byte_lies_inside_a_file_wound(
            len in 1usize..3 * BS + 500,
            at in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let d = data(len);
            let expected = tree(&[("f", d.as_slice())]);
            let sig = signature(expected.path());

            let off = at.index(len);
            let mut bad = d;
            bad[off] ^= flip;
            let actual = tree(&[("f", bad.as_slice())]);
            let (report, wounds) = run(&sig, actual.path());

            let off = off as i64;
            prop_assert!(
                file_wounds(&wounds).iter().any(|&(start, end)| start <= off && off < end),
                "no wound covers {} in {:?}", off, wounds
            );
            prop_assert_eq!(report.wounded_files, 1);
        }
    }
}
