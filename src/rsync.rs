//! Rsync-style block matching: turns a source stream into block reuses
//! from the target and literal data.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::cancel::CancelToken;
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{SyncOp, BLOCK_SIZE, MAX_DATA_OP};
use crate::pool::Pool;
use crate::rolling_hash::RollingHash;
use crate::signature::{BlockLibrary, BlockLocation};

const BS: usize = BLOCK_SIZE as usize;
const BUFFER_SIZE: usize = 2 * BS + MAX_DATA_OP;

#[derive(Debug, Clone, Copy)]
struct PendingRange {
    file_index: i64,
    block_index: i64,
    block_span: i64,
}

impl PendingRange {
    fn next(&self) -> BlockLocation {
        BlockLocation {
            file_index: self.file_index,
            block_index: self.block_index + self.block_span,
        }
    }

    fn into_op(self) -> SyncOp {
        SyncOp::BlockRange {
            file_index: self.file_index,
            block_index: self.block_index,
            block_span: self.block_span,
        }
    }
}

/// Holds back the last block range so consecutive blocks merge into one op.
struct OpSink<'a> {
    emit: &'a mut dyn FnMut(SyncOp) -> Result<()>,
    pending: Option<PendingRange>,
}

impl OpSink<'_> {
    fn block(&mut self, file_index: i64, block_index: i64) -> Result<()> {
        if let Some(p) = self.pending.as_mut() {
            if p.file_index == file_index && p.block_index + p.block_span == block_index {
                p.block_span += 1;
                return Ok(());
            }
        }
        self.flush_pending()?;
        self.pending = Some(PendingRange {
            file_index,
            block_index,
            block_span: 1,
        });
        Ok(())
    }

    fn data(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.flush_pending()?;
        for chunk in bytes.chunks(MAX_DATA_OP) {
            (self.emit)(SyncOp::Data(chunk.to_vec()))?;
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(p) => (self.emit)(p.into_op()),
            None => Ok(()),
        }
    }

    fn finish(mut self) -> Result<()> {
        self.flush_pending()?;
        (self.emit)(SyncOp::HeyYouDidIt)
    }
}

/// Computes the op series for one source file against a block library.
pub struct RsyncDiff<'a> {
    library: &'a BlockLibrary,
    cancel: &'a CancelToken,
}

impl<'a> RsyncDiff<'a> {
    pub fn new(library: &'a BlockLibrary, cancel: &'a CancelToken) -> Self {
        Self { library, cancel }
    }

    /// Scans `source` and hands every op to `emit`, ending with
    /// `HeyYouDidIt`. `preferred_file` breaks ties between equal blocks.
    pub fn diff<R: Read>(
        &self,
        mut source: R,
        preferred_file: Option<i64>,
        emit: &mut dyn FnMut(SyncOp) -> Result<()>,
    ) -> Result<()> {
        let mut sink = OpSink {
            emit,
            pending: None,
        };

        let mut buf: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
        let mut eof = false;
        // buf[data_tail..sum_tail] is the literal not yet emitted;
        // buf[sum_tail..sum_tail + BS] is the window being hashed.
        let mut data_tail = 0usize;
        let mut sum_tail = 0usize;
        let mut rolling: Option<RollingHash> = None;
        let mut rolled_out: Option<u8> = None;

        loop {
            if !eof && buf.len() < sum_tail + BS {
                self.cancel.check()?;
                buf.drain(..data_tail);
                sum_tail -= data_tail;
                data_tail = 0;
                eof = fill(&mut source, &mut buf, BUFFER_SIZE)?;
            }

            let remaining = buf.len() - sum_tail;
            if remaining == 0 {
                break;
            }

            if remaining >= BS {
                let window = &buf[sum_tail..sum_tail + BS];
                let hash = match (rolling, rolled_out.take()) {
                    (Some(mut h), Some(old)) => {
                        h.rotate(old, window[BS - 1]);
                        h
                    }
                    _ => RollingHash::of(window),
                };

                let next = sink.pending.map(|p| p.next());
                if let Some(hit) = self.library.find(hash.digest(), window, next, preferred_file) {
                    let (file_index, block_index) = (hit.file_index, hit.block_index);
                    sink.data(&buf[data_tail..sum_tail])?;
                    sink.block(file_index, block_index)?;
                    sum_tail += BS;
                    data_tail = sum_tail;
                    rolling = None;
                    continue;
                }

                rolling = Some(hash);
                rolled_out = Some(buf[sum_tail]);
                sum_tail += 1;
                if sum_tail - data_tail >= MAX_DATA_OP {
                    sink.data(&buf[data_tail..sum_tail])?;
                    data_tail = sum_tail;
                }
                continue;
            }

            // Fewer than a block left: only tail blocks can match, and only
            // right after a match or at the start of the file.
            if sum_tail != data_tail {
                break;
            }
            let next = sink.pending.map(|p| p.next());
            let hit = self
                .library
                .short_sizes()
                .iter()
                .filter(|&&size| size <= remaining)
                .find_map(|&size| {
                    let window = &buf[sum_tail..sum_tail + size];
                    let weak = RollingHash::of(window).digest();
                    self.library
                        .find(weak, window, next, preferred_file)
                        .map(|h| (h.file_index, h.block_index, size))
                });
            match hit {
                Some((file_index, block_index, size)) => {
                    sink.block(file_index, block_index)?;
                    sum_tail += size;
                    data_tail = sum_tail;
                }
                None => break,
            }
        }

        sink.data(&buf[data_tail..])?;
        sink.finish()
    }

    /// Collects the op series of `source` in memory.
    pub fn diff_to_vec<R: Read>(&self, source: R, preferred_file: Option<i64>) -> Result<Vec<SyncOp>> {
        let mut ops = Vec::new();
        self.diff(source, preferred_file, &mut |op| {
            ops.push(op);
            Ok(())
        })?;
        Ok(ops)
    }
}

/// Reads until `buf` holds `cap` bytes or the source ends. Returns true at EOF.
fn fill<R: Read>(source: &mut R, buf: &mut Vec<u8>, cap: usize) -> Result<bool> {
    let mut filled = buf.len();
    buf.resize(cap, 0);
    let mut eof = false;
    while filled < cap {
        match source.read(&mut buf[filled..]) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.truncate(filled);
                return Err(e.into());
            }
        }
    }
    buf.truncate(filled);
    Ok(eof)
}

/// Applies one rsync op to `out`, reading reused blocks from `target`.
/// Returns the number of bytes written.
pub fn apply_op<W: Write + ?Sized>(op: &SyncOp, target: &mut dyn Pool, out: &mut W) -> Result<u64> {
    match op {
        SyncOp::BlockRange {
            file_index,
            block_index,
            block_span,
        } => {
            if *file_index < 0 || *file_index as usize >= target.len() {
                return Err(Error::malformed(format!(
                    "block range references target file {file_index} of {}",
                    target.len()
                )));
            }
            if *block_index < 0 || *block_span <= 0 {
                return Err(Error::malformed(format!(
                    "invalid block range {block_index}+{block_span}"
                )));
            }
            let reader = target.reader(*file_index as usize)?;
            reader.seek(SeekFrom::Start(*block_index as u64 * BLOCK_SIZE))?;
            // The last block of a file may be short; take() stops at EOF.
            let copied = io::copy(&mut reader.take(*block_span as u64 * BLOCK_SIZE), out)
                .with_context(|| format!("copying blocks from target file {file_index}"))?;
            Ok(copied)
        }
        SyncOp::Data(bytes) => {
            out.write_all(bytes)?;
            Ok(bytes.len() as u64)
        }
        SyncOp::HeyYouDidIt => Ok(0),
    }
}
