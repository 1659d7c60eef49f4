//! Patch creation: walks the source container and writes one rsync series
//! per file against the target signature.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::container::{Container, WalkOptions};
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{PatchHeader, SyncHeader, SyncKind, SyncOp, PATCH_MAGIC};
use crate::pool::{FsPool, Pool};
use crate::rsync::RsyncDiff;
use crate::signature::{BlockHasher, BlockLibrary, HashSink, Signature, SignatureWriter};
use crate::wire::{self, CodecRegistry, CompressionSettings};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffStats {
    pub files: usize,
    pub source_bytes: u64,
    /// Bytes carried literally in `Data` ops.
    pub fresh_bytes: u64,
    pub block_ranges: u64,
    pub data_ops: u64,
}

impl DiffStats {
    pub fn reused_bytes(&self) -> u64 {
        self.source_bytes - self.fresh_bytes
    }
}

/// Passes bytes through while counting them and, optionally, hashing them
/// into a signature.
struct TeeReader<'a, R: Read> {
    inner: R,
    hasher: Option<&'a mut BlockHasher>,
    read: u64,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        self.read += n as u64;
        Ok(n)
    }
}

pub struct DiffContext<'a> {
    pub target: &'a Signature,
    pub source: &'a Container,
    pub compression: CompressionSettings,
    pub registry: &'a CodecRegistry,
    pub cancel: &'a CancelToken,
}

impl DiffContext<'_> {
    /// Writes the patch turning the target tree into the source tree read
    /// through `source_pool`. When `source_signature` is given, the source
    /// tree's block hashes are written to it in the same pass.
    pub fn write_patch<W: Write>(
        &self,
        source_pool: &mut dyn Pool,
        out: W,
        mut source_signature: Option<&mut dyn HashSink>,
    ) -> Result<(W, DiffStats)> {
        let started = Instant::now();
        let header = PatchHeader {
            compression: self.compression,
        };
        let mut ctx = wire::open_write(out, PATCH_MAGIC, &header, self.registry)?;
        ctx.write_message(&self.target.container)?;
        ctx.write_message(self.source)?;

        let library = BlockLibrary::new(self.target);
        let rsync = RsyncDiff::new(&library, self.cancel);
        let target_indices = self.target.container.file_indices();
        let mut stats = DiffStats::default();

        for (index, file) in self.source.files.iter().enumerate() {
            self.cancel.check()?;
            ctx.write_message(&SyncHeader {
                file_index: index as i64,
                kind: SyncKind::Rsync,
            })?;

            let preferred = target_indices.get(file.path.as_str()).map(|&t| t as i64);
            let mut hasher = source_signature.as_ref().map(|_| BlockHasher::new(index));
            let reader = source_pool.reader(index)?;
            let mut tee = TeeReader {
                inner: reader,
                hasher: hasher.as_mut(),
                read: 0,
            };

            let (mut ranges, mut data_ops, mut fresh) = (0u64, 0u64, 0u64);
            rsync
                .diff(&mut tee, preferred, &mut |op| {
                    match &op {
                        SyncOp::BlockRange { .. } => ranges += 1,
                        SyncOp::Data(bytes) => {
                            data_ops += 1;
                            fresh += bytes.len() as u64;
                        }
                        SyncOp::HeyYouDidIt => {}
                    }
                    ctx.write_message(&op)
                })
                .with_context(|| format!("diffing {}", file.path))?;

            if tee.read != file.size {
                return Err(Error::corrupt(format!(
                    "{} changed while diffing: expected {} bytes, read {}",
                    file.path, file.size, tee.read
                )));
            }
            debug!(path = %file.path, ranges, data_ops, fresh, "file diffed");

            if let (Some(hasher), Some(sink)) = (hasher, source_signature.as_mut()) {
                sink.write_hashes(&hasher.finish())?;
            }

            stats.files += 1;
            stats.source_bytes += file.size;
            stats.fresh_bytes += fresh;
            stats.block_ranges += ranges;
            stats.data_ops += data_ops;
        }
        source_pool.close()?;

        let out = wire::finish_write(ctx)?;
        info!(
            files = stats.files,
            reused = stats.reused_bytes(),
            fresh = stats.fresh_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "patch written"
        );
        Ok((out, stats))
    }
}

/// Diffs the tree in `source_dir` against `target` into the file at
/// `output`. With `signature_out`, the source tree's signature is written
/// there in the same pass.
#[allow(clippy::too_many_arguments)]
pub fn create_patch(
    target: &Signature,
    source_dir: &Path,
    walk: &WalkOptions,
    output: &Path,
    signature_out: Option<&Path>,
    compression: CompressionSettings,
    registry: &CodecRegistry,
    cancel: &CancelToken,
) -> Result<DiffStats> {
    let source = Container::walk(source_dir, walk)?;
    info!(%source, "source walked");
    let mut pool = FsPool::new(source.clone(), source_dir);
    let ctx = DiffContext {
        target,
        source: &source,
        compression,
        registry,
        cancel,
    };

    let out = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut sig_writer = match signature_out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Some(SignatureWriter::new(BufWriter::new(file), &source, compression, registry)?)
        }
        None => None,
    };

    let (writer, stats) = ctx.write_patch(
        &mut pool,
        BufWriter::new(out),
        sig_writer.as_mut().map(|w| w as &mut dyn HashSink),
    )?;
    finish_file(writer)?;
    if let Some(sig_writer) = sig_writer {
        finish_file(sig_writer.finish()?)?;
    }
    Ok(stats)
}

fn finish_file(writer: BufWriter<File>) -> Result<()> {
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}
