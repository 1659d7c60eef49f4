//! Patch application: reads a patch stream and rebuilds every source file
//! through a bowl, reading reused blocks from the target tree.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bowl::{Bowl, BowlCheckpoint, DryBowl, FreshBowl, OverlayBowl, Transposition};
use crate::bsdiff;
use crate::cancel::CancelToken;
use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{
    compute_num_blocks, ApplySummary, BsdiffHeader, PatchHeader, SyncHeader, SyncKind, SyncOp,
    PATCH_MAGIC,
};
use crate::pool::{FsPool, Pool};
use crate::rsync;
use crate::wire::{self, Checkpoint, CodecRegistry, Decoder, ReadContext};

/// Everything needed to pick up an apply at a file boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatcherCheckpoint {
    pub wire: Checkpoint,
    pub next_file: usize,
    pub bowl: BowlCheckpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveAction {
    Continue,
    Stop,
}

/// Decides when the patcher saves, and what happens after.
pub trait SaveConsumer {
    fn should_save(&mut self) -> bool;

    fn save(&mut self, checkpoint: PatcherCheckpoint) -> Result<SaveAction>;
}

pub struct Patcher<R: Read> {
    ctx: ReadContext<Decoder<R>>,
    target: Container,
    source: Container,
    next_file: usize,
}

impl<R: Read> Patcher<R> {
    /// Reads the header and both containers.
    pub fn open(reader: R, registry: &CodecRegistry) -> Result<Self> {
        let (header, mut ctx): (PatchHeader, _) = wire::open_read(reader, PATCH_MAGIC, registry)?;
        let target: Container = ctx.read_message().with_context(|| "reading target container")?;
        let source: Container = ctx.read_message().with_context(|| "reading source container")?;
        debug!(compression = ?header.compression, %target, %source, "patch opened");
        Ok(Self {
            ctx,
            target,
            source,
            next_file: 0,
        })
    }

    pub fn target(&self) -> &Container {
        &self.target
    }

    pub fn source(&self) -> &Container {
        &self.source
    }

    /// Rebuilds the remaining source files into `bowl` and commits it.
    /// `target_pool` serves the blocks and files the patch reuses.
    pub fn apply(
        &mut self,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
        cancel: &CancelToken,
        mut saver: Option<&mut dyn SaveConsumer>,
    ) -> Result<ApplySummary> {
        let started = Instant::now();
        let mut summary = ApplySummary::default();

        while self.next_file < self.source.files.len() {
            cancel.check()?;
            let index = self.next_file;
            let path = self.source.files[index].path.clone();
            self.apply_file(index, target_pool, bowl, &mut summary)
                .with_context(|| format!("patching {path}"))?;
            self.next_file += 1;

            if let Some(saver) = saver.as_deref_mut() {
                if saver.should_save() {
                    let checkpoint = PatcherCheckpoint {
                        wire: self.ctx.checkpoint(),
                        next_file: self.next_file,
                        bowl: bowl.save()?,
                    };
                    debug!(next_file = self.next_file, offset = checkpoint.wire.offset, "saving");
                    if saver.save(checkpoint)? == SaveAction::Stop {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        bowl.commit()?;
        target_pool.close()?;
        info!(
            patched = summary.files_patched,
            transposed = summary.files_transposed,
            bsdiffed = summary.files_bsdiffed,
            bytes = summary.bytes_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "patch applied"
        );
        Ok(summary)
    }

    fn apply_file(
        &mut self,
        index: usize,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let header: SyncHeader = self.ctx.read_message()?;
        if header.file_index != index as i64 {
            return Err(Error::malformed(format!(
                "expected series for file {index}, got {}",
                header.file_index
            )));
        }
        match header.kind {
            SyncKind::Rsync => self.apply_rsync(index, target_pool, bowl, summary),
            SyncKind::Bsdiff => self.apply_bsdiff(index, target_pool, bowl, summary),
        }
    }

    /// Target file a whole-file `BlockRange` reuses unchanged, if any.
    fn whole_file_match(&self, index: usize, op: &SyncOp) -> Option<usize> {
        let SyncOp::BlockRange {
            file_index,
            block_index: 0,
            block_span,
        } = *op
        else {
            return None;
        };
        let target_index = usize::try_from(file_index).ok()?;
        let target = self.target.files.get(target_index)?;
        let size = self.source.files[index].size;
        (target.size == size && block_span as u64 == compute_num_blocks(size)).then_some(target_index)
    }

    fn apply_rsync(
        &mut self,
        index: usize,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let size = self.source.files[index].size;
        let mut ahead: Vec<SyncOp> = vec![self.ctx.read_message()?];

        if let Some(target_index) = self.whole_file_match(index, &ahead[0]) {
            let next: SyncOp = self.ctx.read_message()?;
            if next == SyncOp::HeyYouDidIt {
                debug!(index, target_index, "transposing");
                bowl.transpose(Transposition {
                    target_index,
                    source_index: index,
                })?;
                summary.files_transposed += 1;
                return Ok(());
            }
            ahead.push(next);
        }

        let mut writer = bowl.get_writer(index)?;
        let mut ops = ahead.into_iter();
        loop {
            let op = match ops.next() {
                Some(op) => op,
                None => self.ctx.read_message()?,
            };
            if op == SyncOp::HeyYouDidIt {
                break;
            }
            rsync::apply_op(&op, target_pool, &mut *writer)?;
        }

        let written = writer.tell();
        writer.finalize()?;
        if written != size {
            return Err(Error::corrupt(format!(
                "rebuilt {written} bytes, expected {size}"
            )));
        }
        summary.files_patched += 1;
        summary.bytes_written += written;
        Ok(())
    }

    fn apply_bsdiff(
        &mut self,
        index: usize,
        target_pool: &mut dyn Pool,
        bowl: &mut dyn Bowl,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let header: BsdiffHeader = self.ctx.read_message()?;
        let target_index = usize::try_from(header.target_index)
            .ok()
            .filter(|&t| t < self.target.files.len())
            .ok_or_else(|| {
                Error::malformed(format!("bsdiff against unknown target file {}", header.target_index))
            })?;
        let size = self.source.files[index].size;
        debug!(index, target_index, "applying bsdiff series");

        let mut writer = bowl.get_writer(index)?;
        let old = target_pool.reader(target_index)?;
        let written = bsdiff::apply(&mut self.ctx, old, &mut *writer, size)?;

        let end: SyncOp = self.ctx.read_message()?;
        if end != SyncOp::HeyYouDidIt {
            return Err(Error::malformed(format!(
                "expected end of series after bsdiff, got {end:?}"
            )));
        }
        writer.finalize()?;
        summary.files_bsdiffed += 1;
        summary.bytes_written += written;
        Ok(())
    }
}

impl<R: Read + Seek> Patcher<R> {
    /// Reopens a patch at a saved file boundary and restores `bowl`.
    pub fn resume(
        mut reader: R,
        registry: &CodecRegistry,
        checkpoint: &PatcherCheckpoint,
        bowl: &mut dyn Bowl,
    ) -> Result<Self> {
        let (target, source) = {
            let (_, mut ctx): (PatchHeader, _) = wire::open_read(&mut reader, PATCH_MAGIC, registry)?;
            let target: Container = ctx.read_message()?;
            let source: Container = ctx.read_message()?;
            (target, source)
        };
        if checkpoint.next_file > source.files.len() {
            return Err(Error::malformed(format!(
                "checkpoint names file {} of {}",
                checkpoint.next_file,
                source.files.len()
            )));
        }
        let (_, ctx): (PatchHeader, _) =
            wire::resume_read(reader, PATCH_MAGIC, registry, checkpoint.wire)?;
        bowl.resume(&checkpoint.bowl)?;
        debug!(next_file = checkpoint.next_file, "patch resumed");
        Ok(Self {
            ctx,
            target,
            source,
            next_file: checkpoint.next_file,
        })
    }
}

/// Where [`apply_patch`] materialises the source tree.
#[derive(Debug, Clone, Copy)]
pub enum Output<'a> {
    /// Decode and check only.
    Dry,
    /// Build into an empty directory.
    Fresh(&'a Path),
    /// Rewrite the target directory in place.
    Overlay,
}

/// Applies the patch at `patch_path` to the tree in `target_dir`.
pub fn apply_patch(
    patch_path: &Path,
    target_dir: &Path,
    output: Output<'_>,
    registry: &CodecRegistry,
    cancel: &CancelToken,
) -> Result<ApplySummary> {
    let file = File::open(patch_path).with_context(|| format!("opening {}", patch_path.display()))?;
    let mut patcher = Patcher::open(BufReader::new(file), registry)?;
    let target = patcher.target().clone();
    let source = patcher.source().clone();

    let mut target_pool = FsPool::new(target.clone(), target_dir);
    let mut bowl: Box<dyn Bowl> = match output {
        Output::Dry => Box::new(DryBowl::new(target, source)),
        Output::Fresh(out) => {
            let pool = Box::new(FsPool::new(target.clone(), target_dir));
            Box::new(FreshBowl::new(target, pool, source, out))
        }
        Output::Overlay => Box::new(OverlayBowl::new(target, source, target_dir)),
    };
    patcher.apply(&mut target_pool, bowl.as_mut(), cancel, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::DiffContext;
    use crate::error::ErrorKind;
    use crate::pool::read_entry;
    use crate::signature::Signature;
    use crate::wire::{CompressionAlgorithm, CompressionSettings, WriteContext};
    use std::io::{Cursor, Write};

    /// In-memory pool over a list of buffers.
    struct MemPool {
        files: Vec<Vec<u8>>,
        current: Option<Cursor<Vec<u8>>>,
    }

    impl MemPool {
        fn new<T: AsRef<[u8]>>(files: &[T]) -> Self {
            Self {
                files: files.iter().map(|f| f.as_ref().to_vec()).collect(),
                current: None,
            }
        }
    }

    impl Pool for MemPool {
        fn len(&self) -> usize {
            self.files.len()
        }

        fn size(&self, index: usize) -> u64 {
            self.files[index].len() as u64
        }

        fn reader(&mut self, index: usize) -> Result<&mut dyn crate::pool::ReadSeek> {
            let file = self
                .files
                .get(index)
                .ok_or_else(|| Error::not_found(format!("file {index}")))?;
            Ok(self.current.insert(Cursor::new(file.clone())))
        }

        fn writer(&mut self, _index: usize) -> Result<Box<dyn Write + Send>> {
            Ok(Box::new(std::io::sink()))
        }

        fn close(&mut self) -> Result<()> {
            self.current = None;
            Ok(())
        }
    }

    fn container(paths: &[(&str, usize)]) -> Container {
        let mut c = Container::default();
        for (path, size) in paths {
            c.files.push(crate::container::FileEntry {
                path: path.to_string(),
                mode: 0o644,
                size: *size as u64,
                offset: c.size,
            });
            c.size += *size as u64;
        }
        c
    }

    fn make_patch(target: &[(&str, &[u8])], source: &[(&str, &[u8])], compression: CompressionSettings) -> Vec<u8> {
        let target_c = container(&target.iter().map(|(p, d)| (*p, d.len())).collect::<Vec<_>>());
        let source_c = container(&source.iter().map(|(p, d)| (*p, d.len())).collect::<Vec<_>>());
        let mut target_pool = MemPool::new(&target.iter().map(|(_, d)| *d).collect::<Vec<_>>());
        let signature = Signature::compute(&target_c, &mut target_pool, &CancelToken::new()).unwrap();

        let registry = CodecRegistry::default();
        let cancel = CancelToken::new();
        let ctx = DiffContext {
            target: &signature,
            source: &source_c,
            compression,
            registry: &registry,
            cancel: &cancel,
        };
        let mut source_pool = MemPool::new(&source.iter().map(|(_, d)| *d).collect::<Vec<_>>());
        ctx.write_patch(&mut source_pool, Vec::new(), None).unwrap().0
    }

    /// Collects what a bowl receives.
    #[derive(Default)]
    struct RecordingBowl {
        written: std::collections::BTreeMap<usize, Vec<u8>>,
        transposed: Vec<Transposition>,
        committed: bool,
    }

    struct SharedWriter {
        buf: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl Write for SharedWriter {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl crate::bowl::EntryWriter for SharedWriter {
        fn tell(&self) -> u64 {
            self.buf.lock().unwrap().len() as u64
        }
        fn save(&mut self) -> Result<crate::bowl::WriterCheckpoint> {
            Ok(crate::bowl::WriterCheckpoint { offset: self.tell() })
        }
        fn resume(&mut self, checkpoint: &crate::bowl::WriterCheckpoint) -> Result<()> {
            self.buf.lock().unwrap().truncate(checkpoint.offset as usize);
            Ok(())
        }
        fn finalize(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    struct Recorder {
        bowl: RecordingBowl,
        buffers: Vec<(usize, std::sync::Arc<std::sync::Mutex<Vec<u8>>>)>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                bowl: RecordingBowl::default(),
                buffers: Vec::new(),
            }
        }

        fn written(&mut self) -> &std::collections::BTreeMap<usize, Vec<u8>> {
            for (index, buf) in self.buffers.drain(..) {
                let data = buf.lock().unwrap().clone();
                self.bowl.written.insert(index, data);
            }
            &self.bowl.written
        }
    }

    impl Bowl for Recorder {
        fn get_writer(&mut self, index: usize) -> Result<Box<dyn crate::bowl::EntryWriter>> {
            let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
            self.buffers.push((index, buf.clone()));
            Ok(Box::new(SharedWriter { buf }))
        }
        fn transpose(&mut self, t: Transposition) -> Result<()> {
            self.bowl.transposed.push(t);
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            self.bowl.committed = true;
            Ok(())
        }
        fn save(&self) -> Result<BowlCheckpoint> {
            Ok(BowlCheckpoint::Dry)
        }
        fn resume(&mut self, _checkpoint: &BowlCheckpoint) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn moon_becomes_leaf() {
        let patch = make_patch(&[("f", &b"moon"[..])], &[("f", &b"leaf"[..])], CompressionSettings::default());
        let registry = CodecRegistry::default();
        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let mut pool = MemPool::new(&[b"moon"]);
        let mut bowl = Recorder::new();
        let summary = patcher.apply(&mut pool, &mut bowl, &CancelToken::new(), None).unwrap();

        assert_eq!(summary.files_patched, 1);
        assert_eq!(summary.bytes_written, 4);
        assert!(bowl.bowl.committed);
        assert_eq!(bowl.written()[&0], b"leaf");
    }

    #[test]
    fn renamed_file_is_a_single_transposition() {
        let patch = make_patch(&[("a", &b"x"[..])], &[("b", &b"x"[..])], CompressionSettings::default());
        let registry = CodecRegistry::default();
        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let mut pool = MemPool::new(&[b"x"]);
        let mut bowl = Recorder::new();
        let summary = patcher.apply(&mut pool, &mut bowl, &CancelToken::new(), None).unwrap();

        assert_eq!(summary.files_transposed, 1);
        assert_eq!(summary.files_patched, 0);
        assert_eq!(
            bowl.bowl.transposed,
            vec![Transposition {
                target_index: 0,
                source_index: 0
            }]
        );
        assert!(bowl.written().is_empty());
    }

    #[test]
    fn prefix_reuse_is_not_a_transposition() {
        let patch = make_patch(
            &[("f", &b"moon"[..])],
            &[("f", &b"moon and stars"[..])],
            CompressionSettings::default(),
        );
        let registry = CodecRegistry::default();
        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let mut pool = MemPool::new(&[b"moon"]);
        let mut bowl = Recorder::new();
        patcher.apply(&mut pool, &mut bowl, &CancelToken::new(), None).unwrap();
        assert!(bowl.bowl.transposed.is_empty());
        assert_eq!(bowl.written()[&0], b"moon and stars");
    }

    #[test]
    fn bsdiff_series_is_applied() {
        let old = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut new = old.clone();
        new[10] = b'#';
        new.extend_from_slice(b"tail");

        let registry = CodecRegistry::default();
        let header = PatchHeader {
            compression: CompressionSettings::uncompressed(),
        };
        let mut ctx = wire::open_write(Vec::new(), PATCH_MAGIC, &header, &registry).unwrap();
        ctx.write_message(&container(&[("f", old.len())])).unwrap();
        ctx.write_message(&container(&[("f", new.len())])).unwrap();
        ctx.write_message(&SyncHeader {
            file_index: 0,
            kind: SyncKind::Bsdiff,
        })
        .unwrap();
        ctx.write_message(&BsdiffHeader { target_index: 0 }).unwrap();
        bsdiff::diff(&old, &new, &mut ctx, &Default::default(), &CancelToken::new()).unwrap();
        ctx.write_message(&SyncOp::HeyYouDidIt).unwrap();
        let patch = wire::finish_write(ctx).unwrap();

        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let mut pool = MemPool::new(&[&old]);
        let mut bowl = Recorder::new();
        let summary = patcher.apply(&mut pool, &mut bowl, &CancelToken::new(), None).unwrap();
        assert_eq!(summary.files_bsdiffed, 1);
        assert_eq!(bowl.written()[&0], new);
    }

    #[test]
    fn out_of_order_series_is_malformed() {
        let registry = CodecRegistry::default();
        let header = PatchHeader {
            compression: CompressionSettings::uncompressed(),
        };
        let mut ctx = wire::open_write(Vec::new(), PATCH_MAGIC, &header, &registry).unwrap();
        ctx.write_message(&container(&[])).unwrap();
        ctx.write_message(&container(&[("a", 0), ("b", 0)])).unwrap();
        ctx.write_message(&SyncHeader {
            file_index: 1,
            kind: SyncKind::Rsync,
        })
        .unwrap();
        let patch = wire::finish_write(ctx).unwrap();

        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let err = patcher
            .apply(&mut MemPool::new::<&[u8]>(&[]), &mut Recorder::new(), &CancelToken::new(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn wrong_magic_is_malformed() {
        let mut ctx = WriteContext::new(Vec::new());
        ctx.write_magic(0xdead_beef).unwrap();
        let bytes = ctx.into_inner();
        let err = Patcher::open(bytes.as_slice(), &CodecRegistry::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    struct StopAfter {
        files: usize,
        seen: usize,
        saved: Option<PatcherCheckpoint>,
    }

    impl SaveConsumer for StopAfter {
        fn should_save(&mut self) -> bool {
            self.seen += 1;
            self.seen == self.files
        }

        fn save(&mut self, checkpoint: PatcherCheckpoint) -> Result<SaveAction> {
            self.saved = Some(checkpoint);
            Ok(SaveAction::Stop)
        }
    }

    #[test]
    fn stop_and_resume_at_file_boundary() {
        let target: [(&str, &[u8]); 1] = [("f", b"moon")];
        let source: [(&str, &[u8]); 3] = [("a", b"moon and stars"), ("b", b"leaf"), ("c", b"moonmoon")];
        let patch = make_patch(
            &target,
            &source,
            CompressionSettings::new(CompressionAlgorithm::Zstd, 3),
        );
        let registry = CodecRegistry::default();

        let mut patcher = Patcher::open(Cursor::new(patch.clone()), &registry).unwrap();
        let mut bowl = Recorder::new();
        let mut saver = StopAfter {
            files: 2,
            seen: 0,
            saved: None,
        };
        let err = patcher
            .apply(&mut MemPool::new(&[b"moon"]), &mut bowl, &CancelToken::new(), Some(&mut saver as &mut dyn SaveConsumer))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!bowl.bowl.committed);
        let checkpoint = saver.saved.unwrap();
        assert_eq!(checkpoint.next_file, 2);

        let mut patcher = Patcher::resume(Cursor::new(patch), &registry, &checkpoint, &mut bowl).unwrap();
        patcher
            .apply(&mut MemPool::new(&[b"moon"]), &mut bowl, &CancelToken::new(), None)
            .unwrap();
        let written = bowl.written();
        assert_eq!(written[&0], b"moon and stars");
        assert_eq!(written[&1], b"leaf");
        assert_eq!(written[&2], b"moonmoon");
    }

    #[test]
    fn target_blocks_come_from_the_pool() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let patch = make_patch(&[("f", data.as_slice())], &[("g", data.as_slice())], CompressionSettings::default());
        let registry = CodecRegistry::default();
        let mut patcher = Patcher::open(patch.as_slice(), &registry).unwrap();
        let mut pool = MemPool::new(&[&data]);
        let mut bowl = Recorder::new();
        let summary = patcher.apply(&mut pool, &mut bowl, &CancelToken::new(), None).unwrap();
        assert_eq!(summary.files_transposed, 1);
        assert_eq!(read_entry(&mut pool, 0).unwrap(), data);
    }
}
