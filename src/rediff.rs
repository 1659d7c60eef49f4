//! Second pass over a finished patch: files rebuilt mostly from one target
//! file are re-encoded as bsdiff series against that file.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::bsdiff::{self, BsdiffOptions};
use crate::cancel::CancelToken;
use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{
    compute_num_blocks, BsdiffDiff, BsdiffExtra, BsdiffHeader, Control, PatchHeader, SyncHeader,
    SyncKind, SyncOp, BLOCK_SIZE, PATCH_MAGIC,
};
use crate::pool::{FsPool, Pool};
use crate::suffix;
use crate::wire::{self, CodecRegistry, CompressionSettings, ReadContext, WriteContext};

/// Files larger than this are never bsdiffed.
pub const DEFAULT_SIZE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RediffOptions {
    pub size_limit: u64,
    pub compression: CompressionSettings,
    pub bsdiff: BsdiffOptions,
}

impl RediffOptions {
    /// `size_limit`, capped at what the suffix sorters can index.
    pub fn effective_size_limit(&self) -> u64 {
        self.size_limit.min(suffix::MAX_INPUT as u64)
    }
}

impl Default for RediffOptions {
    fn default() -> Self {
        Self {
            size_limit: DEFAULT_SIZE_LIMIT,
            compression: CompressionSettings::rediff_default(),
            bsdiff: BsdiffOptions::default(),
        }
    }
}

/// Which target file each re-encoded source file is diffed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RediffPlan {
    pub target: Container,
    pub source: Container,
    /// Source index to target index.
    pub mapping: BTreeMap<usize, usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RediffStats {
    pub files_bsdiffed: usize,
    pub files_copied: usize,
    pub old_bytes: u64,
    pub new_bytes: u64,
    pub extra_bytes: u64,
}

/// One framed message of a per-file series.
#[derive(Debug)]
enum SeriesMessage {
    Op(SyncOp),
    Bsdiff(BsdiffHeader),
    Control(Control),
    Diff(BsdiffDiff),
    Extra(BsdiffExtra),
}

impl SeriesMessage {
    fn write_to<W: Write>(&self, ctx: &mut WriteContext<W>) -> Result<()> {
        match self {
            SeriesMessage::Op(m) => ctx.write_message(m),
            SeriesMessage::Bsdiff(m) => ctx.write_message(m),
            SeriesMessage::Control(m) => ctx.write_message(m),
            SeriesMessage::Diff(m) => ctx.write_message(m),
            SeriesMessage::Extra(m) => ctx.write_message(m),
        }
    }
}

/// Reads the series that follows a `SyncHeader` of `kind`, up to and
/// including its end marker.
fn read_series<R: Read>(
    ctx: &mut ReadContext<R>,
    kind: SyncKind,
    visit: &mut dyn FnMut(SeriesMessage) -> Result<()>,
) -> Result<()> {
    match kind {
        SyncKind::Rsync => loop {
            let op: SyncOp = ctx.read_message()?;
            let done = op == SyncOp::HeyYouDidIt;
            visit(SeriesMessage::Op(op))?;
            if done {
                return Ok(());
            }
        },
        SyncKind::Bsdiff => {
            visit(SeriesMessage::Bsdiff(ctx.read_message()?))?;
            loop {
                let control: Control = ctx.read_message()?;
                let done = control.is_eof();
                visit(SeriesMessage::Control(control))?;
                if done {
                    break;
                }
            }
            visit(SeriesMessage::Diff(ctx.read_message()?))?;
            visit(SeriesMessage::Extra(ctx.read_message()?))?;
            let end: SyncOp = ctx.read_message()?;
            if end != SyncOp::HeyYouDidIt {
                return Err(Error::malformed(format!(
                    "expected end of series after bsdiff buffers, got {end:?}"
                )));
            }
            visit(SeriesMessage::Op(end))
        }
    }
}

fn read_file_header<R: Read>(ctx: &mut ReadContext<R>, index: usize) -> Result<SyncHeader> {
    let header: SyncHeader = ctx.read_message()?;
    if header.file_index != index as i64 {
        return Err(Error::malformed(format!(
            "expected series for file {index}, got {}",
            header.file_index
        )));
    }
    Ok(header)
}

/// Bytes each target file contributes to one source file.
fn reuse_by_target(ops: &[SyncOp], target: &Container) -> HashMap<usize, u64> {
    let mut reused = HashMap::new();
    for op in ops {
        let SyncOp::BlockRange {
            file_index,
            block_index,
            block_span,
        } = *op
        else {
            continue;
        };
        let (Ok(t), Ok(block), Ok(span)) = (
            usize::try_from(file_index),
            u64::try_from(block_index),
            u64::try_from(block_span),
        ) else {
            continue;
        };
        let Some(file) = target.files.get(t) else {
            continue;
        };
        let start = block.saturating_mul(BLOCK_SIZE).min(file.size);
        let end = block.saturating_add(span).saturating_mul(BLOCK_SIZE).min(file.size);
        *reused.entry(t).or_insert(0) += end - start;
    }
    reused
}

/// First pass: picks a bsdiff counterpart for every source file worth it.
pub fn analyze_patch<R: Read>(
    reader: R,
    registry: &CodecRegistry,
    options: &RediffOptions,
    cancel: &CancelToken,
) -> Result<RediffPlan> {
    let (_, mut ctx): (PatchHeader, _) = wire::open_read(reader, PATCH_MAGIC, registry)?;
    let target: Container = ctx.read_message()?;
    let source: Container = ctx.read_message()?;
    let mut mapping = BTreeMap::new();
    let size_limit = options.effective_size_limit();

    for (index, file) in source.files.iter().enumerate() {
        cancel.check()?;
        let header = read_file_header(&mut ctx, index)?;
        let mut ops = Vec::new();
        read_series(&mut ctx, header.kind, &mut |msg| {
            if let SeriesMessage::Op(op) = msg {
                if op != SyncOp::HeyYouDidIt {
                    ops.push(op);
                }
            }
            Ok(())
        })?;
        if header.kind == SyncKind::Bsdiff {
            continue;
        }

        if let [SyncOp::BlockRange {
            file_index,
            block_index: 0,
            block_span,
        }] = ops.as_slice()
        {
            let whole = usize::try_from(*file_index)
                .ok()
                .and_then(|t| target.files.get(t))
                .is_some_and(|t| t.size == file.size && *block_span as u64 == compute_num_blocks(file.size));
            if whole {
                debug!(path = %file.path, "transposition, skipping");
                continue;
            }
        }
        if file.size > size_limit {
            debug!(path = %file.path, size = file.size, size_limit, "too large, skipping");
            continue;
        }

        let reused = reuse_by_target(&ops, &target);
        let same_path = |t: usize| target.files[t].path == file.path;
        let best = reused
            .into_iter()
            .filter(|&(t, _)| target.files[t].size <= size_limit)
            .max_by(|&(ta, ba), &(tb, bb)| {
                ba.cmp(&bb)
                    .then_with(|| same_path(ta).cmp(&same_path(tb)))
                    .then_with(|| tb.cmp(&ta))
            });
        match best {
            Some((t, bytes)) if bytes > 0 => {
                debug!(path = %file.path, target = %target.files[t].path, bytes, "bsdiff candidate");
                mapping.insert(index, t);
            }
            _ => debug!(path = %file.path, "no reuse, skipping"),
        }
    }

    info!(candidates = mapping.len(), files = source.files.len(), "patch analysed");
    Ok(RediffPlan {
        target,
        source,
        mapping,
    })
}

/// Second pass: rewrites the patch, replacing the series of every mapped
/// file by a bsdiff series computed from the two trees.
#[allow(clippy::too_many_arguments)]
pub fn optimize_patch<R: Read, W: Write>(
    reader: R,
    out: W,
    plan: &RediffPlan,
    target_pool: &mut dyn Pool,
    source_pool: &mut dyn Pool,
    registry: &CodecRegistry,
    options: &RediffOptions,
    cancel: &CancelToken,
) -> Result<(W, RediffStats)> {
    let started = Instant::now();
    let (_, mut input): (PatchHeader, _) = wire::open_read(reader, PATCH_MAGIC, registry)?;
    let target: Container = input.read_message()?;
    let source: Container = input.read_message()?;
    if target != plan.target || source != plan.source {
        return Err(Error::malformed("patch does not match the rediff plan"));
    }

    let header = PatchHeader {
        compression: options.compression,
    };
    let mut output = wire::open_write(out, PATCH_MAGIC, &header, registry)?;
    output.write_message(&target)?;
    output.write_message(&source)?;
    let mut stats = RediffStats::default();

    for (index, file) in source.files.iter().enumerate() {
        cancel.check()?;
        let header = read_file_header(&mut input, index)?;

        let Some(&target_index) = plan.mapping.get(&index) else {
            output.write_message(&header)?;
            read_series(&mut input, header.kind, &mut |msg| msg.write_to(&mut output))?;
            stats.files_copied += 1;
            continue;
        };

        read_series(&mut input, header.kind, &mut |_| Ok(()))?;
        let old = target_pool
            .contents(target_index)
            .with_context(|| format!("reading {}", target.files[target_index].path))?;
        let new = source_pool
            .contents(index)
            .with_context(|| format!("reading {}", file.path))?;
        if new.len() as u64 != file.size {
            return Err(Error::corrupt(format!(
                "{} is {} bytes, the patch expects {}",
                file.path,
                new.len(),
                file.size
            )));
        }

        output.write_message(&SyncHeader {
            file_index: index as i64,
            kind: SyncKind::Bsdiff,
        })?;
        output.write_message(&BsdiffHeader {
            target_index: target_index as i64,
        })?;
        let bs = bsdiff::diff(&old, &new, &mut output, &options.bsdiff, cancel)
            .with_context(|| format!("bsdiffing {}", file.path))?;
        output.write_message(&SyncOp::HeyYouDidIt)?;

        debug!(path = %file.path, controls = bs.controls, extra = bs.extra_bytes, "rediffed");
        stats.files_bsdiffed += 1;
        stats.old_bytes += old.len() as u64;
        stats.new_bytes += new.len() as u64;
        stats.extra_bytes += bs.extra_bytes;
    }
    target_pool.close()?;
    source_pool.close()?;

    let out = wire::finish_write(output)?;
    info!(
        bsdiffed = stats.files_bsdiffed,
        copied = stats.files_copied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "patch optimised"
    );
    Ok((out, stats))
}

/// Rediffs the patch at `patch_path` into `out_path`, reading the trees
/// from `target_dir` and `source_dir`.
pub fn rediff_file(
    patch_path: &Path,
    target_dir: &Path,
    source_dir: &Path,
    out_path: &Path,
    registry: &CodecRegistry,
    options: &RediffOptions,
    cancel: &CancelToken,
) -> Result<RediffStats> {
    let open = || -> Result<BufReader<File>> {
        let file = File::open(patch_path).with_context(|| format!("opening {}", patch_path.display()))?;
        Ok(BufReader::new(file))
    };
    let plan = analyze_patch(open()?, registry, options, cancel)?;
    let mut target_pool = FsPool::new(plan.target.clone(), target_dir);
    let mut source_pool = FsPool::new(plan.source.clone(), source_dir);

    let out = File::create(out_path).with_context(|| format!("creating {}", out_path.display()))?;
    let (writer, stats) = optimize_patch(
        open()?,
        BufWriter::new(out),
        &plan,
        &mut target_pool,
        &mut source_pool,
        registry,
        options,
        cancel,
    )?;
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_all()?;
    Ok(stats)
}
