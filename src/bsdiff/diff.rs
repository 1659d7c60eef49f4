use std::io::Write;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::bsdiff::{BsdiffOptions, Match, MATCH_CHANNEL_DEPTH, SCAN_BLOCK_SIZE};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::patch_format::{BsdiffDiff, BsdiffExtra, Control};
use crate::suffix::PartitionedSuffixArray;
use crate::wire::WriteContext;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BsdiffStats {
    pub controls: u64,
    pub diff_bytes: u64,
    pub extra_bytes: u64,
}

enum ScanEvent {
    Match(Match),
    BlockDone,
}

/// Writes the bsdiff series turning `old` into `new`: control records, the
/// end marker, then the diff and extra buffers.
pub fn diff<W: Write>(
    old: &[u8],
    new: &[u8],
    ctx: &mut WriteContext<W>,
    opts: &BsdiffOptions,
    cancel: &CancelToken,
) -> Result<BsdiffStats> {
    cancel.check()?;
    let psa = PartitionedSuffixArray::new(old, opts.partitions, opts.sort_concurrency)?;

    let num_blocks = new.len().div_ceil(SCAN_BLOCK_SIZE);
    let workers = opts.worker_count().min(num_blocks.max(1));
    debug!(
        old = old.len(),
        new = new.len(),
        blocks = num_blocks,
        workers,
        "bsdiff scan"
    );

    let mut writer = SeriesWriter::new(old, new);
    thread::scope(|scope| -> Result<()> {
        let mut events = Vec::with_capacity(workers);
        let mut tokens = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (event_tx, event_rx) = bounded(MATCH_CHANNEL_DEPTH);
            let (token_tx, token_rx) = bounded(1);
            events.push(event_rx);
            tokens.push(token_tx);
            let psa = &psa;
            scope.spawn(move || {
                scan_worker(psa, new, worker, workers, num_blocks, cancel, event_tx, token_rx)
            });
        }
        consume(&mut writer, ctx, num_blocks, &events, &tokens, cancel)
    })?;

    writer.finish(ctx)
}

/// Scans blocks `worker, worker + workers, ...` of `new`. Waits for the
/// consumer to drain each block before starting the next.
#[allow(clippy::too_many_arguments)]
fn scan_worker(
    psa: &PartitionedSuffixArray<'_>,
    new: &[u8],
    worker: usize,
    workers: usize,
    num_blocks: usize,
    cancel: &CancelToken,
    events: Sender<ScanEvent>,
    consumed: Receiver<()>,
) {
    for (round, block) in (worker..num_blocks).step_by(workers).enumerate() {
        if round > 0 && consumed.recv().is_err() {
            return;
        }
        if cancel.is_cancelled() {
            return;
        }
        let start = block * SCAN_BLOCK_SIZE;
        let end = (start + SCAN_BLOCK_SIZE).min(new.len());
        let mut send = |m: Match| events.send(ScanEvent::Match(m)).is_ok();
        if !scan_block(psa, new, start, end, &mut send) {
            return;
        }
        if events.send(ScanEvent::BlockDone).is_err() {
            return;
        }
    }
}

/// Drains the workers in block order so output does not depend on timing.
fn consume<W: Write>(
    writer: &mut SeriesWriter<'_>,
    ctx: &mut WriteContext<W>,
    num_blocks: usize,
    events: &[Receiver<ScanEvent>],
    tokens: &[Sender<()>],
    cancel: &CancelToken,
) -> Result<()> {
    let workers = events.len();
    for block in 0..num_blocks {
        cancel.check()?;
        let worker = block % workers;
        loop {
            match events[worker].recv() {
                Ok(ScanEvent::Match(m)) => writer.push(m, ctx)?,
                Ok(ScanEvent::BlockDone) => break,
                Err(_) => {
                    cancel.check()?;
                    return Err(Error::corrupt(format!(
                        "bsdiff worker {worker} stopped before block {block}"
                    )));
                }
            }
        }
        // Workers past their last block have hung up.
        let _ = tokens[worker].send(());
    }
    Ok(())
}

/// Classic bsdiff scan over `new[start..end]`; matches may point anywhere in
/// old. Returns false once `emit` refuses a match.
fn scan_block(
    psa: &PartitionedSuffixArray<'_>,
    new_all: &[u8],
    start: usize,
    end: usize,
    emit: &mut dyn FnMut(Match) -> bool,
) -> bool {
    let old = psa.data();
    let new = &new_all[start..end];
    let old_size = old.len() as isize;
    let new_size = new.len() as isize;

    let mut scan: isize = 0;
    let mut len: isize = 0;
    let mut pos: isize = 0;
    let mut last_scan: isize = 0;
    let mut last_pos: isize = 0;
    let mut last_offset: isize = 0;

    let old_at = |i: isize| old[i as usize];
    let new_at = |i: isize| new[i as usize];

    while scan < new_size {
        let mut old_score: isize = 0;
        scan += len;
        let mut scsc = scan;
        while scan < new_size {
            let (p, l) = psa.search(&new[scan as usize..]);
            pos = p as isize;
            len = l as isize;

            while scsc < scan + len {
                if scsc + last_offset < old_size && old_at(scsc + last_offset) == new_at(scsc) {
                    old_score += 1;
                }
                scsc += 1;
            }
            if (len == old_score && len != 0) || len > old_score + 8 {
                break;
            }
            if scan + last_offset < old_size && old_at(scan + last_offset) == new_at(scan) {
                old_score -= 1;
            }
            scan += 1;
        }

        if len == old_score && scan != new_size {
            continue;
        }

        // Forward extension of the previous match.
        let mut s = 0;
        let mut best_f = 0;
        let mut len_f = 0;
        let mut i = 0;
        while last_scan + i < scan && last_pos + i < old_size {
            if old_at(last_pos + i) == new_at(last_scan + i) {
                s += 1;
            }
            i += 1;
            if s * 2 - i > best_f * 2 - len_f {
                best_f = s;
                len_f = i;
            }
        }

        // Backward extension of this match.
        let mut len_b = 0;
        if scan < new_size {
            let mut s = 0;
            let mut best_b = 0;
            let mut i = 1;
            while scan >= last_scan + i && pos >= i {
                if old_at(pos - i) == new_at(scan - i) {
                    s += 1;
                }
                if s * 2 - i > best_b * 2 - len_b {
                    best_b = s;
                    len_b = i;
                }
                i += 1;
            }
        }

        if last_scan + len_f > scan - len_b {
            let overlap = (last_scan + len_f) - (scan - len_b);
            let mut s = 0;
            let mut best_s = 0;
            let mut len_s = 0;
            for i in 0..overlap {
                if new_at(last_scan + len_f - overlap + i) == old_at(last_pos + len_f - overlap + i) {
                    s += 1;
                }
                if new_at(scan - len_b + i) == old_at(pos - len_b + i) {
                    s -= 1;
                }
                if s > best_s {
                    best_s = s;
                    len_s = i + 1;
                }
            }
            len_f += len_s - overlap;
            len_b -= len_s;
        }

        let m = Match {
            add_old_start: last_pos as usize,
            add_new_start: start + last_scan as usize,
            add_length: len_f as usize,
            copy_end: start + (scan - len_b) as usize,
        };
        if !emit(m) {
            return false;
        }

        last_scan = scan - len_b;
        last_pos = pos - len_b;
        last_offset = pos - scan;
    }
    true
}

/// Turns matches into control records, accumulating diff and extra bytes.
struct SeriesWriter<'a> {
    old: &'a [u8],
    new: &'a [u8],
    pending: Option<Control>,
    /// Old pointer after the pending control's add.
    old_pos: i64,
    diff: Vec<u8>,
    extra: Vec<u8>,
    stats: BsdiffStats,
}

impl<'a> SeriesWriter<'a> {
    fn new(old: &'a [u8], new: &'a [u8]) -> Self {
        Self {
            old,
            new,
            pending: None,
            old_pos: 0,
            diff: Vec::new(),
            extra: Vec::new(),
            stats: BsdiffStats::default(),
        }
    }

    fn emit<W: Write>(&mut self, control: Control, ctx: &mut WriteContext<W>) -> Result<()> {
        ctx.write_message(&control)?;
        self.stats.controls += 1;
        Ok(())
    }

    fn push<W: Write>(&mut self, m: Match, ctx: &mut WriteContext<W>) -> Result<()> {
        let copy_start = m.add_new_start + m.add_length;
        if m.add_length == 0 && m.copy_end == copy_start {
            return Ok(());
        }

        let target = m.add_old_start as i64;
        match self.pending.take() {
            Some(mut prev) => {
                prev.seek = if m.add_length > 0 { target - self.old_pos } else { 0 };
                self.emit(prev, ctx)?;
            }
            None if m.add_length > 0 && target != 0 => {
                self.emit(
                    Control {
                        add: 0,
                        copy: 0,
                        seek: target,
                        eof: false,
                    },
                    ctx,
                )?;
            }
            None => {}
        }
        if m.add_length > 0 {
            self.old_pos = target + m.add_length as i64;
        }

        let old = &self.old[m.add_old_start..m.add_old_start + m.add_length];
        let new = &self.new[m.add_new_start..copy_start];
        self.diff
            .extend(new.iter().zip(old).map(|(n, o)| n.wrapping_sub(*o)));
        self.extra.extend_from_slice(&self.new[copy_start..m.copy_end]);

        self.pending = Some(Control {
            add: m.add_length as i64,
            copy: (m.copy_end - copy_start) as i64,
            seek: 0,
            eof: false,
        });
        Ok(())
    }

    fn finish<W: Write>(mut self, ctx: &mut WriteContext<W>) -> Result<BsdiffStats> {
        if let Some(last) = self.pending.take() {
            self.emit(last, ctx)?;
        }
        ctx.write_message(&Control::EOF)?;
        self.stats.diff_bytes = self.diff.len() as u64;
        self.stats.extra_bytes = self.extra.len() as u64;
        ctx.write_message(&BsdiffDiff { bytes: self.diff })?;
        ctx.write_message(&BsdiffExtra { bytes: self.extra })?;
        Ok(self.stats)
    }
}
