//! Repairs wounded files by copying them whole out of a known-good archive.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver};
use tracing::{debug, info};

use crate::bowl::buffered_copy;
use crate::cancel::CancelToken;
use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{Wound, WoundKind};
use crate::pool::{Pool, ZipPool};
use crate::retry::RetryPolicy;
use crate::signature::Signature;
use crate::util;
use crate::validate::{validate, ValidationReport};

/// Where healthy copies of the files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealSpec {
    /// A zip archive holding the whole tree, entries named by path.
    Archive(PathBuf),
    /// Reserved.
    Manifest(String),
}

impl HealSpec {
    /// Parses `"archive,<path>"` or `"manifest,<location>"`.
    pub fn parse(spec: &str) -> Result<HealSpec> {
        let (kind, location) = spec
            .split_once(',')
            .ok_or_else(|| Error::malformed(format!("heal spec {spec:?} lacks a comma")))?;
        if location.is_empty() {
            return Err(Error::malformed(format!("heal spec {spec:?} has no location")));
        }
        match kind {
            "archive" => Ok(HealSpec::Archive(PathBuf::from(location))),
            "manifest" => Ok(HealSpec::Manifest(location.to_string())),
            other => Err(Error::malformed(format!("unknown healer kind {other:?}"))),
        }
    }

    /// Healer writing into `out`, the tree described by `container`.
    pub fn build(&self, container: Container, out: impl Into<PathBuf>, options: HealOptions) -> Result<ArchiveHealer> {
        match self {
            HealSpec::Archive(archive) => Ok(ArchiveHealer {
                archive: archive.clone(),
                container,
                out: out.into(),
                options,
            }),
            HealSpec::Manifest(_) => Err(Error::IncompatibleVersion(
                "manifest healing is not supported".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for HealOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealSummary {
    pub files_healed: usize,
    pub bytes_healed: u64,
}

pub struct ArchiveHealer {
    archive: PathBuf,
    container: Container,
    out: PathBuf,
    options: HealOptions,
}

impl ArchiveHealer {
    /// Consumes wounds until the channel closes. A file is healed once,
    /// after its `ClosedFile` wound arrives.
    pub fn heal(&self, wounds: Receiver<Wound>, cancel: &CancelToken) -> Result<HealSummary> {
        let workers = self.options.workers.max(1);
        let (work_tx, work_rx) = bounded::<usize>(workers * 2);

        let (dispatched, results) = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let work_rx = work_rx.clone();
                    scope.spawn(move || self.run_worker(worker, work_rx, cancel))
                })
                .collect();
            drop(work_rx);

            let dispatched = self.dispatch(wounds, &work_tx, cancel);
            drop(work_tx);

            let mut summaries = Vec::with_capacity(workers);
            for handle in handles {
                summaries.push(
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::corrupt("heal worker panicked"))),
                );
            }
            (dispatched, summaries)
        });

        // A worker's failure explains a dispatcher that could not hand off work.
        let mut summary = HealSummary::default();
        for result in results {
            let part = result?;
            summary.files_healed += part.files_healed;
            summary.bytes_healed += part.bytes_healed;
        }
        dispatched?;
        info!(files = summary.files_healed, bytes = summary.bytes_healed, "healing finished");
        Ok(summary)
    }

    fn dispatch(&self, wounds: Receiver<Wound>, work: &crossbeam_channel::Sender<usize>, cancel: &CancelToken) -> Result<()> {
        let mut wounded: HashSet<usize> = HashSet::new();
        let mut queued: HashSet<usize> = HashSet::new();
        let queue = |index: usize, queued: &mut HashSet<usize>| -> Result<()> {
            if queued.insert(index) {
                work.send(index)
                    .map_err(|_| Error::corrupt("heal workers stopped early"))?;
            }
            Ok(())
        };

        for wound in wounds {
            cancel.check()?;
            let Ok(index) = usize::try_from(wound.file_index) else {
                continue;
            };
            if index >= self.container.files.len() {
                return Err(Error::malformed(format!("wound names unknown file {index}")));
            }
            match wound.kind {
                WoundKind::File => {
                    wounded.insert(index);
                }
                WoundKind::ClosedFile if wounded.remove(&index) => queue(index, &mut queued)?,
                WoundKind::ClosedFile => {}
            }
        }
        // Files whose close never arrived are healed all the same.
        for index in wounded {
            queue(index, &mut queued)?;
        }
        Ok(())
    }

    fn run_worker(&self, worker: usize, work: Receiver<usize>, cancel: &CancelToken) -> Result<HealSummary> {
        let mut summary = HealSummary::default();
        let mut pool: Option<ZipPool<BufReader<File>>> = None;
        for index in work {
            cancel.check()?;
            if pool.is_none() {
                let file = File::open(&self.archive)
                    .with_context(|| format!("opening {}", self.archive.display()))?;
                pool = Some(ZipPool::new(self.container.clone(), BufReader::new(file))?);
            }
            let Some(pool) = pool.as_mut() else {
                continue;
            };
            let path = &self.container.files[index].path;
            let bytes = self
                .options
                .retry
                .run(cancel, path, || self.heal_file(pool, index))?;
            debug!(worker, %path, bytes, "healed");
            summary.files_healed += 1;
            summary.bytes_healed += bytes;
        }
        Ok(summary)
    }

    fn heal_file(&self, pool: &mut dyn Pool, index: usize) -> Result<u64> {
        let entry = &self.container.files[index];
        let dest = self.out.join(&entry.path);
        heal_into(pool, index, &dest, entry.size, entry.mode)
    }
}

fn heal_into(pool: &mut dyn Pool, index: usize, dest: &Path, size: u64, mode: u32) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;
    }
    if fs::symlink_metadata(dest).is_ok_and(|m| !m.is_file()) {
        util::remove_entry(dest)?;
    }
    let reader = pool.reader(index)?;
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = BufWriter::new(file);
    let copied = buffered_copy(reader, &mut writer, size)?;
    writer.flush()?;
    util::set_mode(dest, mode)?;
    Ok(copied)
}

/// Validates `dir` against `signature` while `healer` repairs whatever
/// the validator wounds.
pub fn validate_and_heal(
    signature: &Signature,
    dir: &Path,
    healer: &ArchiveHealer,
    cancel: &CancelToken,
) -> Result<(ValidationReport, HealSummary)> {
    let (wound_tx, wound_rx) = unbounded();
    let (report, healed) = thread::scope(|scope| {
        let healing = scope.spawn(move || healer.heal(wound_rx, cancel));
        let report = validate(signature, dir, &wound_tx, cancel);
        drop(wound_tx);
        let healed = healing
            .join()
            .unwrap_or_else(|_| Err(Error::corrupt("healer panicked")));
        (report, healed)
    });
    Ok((report?, healed?))
}
