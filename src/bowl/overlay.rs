//! Patching in place over a directory that holds the target tree.
//!
//! New contents go to a stage folder inside the output directory and only
//! land on commit, so the target files stay readable for the whole apply.
//! Commit is not atomic: a failure halfway leaves a tree that neither
//! matches the target nor the source, but validates and heals.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bowl::{Bowl, BowlCheckpoint, EntryWriter, FileEntryWriter, Transposition};
use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::util;

/// Stage folder, relative to the output directory.
pub const STAGE_DIR_NAME: &str = ".treedelta-stage";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayState {
    /// Source files whose contents wait in the stage folder.
    pub staged: BTreeSet<usize>,
    /// Source files already in place: their target twin has the same path.
    pub kept: BTreeSet<usize>,
    pub transpositions: Vec<Transposition>,
}

pub struct OverlayBowl {
    target: Container,
    source: Container,
    out: PathBuf,
    stage: PathBuf,
    state: OverlayState,
}

impl OverlayBowl {
    pub fn new(target: Container, source: Container, out: impl Into<PathBuf>) -> Self {
        let out = out.into();
        let stage = out.join(STAGE_DIR_NAME);
        Self {
            target,
            source,
            out,
            stage,
            state: OverlayState::default(),
        }
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    fn staged_path(&self, source_index: usize) -> PathBuf {
        self.stage.join(source_index.to_string())
    }

    fn ensure_stage(&self) -> Result<()> {
        fs::create_dir_all(&self.stage)
            .with_context(|| format!("creating stage folder {}", self.stage.display()))
    }
}

impl Bowl for OverlayBowl {
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn EntryWriter>> {
        let mode = self.source.file(index)?.mode;
        self.ensure_stage()?;
        self.state.staged.insert(index);
        Ok(Box::new(FileEntryWriter::new(self.staged_path(index), mode)))
    }

    fn transpose(&mut self, t: Transposition) -> Result<()> {
        let target = self.target.file(t.target_index)?;
        let source = self.source.file(t.source_index)?;
        if target.size != source.size {
            return Err(Error::malformed(format!(
                "transposing {} ({} bytes) onto {} ({} bytes)",
                target.path, target.size, source.path, source.size
            )));
        }
        if target.path == source.path {
            self.state.kept.insert(t.source_index);
        } else {
            self.state.transpositions.push(t);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let state = std::mem::take(&mut self.state);
        let mut commit = Commit {
            bowl: self,
            staged: state.staged,
            detached: 0,
        };
        commit.run(&state.kept, &state.transpositions)
    }

    fn save(&self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Overlay(self.state.clone()))
    }

    fn resume(&mut self, checkpoint: &BowlCheckpoint) -> Result<()> {
        match checkpoint {
            BowlCheckpoint::Overlay(state) => {
                self.state = state.clone();
                Ok(())
            }
            other => Err(Error::malformed(format!(
                "cannot resume an overlay bowl from {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Copy,
    Move,
}

#[derive(Debug)]
struct PendingOp {
    kind: OpKind,
    source_index: usize,
    from: PathBuf,
    to: PathBuf,
}

struct Commit<'a> {
    bowl: &'a OverlayBowl,
    staged: BTreeSet<usize>,
    detached: usize,
}

impl Commit<'_> {
    fn run(&mut self, kept: &BTreeSet<usize>, transpositions: &[Transposition]) -> Result<()> {
        let bowl = self.bowl;
        let needed_dirs = needed_dirs(&bowl.source);
        let mut ops = self.pending_ops(kept, transpositions);
        info!(
            staged = self.staged.len(),
            kept = kept.len(),
            transpositions = ops.len(),
            "committing overlay"
        );

        self.clear_obstructions(&needed_dirs, &mut ops)?;
        self.run_ops(ops)?;
        self.remove_obsolete_entries(&needed_dirs)?;

        bowl.source.prepare_dirs(&bowl.out)?;
        for &index in &self.staged {
            let dest = bowl.source.file_path(&bowl.out, index)?;
            rename(&bowl.staged_path(index), &dest)?;
        }
        for file in &bowl.source.files {
            util::set_mode(&bowl.out.join(&file.path), file.mode)?;
        }
        bowl.source.prepare_symlinks(&bowl.out)?;

        self.remove_obsolete_dirs(&needed_dirs);
        util::remove_entry(&bowl.stage)
    }

    /// Every transposition of a target file copies it, except the last one,
    /// which moves it unless a source file keeps its path.
    fn pending_ops(&self, kept: &BTreeSet<usize>, transpositions: &[Transposition]) -> Vec<PendingOp> {
        let bowl = self.bowl;
        let kept_paths: HashSet<&str> = kept
            .iter()
            .filter_map(|&s| bowl.source.files.get(s))
            .map(|f| f.path.as_str())
            .collect();

        let mut by_target: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for t in transpositions {
            by_target.entry(t.target_index).or_default().push(t.source_index);
        }

        let mut ops = Vec::new();
        for (target_index, sources) in by_target {
            let Some(target) = bowl.target.files.get(target_index) else {
                continue;
            };
            let movable = !kept_paths.contains(target.path.as_str());
            let last = sources.len() - 1;
            for (k, source_index) in sources.into_iter().enumerate() {
                let Some(source) = bowl.source.files.get(source_index) else {
                    continue;
                };
                ops.push(PendingOp {
                    kind: if movable && k == last { OpKind::Move } else { OpKind::Copy },
                    source_index,
                    from: bowl.out.join(&target.path),
                    to: bowl.out.join(&source.path),
                });
            }
        }
        ops
    }

    /// Moves a target file out of the way into the stage folder and points
    /// every op reading it at the new location.
    fn detach(&mut self, location: &Path, ops: &mut [PendingOp]) -> Result<()> {
        self.bowl.ensure_stage()?;
        let parked = self.bowl.stage.join(format!("detached-{}", self.detached));
        self.detached += 1;
        debug!(from = %location.display(), to = %parked.display(), "detaching");
        rename(location, &parked)?;
        for op in ops.iter_mut().filter(|op| op.from == location) {
            op.from = parked.clone();
        }
        Ok(())
    }

    /// Clears files and symlinks sitting where the source tree needs a
    /// directory, and symlinks sitting where it needs a file.
    fn clear_obstructions(&mut self, needed_dirs: &BTreeSet<String>, ops: &mut [PendingOp]) -> Result<()> {
        let out = self.bowl.out.clone();
        for dir in needed_dirs {
            let full = out.join(dir);
            match fs::symlink_metadata(&full) {
                Ok(meta) if !meta.is_dir() => {
                    if ops.iter().any(|op| op.from == full) {
                        self.detach(&full, ops)?;
                    } else {
                        debug!(path = %dir, "removing entry in the way of a directory");
                        util::remove_entry(&full)?;
                    }
                }
                _ => {}
            }
        }
        for file in &self.bowl.source.files {
            let full = out.join(&file.path);
            if fs::symlink_metadata(&full).is_ok_and(|m| m.file_type().is_symlink()) {
                util::remove_entry(&full)?;
            }
        }
        Ok(())
    }

    /// Runs transpositions so that no file is overwritten before every op
    /// reading it has run. Cycles are broken by detaching a file that is
    /// both read and overwritten.
    fn run_ops(&mut self, mut pending: Vec<PendingOp>) -> Result<()> {
        while !pending.is_empty() {
            let ready = (0..pending.len()).find(|&i| {
                let op = &pending[i];
                !pending.iter().enumerate().any(|(j, other)| {
                    j != i
                        && (other.from == op.to
                            || (op.kind == OpKind::Move && other.from == op.from))
                })
            });

            match ready {
                Some(i) => {
                    let op = pending.remove(i);
                    self.run_op(&op)?;
                }
                None => {
                    let contested = pending
                        .iter()
                        .map(|op| op.to.clone())
                        .find(|to| pending.iter().any(|other| &other.from == to))
                        .ok_or_else(|| Error::corrupt("overlay commit cannot order transpositions"))?;
                    self.detach(&contested, &mut pending)?;
                }
            }
        }
        Ok(())
    }

    fn run_op(&mut self, op: &PendingOp) -> Result<()> {
        let mut dest = op.to.clone();
        if fs::symlink_metadata(&dest).is_ok_and(|m| m.is_dir()) {
            // The target directory goes away once every op has read from it.
            self.bowl.ensure_stage()?;
            dest = self.bowl.staged_path(op.source_index);
            self.staged.insert(op.source_index);
        } else if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        debug!(kind = ?op.kind, from = %op.from.display(), to = %dest.display(), "transposing");
        match op.kind {
            OpKind::Move => rename(&op.from, &dest),
            OpKind::Copy => fs::copy(&op.from, &dest)
                .map(|_| ())
                .with_context(|| format!("copying {} to {}", op.from.display(), dest.display())),
        }
    }

    /// Target files and symlinks with no place in the source tree, and target
    /// directories where the source tree has a file.
    fn remove_obsolete_entries(&self, needed_dirs: &BTreeSet<String>) -> Result<()> {
        let bowl = self.bowl;
        let source_files: HashSet<&str> = bowl.source.files.iter().map(|f| f.path.as_str()).collect();
        let source_links: HashSet<&str> = bowl.source.symlinks.iter().map(|l| l.path.as_str()).collect();

        let stale_files = bowl.target.files.iter().map(|f| f.path.as_str());
        let stale_links = bowl.target.symlinks.iter().map(|l| l.path.as_str());
        for path in stale_files.chain(stale_links) {
            if source_files.contains(path) || needed_dirs.contains(path) {
                continue;
            }
            debug!(%path, "removing obsolete entry");
            util::remove_entry(&bowl.out.join(path))?;
        }

        for dir in &bowl.target.dirs {
            let path = dir.path.as_str();
            if !needed_dirs.contains(path) && (source_files.contains(path) || source_links.contains(path)) {
                debug!(%path, "removing directory replaced by a file");
                util::remove_entry(&bowl.out.join(path))?;
            }
        }
        Ok(())
    }

    fn remove_obsolete_dirs(&self, needed_dirs: &BTreeSet<String>) {
        let bowl = self.bowl;
        let mut obsolete: Vec<String> = bowl
            .target
            .dirs
            .iter()
            .filter(|d| !needed_dirs.contains(&d.path))
            .map(|d| d.path.clone())
            .collect();
        util::sort_dirs_deepest_first(&mut obsolete);
        for dir in obsolete {
            let full = bowl.out.join(&dir);
            if !fs::symlink_metadata(&full).is_ok_and(|m| m.is_dir()) {
                continue;
            }
            if let Err(e) = fs::remove_dir(&full) {
                warn!(path = %dir, error = %e, "leaving obsolete directory in place");
            }
        }
    }
}

/// Directories of the source tree, including every parent of an entry.
fn needed_dirs(source: &Container) -> BTreeSet<String> {
    let mut dirs: BTreeSet<String> = source.dirs.iter().map(|d| d.path.clone()).collect();
    let entries = source
        .files
        .iter()
        .map(|f| f.path.as_str())
        .chain(source.dirs.iter().map(|d| d.path.as_str()))
        .chain(source.symlinks.iter().map(|l| l.path.as_str()));
    for path in entries {
        for (i, _) in path.match_indices('/') {
            dirs.insert(path[..i].to_string());
        }
    }
    dirs
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::rename(from, to).with_context(|| format!("moving {} to {}", from.display(), to.display()))
}
