//! Directory tree descriptors.
//!
//! A [`Container`] lists the files, directories and symlinks of a tree in a
//! stable order. Indices into `files` are the file identifiers used by
//! patches, signatures and wounds.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::bowl::STAGE_DIR_NAME;
use crate::error::{Error, Result, ResultExt};
use crate::util;

/// Permission bits every walked file gets, so the patcher can always rewrite it.
pub const MODE_MASK_FILE: u32 = 0o644;
/// Permission bits every walked directory gets, so it stays traversable.
pub const MODE_MASK_DIR: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    /// Offset of this file in the concatenation of all files, in order.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    pub path: String,
    pub mode: u32,
    /// Raw link destination, never resolved.
    pub dest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub size: u64,
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
    pub symlinks: Vec<SymlinkEntry>,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Directory names skipped wherever they appear.
    pub ignored_dirs: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            ignored_dirs: [".git", ".hg", ".svn", "CVS", STAGE_DIR_NAME]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Container {
    /// Walks `root` depth-first, siblings in lexicographic order.
    /// Paths use forward slashes regardless of platform.
    pub fn walk(root: &Path, opts: &WalkOptions) -> Result<Container> {
        let mut container = Container::default();

        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry
                .map_err(|e| Error::Io(e.into()))
                .with_context(|| format!("walking {}", root.display()))?;
            let file_type = entry.file_type();

            if file_type.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| opts.ignored_dirs.iter().any(|i| i == name))
            {
                debug!(path = %entry.path().display(), "skipping ignored directory");
                walker.skip_current_dir();
                continue;
            }

            let rel = util::relative_slash_path(root, entry.path())?;
            let meta = entry
                .metadata()
                .map_err(|e| Error::Io(e.into()))
                .with_context(|| format!("reading metadata of {}", entry.path().display()))?;
            let mode = util::permission_bits(&meta);

            if file_type.is_symlink() {
                let dest = fs::read_link(entry.path())
                    .with_context(|| format!("reading link {}", entry.path().display()))?;
                container.symlinks.push(SymlinkEntry {
                    path: rel,
                    mode: mode | MODE_MASK_FILE,
                    dest: dest.to_string_lossy().replace('\\', "/"),
                });
            } else if file_type.is_dir() {
                container.dirs.push(DirEntry {
                    path: rel,
                    mode: mode | MODE_MASK_DIR,
                });
            } else if file_type.is_file() {
                let size = meta.len();
                container.files.push(FileEntry {
                    path: rel,
                    mode: mode | MODE_MASK_FILE,
                    size,
                    offset: container.size,
                });
                container.size += size;
            } else {
                warn!(path = %entry.path().display(), "skipping special file");
            }
        }

        Ok(container)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty() && self.symlinks.is_empty()
    }

    pub fn file(&self, index: usize) -> Result<&FileEntry> {
        self.files.get(index).ok_or_else(|| {
            Error::malformed(format!(
                "file index {index} out of range ({} files)",
                self.files.len()
            ))
        })
    }

    /// Map from file path to file index.
    pub fn file_indices(&self) -> HashMap<&str, usize> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.as_str(), i))
            .collect()
    }

    /// Creates the directory skeleton, empty files with their modes, and
    /// symlinks under `base`. File contents are not written.
    pub fn prepare(&self, base: &Path) -> Result<()> {
        self.prepare_dirs(base)?;
        for file in &self.files {
            let full = base.join(&file.path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
            fs::File::create(&full).with_context(|| format!("creating file {}", full.display()))?;
            util::set_mode(&full, file.mode)?;
        }
        self.prepare_symlinks(base)
    }

    pub fn prepare_dirs(&self, base: &Path) -> Result<()> {
        fs::create_dir_all(base).with_context(|| format!("creating directory {}", base.display()))?;
        for dir in &self.dirs {
            let full = base.join(&dir.path);
            fs::create_dir_all(&full)
                .with_context(|| format!("creating directory {}", full.display()))?;
            util::set_mode(&full, dir.mode)?;
        }
        Ok(())
    }

    pub fn prepare_symlinks(&self, base: &Path) -> Result<()> {
        for link in &self.symlinks {
            let full = base.join(&link.path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
            if fs::symlink_metadata(&full).is_ok() {
                util::remove_entry(&full)?;
            }
            util::symlink(&link.dest, &full)?;
        }
        Ok(())
    }

    pub fn file_path(&self, base: &Path, index: usize) -> Result<PathBuf> {
        Ok(base.join(&self.file(index)?.path))
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} dirs, {} symlinks ({} bytes)",
            self.files.len(),
            self.dirs.len(),
            self.symlinks.len(),
            self.size
        )
    }
}
