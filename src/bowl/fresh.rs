use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;

use tracing::debug;

use crate::bowl::{buffered_copy, Bowl, BowlCheckpoint, EntryWriter, FileEntryWriter, Transposition};
use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::pool::Pool;
use crate::util;

/// Builds the source tree in an empty directory. Transposed files are
/// copied out of the target pool.
pub struct FreshBowl {
    target: Container,
    target_pool: Box<dyn Pool>,
    source: Container,
    out: PathBuf,
    prepared: bool,
}

impl FreshBowl {
    pub fn new(
        target: Container,
        target_pool: Box<dyn Pool>,
        source: Container,
        out: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target,
            target_pool,
            source,
            out: out.into(),
            prepared: false,
        }
    }

    /// Lays out directories, empty files and symlinks before the first file
    /// is written. Skipped when resuming.
    fn ensure_prepared(&mut self) -> Result<()> {
        if !self.prepared {
            debug!(out = %self.out.display(), "preparing fresh output");
            self.source.prepare(&self.out)?;
            self.prepared = true;
        }
        Ok(())
    }
}

impl Bowl for FreshBowl {
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn EntryWriter>> {
        self.ensure_prepared()?;
        let entry = self.source.file(index)?;
        Ok(Box::new(FileEntryWriter::new(
            self.out.join(&entry.path),
            entry.mode,
        )))
    }

    fn transpose(&mut self, t: Transposition) -> Result<()> {
        self.ensure_prepared()?;
        let target = self.target.file(t.target_index)?.clone();
        let source = self.source.file(t.source_index)?;
        if target.size != source.size {
            return Err(Error::malformed(format!(
                "transposing {} ({} bytes) onto {} ({} bytes)",
                target.path, target.size, source.path, source.size
            )));
        }
        let dest = self.out.join(&source.path);
        let mode = source.mode;

        let reader = self.target_pool.reader(t.target_index)?;
        let file = File::create(&dest).with_context(|| format!("creating {}", dest.display()))?;
        let mut writer = BufWriter::new(file);
        buffered_copy(reader, &mut writer, target.size)
            .with_context(|| format!("copying {} to {}", target.path, dest.display()))?;
        writer.flush()?;
        util::set_mode(&dest, mode)
    }

    fn commit(&mut self) -> Result<()> {
        // A patch with no files still yields the directory skeleton.
        self.ensure_prepared()?;
        self.target_pool.close()
    }

    fn save(&self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Fresh)
    }

    fn resume(&mut self, checkpoint: &BowlCheckpoint) -> Result<()> {
        match checkpoint {
            BowlCheckpoint::Fresh => {
                self.prepared = true;
                Ok(())
            }
            other => Err(Error::malformed(format!(
                "cannot resume a fresh bowl from {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::WalkOptions;
    use crate::pool::FsPool;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn writes_and_transposes_into_empty_dir() {
        let target_dir = TempDir::new().unwrap();
        fs::write(target_dir.path().join("a"), b"x").unwrap();
        let target = Container::walk(target_dir.path(), &WalkOptions::default()).unwrap();

        let source_dir = TempDir::new().unwrap();
        fs::create_dir(source_dir.path().join("sub")).unwrap();
        fs::write(source_dir.path().join("sub/b"), b"x").unwrap();
        fs::write(source_dir.path().join("c"), b"new").unwrap();
        let source = Container::walk(source_dir.path(), &WalkOptions::default()).unwrap();
        let c = source.files.iter().position(|f| f.path == "c").unwrap();
        let b = source.files.iter().position(|f| f.path == "sub/b").unwrap();

        let out = TempDir::new().unwrap();
        let pool = Box::new(FsPool::new(target.clone(), target_dir.path()));
        let mut bowl = FreshBowl::new(target, pool, source, out.path());

        let mut writer = bowl.get_writer(c).unwrap();
        writer.write_all(b"new").unwrap();
        writer.finalize().unwrap();
        bowl.transpose(Transposition {
            target_index: 0,
            source_index: b,
        })
        .unwrap();
        bowl.commit().unwrap();

        assert_eq!(fs::read(out.path().join("c")).unwrap(), b"new");
        assert_eq!(fs::read(out.path().join("sub/b")).unwrap(), b"x");
        assert!(!out.path().join("a").exists());
    }

    #[test]
    fn resumed_bowl_keeps_existing_files() {
        let out = TempDir::new().unwrap();
        fs::write(out.path().join("f"), b"already").unwrap();
        let mut source = Container::default();
        source.files.push(crate::container::FileEntry {
            path: "f".into(),
            mode: 0o644,
            size: 7,
            offset: 0,
        });
        let pool = Box::new(crate::pool::NullPool::new(Container::default()));
        let mut bowl = FreshBowl::new(Container::default(), pool, source, out.path());
        bowl.resume(&BowlCheckpoint::Fresh).unwrap();
        bowl.commit().unwrap();
        assert_eq!(fs::read(out.path().join("f")).unwrap(), b"already");
    }
}
