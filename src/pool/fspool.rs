use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::pool::{EntryBytes, Pool, ReadSeek};
use crate::util;

/// Pool over a directory laid out as its container describes.
pub struct FsPool {
    container: Container,
    base: PathBuf,
    current: Option<(usize, BufReader<File>)>,
}

impl FsPool {
    pub fn new(container: Container, base: impl Into<PathBuf>) -> Self {
        Self {
            container,
            base: base.into(),
            current: None,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn path(&self, index: usize) -> Result<PathBuf> {
        self.container.file_path(&self.base, index)
    }
}

impl Pool for FsPool {
    fn len(&self) -> usize {
        self.container.files.len()
    }

    fn size(&self, index: usize) -> u64 {
        self.container.files.get(index).map_or(0, |f| f.size)
    }

    fn reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek> {
        let already_open = matches!(&self.current, Some((cur, _)) if *cur == index);
        if !already_open {
            self.current = None;
            let path = self.path(index)?;
            let file = File::open(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::not_found(path.display().to_string()),
                _ => Error::Io(e).context(format!("opening {}", path.display())),
            })?;
            self.current = Some((index, BufReader::with_capacity(256 * 1024, file)));
        }

        match self.current.as_mut() {
            Some((_, reader)) => {
                reader.seek(SeekFrom::Start(0))?;
                Ok(reader as &mut dyn ReadSeek)
            }
            None => Err(Error::not_found(format!("file {index}"))),
        }
    }

    fn writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        let entry = self.container.file(index)?;
        let path = self.base.join(&entry.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        util::set_mode(&path, entry.mode)?;
        Ok(Box::new(BufWriter::new(file)) as Box<dyn Write + Send>)
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn contents(&mut self, index: usize) -> Result<EntryBytes> {
        // Empty files cannot be mapped on every platform.
        if self.size(index) == 0 {
            return Ok(EntryBytes::Owned(Vec::new()));
        }
        let path = self.path(index)?;
        if !path.is_file() {
            return Err(Error::not_found(path.display().to_string()));
        }
        Ok(EntryBytes::Mapped(util::mmap_file(&path)?))
    }
}
