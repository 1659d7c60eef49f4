//! Output strategies for the patcher.
//!
//! A bowl receives the reconstructed source files one at a time, either as a
//! stream of bytes through an [`EntryWriter`] or as a transposition of a
//! whole target file, and makes them real on [`Bowl::commit`].

mod dry;
mod fresh;
mod overlay;

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::util;

pub use dry::DryBowl;
pub use fresh::FreshBowl;
pub use overlay::{OverlayBowl, OverlayState, STAGE_DIR_NAME};

/// Source file `source_index` is target file `target_index`, unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transposition {
    pub target_index: usize,
    pub source_index: usize,
}

/// Position of an entry writer, enough to reopen it and keep appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterCheckpoint {
    pub offset: u64,
}

/// Bowl state needed to finish an interrupted apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BowlCheckpoint {
    Dry,
    Fresh,
    Overlay(OverlayState),
}

pub trait EntryWriter: Write + Send {
    /// Bytes written so far.
    fn tell(&self) -> u64;

    /// Flushes and returns the current position.
    fn save(&mut self) -> Result<WriterCheckpoint>;

    /// Drops anything past `checkpoint` and continues writing from there.
    fn resume(&mut self, checkpoint: &WriterCheckpoint) -> Result<()>;

    /// Flushes and closes the entry.
    fn finalize(self: Box<Self>) -> Result<()>;
}

pub trait Bowl: Send {
    /// Writer for the contents of source file `index`.
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn EntryWriter>>;

    /// Reuses a target file as a source file without rewriting it.
    fn transpose(&mut self, transposition: Transposition) -> Result<()>;

    /// Makes every written and transposed file visible in the output.
    fn commit(&mut self) -> Result<()>;

    fn save(&self) -> Result<BowlCheckpoint>;

    fn resume(&mut self, checkpoint: &BowlCheckpoint) -> Result<()>;
}

/// Writes one file on disk. The file is created on the first write, so a
/// writer obtained only to be resumed never truncates what is there.
pub(crate) struct FileEntryWriter {
    path: PathBuf,
    mode: u32,
    file: Option<BufWriter<File>>,
    offset: u64,
}

impl FileEntryWriter {
    pub(crate) fn new(path: PathBuf, mode: u32) -> Self {
        Self {
            path,
            mode,
            file: None,
            offset: 0,
        }
    }

    fn open(&mut self) -> io::Result<&mut BufWriter<File>> {
        if self.file.is_none() {
            self.file = Some(BufWriter::new(File::create(&self.path)?));
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("entry writer closed"))
    }
}

impl Write for FileEntryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.open()?.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl EntryWriter for FileEntryWriter {
    fn tell(&self) -> u64 {
        self.offset
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        self.flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(WriterCheckpoint {
            offset: self.offset,
        })
    }

    fn resume(&mut self, checkpoint: &WriterCheckpoint) -> Result<()> {
        self.file = None;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("reopening {}", self.path.display()))?;
        let len = file.metadata()?.len();
        if len < checkpoint.offset {
            return Err(Error::corrupt(format!(
                "{} holds {len} bytes, checkpoint expects {}",
                self.path.display(),
                checkpoint.offset
            )));
        }
        file.set_len(checkpoint.offset)?;
        file.seek(SeekFrom::End(0))?;
        self.file = Some(BufWriter::new(file));
        self.offset = checkpoint.offset;
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<()> {
        let path = self.path.clone();
        self.open()
            .and_then(|file| file.flush())
            .with_context(|| format!("writing {}", path.display()))?;
        self.file = None;
        util::set_mode(&path, self.mode)
    }
}

/// Copies `size` bytes from `reader` to `writer` through a 32 KiB buffer.
pub(crate) fn buffered_copy<R, W>(reader: &mut R, writer: &mut W, size: u64) -> Result<u64>
where
    R: io::Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; 32 * 1024];
    let mut copied = 0u64;
    while copied < size {
        let want = buf.len().min((size - copied) as usize);
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::corrupt(format!(
                "source ended after {copied} of {size} bytes"
            )));
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}
