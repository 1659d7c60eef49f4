//! Random access to the file contents of a container.
//!
//! A pool hands out at most one reader at a time: the returned reader borrows
//! the pool, so asking for another index closes the previous one. This keeps
//! file descriptor pressure at one per pool.

mod fspool;
mod nullpool;
mod zippool;

use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;

use memmap2::Mmap;

use crate::error::Result;

pub use fspool::FsPool;
pub use nullpool::NullPool;
pub use zippool::ZipPool;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait Pool: Send {
    /// Number of files addressable by index.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared size of file `index`.
    fn size(&self, index: usize) -> u64;

    /// Reader for file `index`, positioned at its start.
    fn reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek>;

    /// Fresh writer for file `index`; previous contents are discarded.
    fn writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>>;

    /// Releases any open handle.
    fn close(&mut self) -> Result<()>;

    /// The whole of file `index`.
    fn contents(&mut self, index: usize) -> Result<EntryBytes> {
        read_entry(self, index).map(EntryBytes::Owned)
    }
}

/// A whole file, read into memory or mapped.
pub enum EntryBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for EntryBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            EntryBytes::Owned(bytes) => bytes,
            EntryBytes::Mapped(map) => map,
        }
    }
}

/// Reads the whole of file `index` into memory.
pub fn read_entry<P: Pool + ?Sized>(pool: &mut P, index: usize) -> Result<Vec<u8>> {
    let size = pool.size(index);
    let reader = pool.reader(index)?;
    reader.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::with_capacity(size as usize);
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}
