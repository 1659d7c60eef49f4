//! Block signatures of a container and the weak-hash library built from them.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::container::{Container, WalkOptions};
use crate::error::{Error, Result, ResultExt};
use crate::patch_format::{
    compute_num_blocks, BlockHash, SignatureHeader, BLOCK_SIZE, SIGNATURE_MAGIC,
};
use crate::pool::{FsPool, Pool};
use crate::rolling_hash::RollingHash;
use crate::util;
use crate::wire::{self, CodecRegistry, CompressionSettings, Encoder, WriteContext};

const BS: usize = BLOCK_SIZE as usize;

pub(crate) fn hash_block(file_index: i64, block_index: i64, data: &[u8]) -> BlockHash {
    BlockHash {
        file_index,
        block_index,
        weak_hash: RollingHash::of(data).digest(),
        strong_hash: util::strong_hash(data),
        short_size: if data.len() < BS { data.len() as i64 } else { 0 },
    }
}

/// Cuts the bytes of one file into blocks and hashes each of them.
///
/// Accepts writes of any size; only the final block may be short.
pub struct BlockHasher {
    file_index: i64,
    block_index: i64,
    buf: Vec<u8>,
    hashes: Vec<BlockHash>,
}

impl BlockHasher {
    pub fn new(file_index: usize) -> Self {
        Self {
            file_index: file_index as i64,
            block_index: 0,
            buf: Vec::with_capacity(BS),
            hashes: Vec::new(),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BS - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == BS {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        self.hashes
            .push(hash_block(self.file_index, self.block_index, &self.buf));
        self.block_index += 1;
        self.buf.clear();
    }

    /// Hashes the tail block. An empty file still yields one zero-length entry.
    pub fn finish(mut self) -> Vec<BlockHash> {
        if !self.buf.is_empty() || self.block_index == 0 {
            self.emit();
        }
        self.hashes
    }
}

impl Write for BlockHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receives the block hashes of one file at a time.
pub trait HashSink {
    fn write_hashes(&mut self, hashes: &[BlockHash]) -> Result<()>;
}

impl HashSink for Vec<BlockHash> {
    fn write_hashes(&mut self, hashes: &[BlockHash]) -> Result<()> {
        self.extend_from_slice(hashes);
        Ok(())
    }
}

/// Streams a signature file: the container first, then block hashes as
/// they are produced.
pub struct SignatureWriter<W: Write> {
    ctx: WriteContext<Encoder<W>>,
    hashes_written: u64,
}

impl<W: Write> SignatureWriter<W> {
    pub fn new(
        writer: W,
        container: &Container,
        compression: CompressionSettings,
        registry: &CodecRegistry,
    ) -> Result<Self> {
        let header = SignatureHeader { compression };
        let mut ctx = wire::open_write(writer, SIGNATURE_MAGIC, &header, registry)?;
        ctx.write_message(container)?;
        Ok(Self {
            ctx,
            hashes_written: 0,
        })
    }

    pub fn finish(self) -> Result<W> {
        debug!(hashes = self.hashes_written, "signature written");
        wire::finish_write(self.ctx)
    }
}

impl<W: Write> HashSink for SignatureWriter<W> {
    fn write_hashes(&mut self, hashes: &[BlockHash]) -> Result<()> {
        for hash in hashes {
            self.ctx.write_message(hash)?;
        }
        self.hashes_written += hashes.len() as u64;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub container: Container,
    /// Ordered by file index, then block index.
    pub hashes: Vec<BlockHash>,
}

impl Signature {
    /// Hashes every file of `container`, read through `pool`.
    pub fn compute(container: &Container, pool: &mut dyn Pool, cancel: &CancelToken) -> Result<Signature> {
        let mut hashes = Vec::new();
        for (index, file) in container.files.iter().enumerate() {
            cancel.check()?;
            let mut hasher = BlockHasher::new(index);
            let reader = pool.reader(index)?;
            let copied = io::copy(reader, &mut hasher)
                .with_context(|| format!("hashing {}", file.path))?;
            if copied != file.size {
                return Err(Error::corrupt(format!(
                    "{}: expected {} bytes, read {copied}",
                    file.path, file.size
                )));
            }
            hashes.extend(hasher.finish());
        }
        pool.close()?;
        Ok(Signature {
            container: container.clone(),
            hashes,
        })
    }

    /// Walks `dir` and hashes what it finds.
    pub fn compute_dir(dir: &Path, opts: &WalkOptions, cancel: &CancelToken) -> Result<Signature> {
        let container = Container::walk(dir, opts)?;
        let mut pool = FsPool::new(container.clone(), dir);
        Signature::compute(&container, &mut pool, cancel)
    }

    pub fn write<W: Write>(
        &self,
        writer: W,
        compression: CompressionSettings,
        registry: &CodecRegistry,
    ) -> Result<W> {
        let mut sw = SignatureWriter::new(writer, &self.container, compression, registry)?;
        sw.write_hashes(&self.hashes)?;
        sw.finish()
    }

    pub fn read<R: Read>(reader: R, registry: &CodecRegistry) -> Result<Signature> {
        let (_header, mut ctx): (SignatureHeader, _) =
            wire::open_read(reader, SIGNATURE_MAGIC, registry)?;
        let container: Container = ctx.read_message().with_context(|| "reading signature container")?;

        let mut hashes = Vec::new();
        while let Some(hash) = ctx.try_read_message::<BlockHash>()? {
            hashes.push(hash);
        }

        let expected: u64 = container
            .files
            .iter()
            .map(|f| compute_num_blocks(f.size).max(1))
            .sum();
        if hashes.len() as u64 != expected {
            return Err(Error::malformed(format!(
                "signature has {} block hashes, container needs {expected}",
                hashes.len()
            )));
        }
        Ok(Signature { container, hashes })
    }

    /// Block hashes of file `file_index`, in block order.
    pub fn file_hashes(&self, file_index: usize) -> &[BlockHash] {
        let idx = file_index as i64;
        let start = self.hashes.partition_point(|h| h.file_index < idx);
        let end = self.hashes.partition_point(|h| h.file_index <= idx);
        &self.hashes[start..end]
    }
}

/// Where the next block of a pending range would have to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub file_index: i64,
    pub block_index: i64,
}

/// Weak-hash index over the non-empty blocks of a signature.
pub struct BlockLibrary {
    by_weak: HashMap<u32, Vec<BlockHash>>,
    short_sizes: Vec<usize>,
}

impl BlockLibrary {
    pub fn new(signature: &Signature) -> Self {
        let mut by_weak: HashMap<u32, Vec<BlockHash>> = HashMap::new();
        let mut short_sizes = Vec::new();
        for hash in &signature.hashes {
            let empty_file = signature
                .container
                .files
                .get(hash.file_index as usize)
                .is_none_or(|f| f.size == 0);
            if empty_file {
                continue;
            }
            if hash.short_size > 0 {
                short_sizes.push(hash.short_size as usize);
            }
            by_weak.entry(hash.weak_hash).or_default().push(hash.clone());
        }
        short_sizes.sort_unstable_by(|a, b| b.cmp(a));
        short_sizes.dedup();
        Self {
            by_weak,
            short_sizes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_weak.is_empty()
    }

    /// Distinct tail-block sizes, longest first.
    pub fn short_sizes(&self) -> &[usize] {
        &self.short_sizes
    }

    /// Finds a block whose contents equal `window`.
    ///
    /// Among equal candidates, one continuing `next` wins, then one from
    /// `preferred_file`, then the first indexed.
    pub fn find(
        &self,
        weak_hash: u32,
        window: &[u8],
        next: Option<BlockLocation>,
        preferred_file: Option<i64>,
    ) -> Option<&BlockHash> {
        let bucket = self.by_weak.get(&weak_hash)?;
        let mut strong: Option<Vec<u8>> = None;
        let mut best: Option<(u8, &BlockHash)> = None;

        for candidate in bucket {
            let size = if candidate.short_size > 0 {
                candidate.short_size as usize
            } else {
                BS
            };
            if size != window.len() {
                continue;
            }
            let strong = strong.get_or_insert_with(|| util::strong_hash(window));
            if candidate.strong_hash != *strong {
                continue;
            }

            let rank = if next.is_some_and(|n| {
                n.file_index == candidate.file_index && n.block_index == candidate.block_index
            }) {
                0
            } else if preferred_file == Some(candidate.file_index) {
                1
            } else {
                2
            };
            if best.is_none_or(|(r, _)| rank < r) {
                best = Some((rank, candidate));
                if rank == 0 {
                    break;
                }
            }
        }
        best.map(|(_, hash)| hash)
    }
}
