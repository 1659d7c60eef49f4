//! Framed wire format.
//!
//! A stream is `magic | header | compression envelope { messages... }`.
//! The magic and header are never compressed; the header names the codec
//! that wraps everything after it.

pub mod compression;
mod read;
mod write;

use std::io::{Read, Seek, SeekFrom, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::patch_format::{PatchHeader, SignatureHeader};

pub use compression::{
    CodecRegistry, CodecRegistryBuilder, CompressionAlgorithm, CompressionSettings, Decoder,
    Encoder,
};
pub use read::{Checkpoint, ReadContext};
pub use write::WriteContext;

/// Headers that select the envelope codec.
pub trait EnvelopeHeader: Serialize + DeserializeOwned {
    fn compression(&self) -> CompressionSettings;
}

impl EnvelopeHeader for PatchHeader {
    fn compression(&self) -> CompressionSettings {
        self.compression
    }
}

impl EnvelopeHeader for SignatureHeader {
    fn compression(&self) -> CompressionSettings {
        self.compression
    }
}

/// Writes magic and header, then opens the compression envelope.
pub fn open_write<W: Write, H: EnvelopeHeader>(
    writer: W,
    magic: u32,
    header: &H,
    registry: &CodecRegistry,
) -> Result<WriteContext<Encoder<W>>> {
    let mut raw = WriteContext::new(writer);
    raw.write_magic(magic)?;
    raw.write_message(header)?;
    let encoder = registry.compress(raw.into_inner(), header.compression())?;
    Ok(WriteContext::new(encoder))
}

/// Closes the envelope opened by [`open_write`] and returns the sink.
pub fn finish_write<W: Write>(ctx: WriteContext<Encoder<W>>) -> Result<W> {
    Ok(ctx.into_inner().finish()?)
}

/// Checks magic, reads the header and opens the envelope it names.
pub fn open_read<R: Read, H: EnvelopeHeader>(
    reader: R,
    magic: u32,
    registry: &CodecRegistry,
) -> Result<(H, ReadContext<Decoder<R>>)> {
    let mut raw = ReadContext::new(reader);
    raw.read_magic(magic)?;
    let header: H = raw.read_message()?;
    let decoder = registry.decompress(raw.into_inner(), header.compression().algorithm)?;
    Ok((header, ReadContext::new(decoder)))
}

/// Re-opens a stream at `checkpoint`, over the same bytes that produced it.
///
/// Uncompressed envelopes seek straight to the save point. Compressed ones are
/// replayed from the start of the envelope, which rebuilds the decompressor's
/// window exactly as it was when the checkpoint was taken.
pub fn resume_read<R: Read + Seek, H: EnvelopeHeader>(
    mut reader: R,
    magic: u32,
    registry: &CodecRegistry,
    checkpoint: Checkpoint,
) -> Result<(H, ReadContext<Decoder<R>>)> {
    reader.seek(SeekFrom::Start(0))?;
    let mut raw = ReadContext::new(reader);
    raw.read_magic(magic)?;
    let header: H = raw.read_message()?;
    let algorithm = header.compression().algorithm;

    if algorithm == CompressionAlgorithm::None {
        let envelope_start = raw.offset();
        let mut reader = raw.into_inner();
        reader.seek(SeekFrom::Start(envelope_start + checkpoint.offset))?;
        let decoder = registry.decompress(reader, algorithm)?;
        return Ok((header, ReadContext::with_offset(decoder, checkpoint.offset)));
    }

    let decoder = registry.decompress(raw.into_inner(), algorithm)?;
    let mut ctx = ReadContext::new(decoder);
    ctx.skip(checkpoint.offset)?;
    Ok((header, ctx))
}
