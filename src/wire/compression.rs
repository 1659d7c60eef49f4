//! Compression envelope codecs.
//!
//! Codecs are selected by the algorithm id stored in a patch or signature
//! header. The set of usable codecs is held by a [`CodecRegistry`] built once
//! at startup and passed by reference to readers and writers.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub(crate) const UNKNOWN_ALGORITHM: &str = "unknown compression algorithm";

const BROTLI_BUFFER_SIZE: usize = 64 * 1024;
const BROTLI_LG_WINDOW: u32 = 22;

/// Compression algorithm ids as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum CompressionAlgorithm {
    None = 0,
    Brotli = 1,
    Gzip = 2,
    Zstd = 3,
}

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Brotli,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Zstd,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Brotli => "brotli",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// Quality used when none is given: brotli 1, zstd 9, gzip 6.
    pub fn default_quality(self) -> i32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Brotli => 1,
            CompressionAlgorithm::Gzip => 6,
            CompressionAlgorithm::Zstd => 9,
        }
    }
}

impl From<CompressionAlgorithm> for u32 {
    fn from(alg: CompressionAlgorithm) -> u32 {
        alg.id()
    }
}

impl TryFrom<u32> for CompressionAlgorithm {
    type Error = String;

    fn try_from(id: u32) -> std::result::Result<Self, String> {
        CompressionAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.id() == id)
            .ok_or_else(|| format!("{UNKNOWN_ALGORITHM} {id}"))
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CompressionAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::IncompatibleVersion(format!("{UNKNOWN_ALGORITHM} {s:?}")))
    }
}

/// Algorithm plus quality, as recorded in patch and signature headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub quality: i32,
}

impl CompressionSettings {
    pub fn new(algorithm: CompressionAlgorithm, quality: i32) -> Self {
        Self { algorithm, quality }
    }

    pub fn uncompressed() -> Self {
        Self::new(CompressionAlgorithm::None, 0)
    }

    /// Brotli at quality 9, used for rediffed patches.
    pub fn rediff_default() -> Self {
        Self::new(CompressionAlgorithm::Brotli, 9)
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self::new(
            CompressionAlgorithm::Brotli,
            CompressionAlgorithm::Brotli.default_quality(),
        )
    }
}

impl fmt::Display for CompressionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm, self.quality)
    }
}

/// Parses `"zstd"`, `"zstd-19"`, `"brotli-9"`, `"none"`.
impl FromStr for CompressionSettings {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some((name, quality)) => {
                let algorithm: CompressionAlgorithm = name.parse()?;
                let quality = quality.parse::<i32>().map_err(|_| {
                    Error::IncompatibleVersion(format!("invalid compression quality {quality:?}"))
                })?;
                Ok(Self::new(algorithm, quality))
            }
            None => {
                let algorithm: CompressionAlgorithm = s.parse()?;
                Ok(Self::new(algorithm, algorithm.default_quality()))
            }
        }
    }
}

/// Streaming compressor wrapping a sink.
pub enum Encoder<W: Write> {
    Plain(W),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    /// Terminates the compressed stream and hands back the sink.
    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            Encoder::Plain(w) => w,
            Encoder::Brotli(w) => w.into_inner(),
            Encoder::Gzip(w) => w.finish()?,
            Encoder::Zstd(w) => w.finish()?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Brotli(w) => w.write(buf),
            Encoder::Gzip(w) => w.write(buf),
            Encoder::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Brotli(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
            Encoder::Zstd(w) => w.flush(),
        }
    }
}

/// Streaming decompressor wrapping a source.
pub enum Decoder<R: Read> {
    Plain(R),
    Brotli(Box<brotli::Decompressor<R>>),
    Gzip(Box<flate2::read::GzDecoder<R>>),
    Zstd(Box<zstd::stream::read::Decoder<'static, BufReader<R>>>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Decoder::Plain(r) => r.read(buf),
            Decoder::Brotli(r) => r.read(buf).map_err(undecodable),
            Decoder::Gzip(r) => r.read(buf).map_err(undecodable),
            Decoder::Zstd(r) => r.read(buf).map_err(undecodable),
        }
    }
}

/// Codecs report bad input as `Other`, `InvalidInput` or `InvalidData`
/// depending on the crate; all of them become `InvalidData` here.
fn undecodable(err: io::Error) -> io::Error {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::NotFound => err,
        _ => io::Error::new(io::ErrorKind::InvalidData, err),
    }
}

/// The set of codecs available to readers and writers.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    registered: Vec<CompressionAlgorithm>,
}

#[derive(Debug, Default)]
pub struct CodecRegistryBuilder {
    registered: Vec<CompressionAlgorithm>,
}

impl CodecRegistryBuilder {
    pub fn register(mut self, algorithm: CompressionAlgorithm) -> Self {
        if !self.registered.contains(&algorithm) {
            self.registered.push(algorithm);
        }
        self
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            registered: self.registered,
        }
    }
}

impl Default for CodecRegistry {
    /// Every bundled codec.
    fn default() -> Self {
        CompressionAlgorithm::ALL
            .into_iter()
            .fold(CodecRegistry::builder(), CodecRegistryBuilder::register)
            .build()
    }
}

impl CodecRegistry {
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default().register(CompressionAlgorithm::None)
    }

    pub fn supports(&self, algorithm: CompressionAlgorithm) -> bool {
        self.registered.contains(&algorithm)
    }

    fn ensure(&self, algorithm: CompressionAlgorithm) -> Result<()> {
        if self.supports(algorithm) {
            Ok(())
        } else {
            Err(Error::IncompatibleVersion(format!(
                "no codec registered for {algorithm}"
            )))
        }
    }

    /// Wraps `writer` in the compressor for `settings`.
    pub fn compress<W: Write>(&self, writer: W, settings: CompressionSettings) -> Result<Encoder<W>> {
        self.ensure(settings.algorithm)?;
        let quality = settings.quality;
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => Encoder::Plain(writer),
            CompressionAlgorithm::Brotli => Encoder::Brotli(Box::new(brotli::CompressorWriter::new(
                writer,
                BROTLI_BUFFER_SIZE,
                quality.clamp(0, 11) as u32,
                BROTLI_LG_WINDOW,
            ))),
            CompressionAlgorithm::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::new(quality.clamp(0, 9) as u32),
            )),
            CompressionAlgorithm::Zstd => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(writer, quality.clamp(1, 22))?)
            }
        })
    }

    /// Wraps `reader` in the decompressor for `algorithm`.
    pub fn decompress<R: Read>(&self, reader: R, algorithm: CompressionAlgorithm) -> Result<Decoder<R>> {
        self.ensure(algorithm)?;
        Ok(match algorithm {
            CompressionAlgorithm::None => Decoder::Plain(reader),
            CompressionAlgorithm::Brotli => {
                Decoder::Brotli(Box::new(brotli::Decompressor::new(reader, BROTLI_BUFFER_SIZE)))
            }
            CompressionAlgorithm::Gzip => Decoder::Gzip(Box::new(flate2::read::GzDecoder::new(reader))),
            CompressionAlgorithm::Zstd => {
                Decoder::Zstd(Box::new(zstd::stream::read::Decoder::new(reader)?))
            }
        })
    }
}
