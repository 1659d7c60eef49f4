use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque save point inside a framed stream: the offset, in the stream this
/// context reads (i.e. after decompression), of the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: u64,
}

/// Reads magics and length-prefixed messages from a source.
///
/// Single-reader. Call [`want_save`](Self::want_save) to have the next
/// successful read record a [`Checkpoint`], then collect it with
/// [`pop_checkpoint`](Self::pop_checkpoint).
pub struct ReadContext<R: Read> {
    reader: R,
    offset: u64,
    scratch: Vec<u8>,
    want_save: bool,
    checkpoint: Option<Checkpoint>,
}

enum Fill {
    Full,
    Empty,
}

impl<R: Read> ReadContext<R> {
    pub fn new(reader: R) -> Self {
        Self::with_offset(reader, 0)
    }

    /// Starts counting at `offset`; used when resuming mid-stream.
    pub fn with_offset(reader: R, offset: u64) -> Self {
        Self {
            reader,
            offset,
            scratch: Vec::new(),
            want_save: false,
            checkpoint: None,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Save point at the current message boundary.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            offset: self.offset,
        }
    }

    pub fn want_save(&mut self) {
        self.want_save = true;
    }

    pub fn pop_checkpoint(&mut self) -> Option<Checkpoint> {
        self.checkpoint.take()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn read_magic(&mut self, expected: u32) -> Result<()> {
        let mut word = [0u8; 4];
        match self.fill(&mut word)? {
            Fill::Full => {}
            Fill::Empty => return Err(Error::malformed("empty stream, expected magic")),
        }
        let magic = u32::from_le_bytes(word);
        if magic != expected {
            return Err(Error::malformed(format!(
                "wrong magic {magic:#010x}, expected {expected:#010x}"
            )));
        }
        Ok(())
    }

    /// Reads the next message; end of stream is an error.
    pub fn read_message<M: DeserializeOwned>(&mut self) -> Result<M> {
        self.try_read_message()?
            .ok_or_else(|| Error::malformed("unexpected end of stream"))
    }

    /// Reads the next message, or `None` on a clean end of stream at a frame
    /// boundary.
    pub fn try_read_message<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        let mut word = [0u8; 4];
        match self.fill(&mut word)? {
            Fill::Full => {}
            Fill::Empty => return Ok(None),
        }
        let len = u64::from(u32::from_le_bytes(word));

        self.scratch.clear();
        let got = (&mut self.reader)
            .take(len)
            .read_to_end(&mut self.scratch)
            .map_err(stream_error)?;
        if got as u64 != len {
            return Err(Error::malformed(format!(
                "truncated frame: expected {len} bytes, got {got}"
            )));
        }
        self.offset += 4 + len;

        let msg = bincode::deserialize(&self.scratch)?;
        if self.want_save {
            self.want_save = false;
            self.checkpoint = Some(Checkpoint {
                offset: self.offset,
            });
        }
        Ok(Some(msg))
    }

    /// Fills `buf` completely, or reports that the stream ended before its
    /// first byte. A partial fill is a truncation.
    fn fill(&mut self, buf: &mut [u8]) -> Result<Fill> {
        let mut read = 0;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(stream_error(e)),
            }
        }
        self.offset += read as u64;
        match read {
            0 => Ok(Fill::Empty),
            n if n == buf.len() => Ok(Fill::Full),
            n => Err(Error::malformed(format!(
                "truncated length prefix: {n} of {} bytes",
                buf.len()
            ))),
        }
    }

    /// Discards `count` bytes of the stream; used to replay up to a checkpoint.
    pub(crate) fn skip(&mut self, count: u64) -> Result<()> {
        let skipped =
            io::copy(&mut (&mut self.reader).take(count), &mut io::sink()).map_err(stream_error)?;
        self.offset += skipped;
        if skipped != count {
            return Err(Error::malformed(format!(
                "checkpoint lies past end of stream ({skipped} of {count} bytes replayed)"
            )));
        }
        Ok(())
    }
}

/// Undecodable or cut-short bytes are malformed input, not a failed read.
fn stream_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            Error::malformed(format!("undecodable stream: {err}"))
        }
        _ => Error::Io(err),
    }
}
