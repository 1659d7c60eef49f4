use std::io::Write;

use serde::Serialize;

use crate::error::{Error, Result};

/// Writes magics and length-prefixed messages to a sink.
pub struct WriteContext<W: Write> {
    writer: W,
    scratch: Vec<u8>,
    written: u64,
}

impl<W: Write> WriteContext<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: Vec::with_capacity(4096),
            written: 0,
        }
    }

    pub fn write_magic(&mut self, magic: u32) -> Result<()> {
        self.writer.write_all(&magic.to_le_bytes())?;
        self.written += 4;
        Ok(())
    }

    /// Frames `msg` as `u32 length | bincode bytes`.
    pub fn write_message<M: Serialize>(&mut self, msg: &M) -> Result<()> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, msg)?;
        let len = u32::try_from(self.scratch.len()).map_err(|_| {
            Error::malformed(format!("message of {} bytes exceeds frame limit", self.scratch.len()))
        })?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&self.scratch)?;
        self.written += 4 + u64::from(len);
        Ok(())
    }

    /// Bytes written through this context, before any compression below it.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
