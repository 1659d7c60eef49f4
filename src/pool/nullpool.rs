use std::io::{self, Write};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::pool::{Pool, ReadSeek};

/// Pool whose writers discard everything. Has no readable contents.
pub struct NullPool {
    container: Container,
}

impl NullPool {
    pub fn new(container: Container) -> Self {
        Self { container }
    }
}

impl Pool for NullPool {
    fn len(&self) -> usize {
        self.container.files.len()
    }

    fn size(&self, index: usize) -> u64 {
        self.container.files.get(index).map_or(0, |f| f.size)
    }

    fn reader(&mut self, index: usize) -> Result<&mut dyn ReadSeek> {
        Err(Error::not_found(format!("null pool holds no data (file {index})")))
    }

    fn writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        self.container.file(index)?;
        Ok(Box::new(io::sink()) as Box<dyn Write + Send>)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
