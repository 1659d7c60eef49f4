use std::io::{self, Write};

use crate::bowl::{Bowl, BowlCheckpoint, EntryWriter, Transposition, WriterCheckpoint};
use crate::container::Container;
use crate::error::{Error, Result};

/// Checks indices and discards every byte. Applying a patch into a dry bowl
/// verifies that the patch decodes against its target.
pub struct DryBowl {
    target: Container,
    source: Container,
}

impl DryBowl {
    pub fn new(target: Container, source: Container) -> Self {
        Self { target, source }
    }
}

struct DryWriter {
    written: u64,
}

impl Write for DryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl EntryWriter for DryWriter {
    fn tell(&self) -> u64 {
        self.written
    }

    fn save(&mut self) -> Result<WriterCheckpoint> {
        Ok(WriterCheckpoint {
            offset: self.written,
        })
    }

    fn resume(&mut self, checkpoint: &WriterCheckpoint) -> Result<()> {
        self.written = checkpoint.offset;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Bowl for DryBowl {
    fn get_writer(&mut self, index: usize) -> Result<Box<dyn EntryWriter>> {
        self.source.file(index)?;
        Ok(Box::new(DryWriter { written: 0 }))
    }

    fn transpose(&mut self, t: Transposition) -> Result<()> {
        let target = self.target.file(t.target_index)?;
        let source = self.source.file(t.source_index)?;
        if target.size != source.size {
            return Err(Error::malformed(format!(
                "transposing {} ({} bytes) onto {} ({} bytes)",
                target.path, target.size, source.path, source.size
            )));
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn save(&self) -> Result<BowlCheckpoint> {
        Ok(BowlCheckpoint::Dry)
    }

    fn resume(&mut self, _checkpoint: &BowlCheckpoint) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FileEntry;
    use crate::error::ErrorKind;

    fn container(sizes: &[u64]) -> Container {
        let mut c = Container::default();
        for (i, &size) in sizes.iter().enumerate() {
            c.files.push(FileEntry {
                path: format!("f{i}"),
                mode: 0o644,
                size,
                offset: c.size,
            });
            c.size += size;
        }
        c
    }

    #[test]
    fn counts_and_discards() {
        let mut bowl = DryBowl::new(container(&[3]), container(&[5]));
        let mut writer = bowl.get_writer(0).unwrap();
        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.tell(), 5);
        writer.finalize().unwrap();
        bowl.commit().unwrap();
    }

    #[test]
    fn rejects_bad_indices() {
        let mut bowl = DryBowl::new(container(&[3]), container(&[3, 4]));
        assert_eq!(bowl.get_writer(2).err().unwrap().kind(), ErrorKind::Malformed);
        bowl.transpose(Transposition {
            target_index: 0,
            source_index: 0,
        })
        .unwrap();
        let err = bowl
            .transpose(Transposition {
                target_index: 0,
                source_index: 1,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        let err = bowl
            .transpose(Transposition {
                target_index: 7,
                source_index: 0,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
