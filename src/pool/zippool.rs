use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use zip::result::ZipError;
use zip::ZipArchive;

use crate::container::Container;
use crate::error::{Error, Result, ResultExt};
use crate::pool::{Pool, ReadSeek};

/// Read-only pool over a zip archive whose entries are named by container path.
///
/// Zip entries cannot seek, so the current entry is inflated into memory.
pub struct ZipPool<R: Read + Seek + Send> {
    container: Container,
    archive: ZipArchive<R>,
    entries: HashMap<String, usize>,
    current: Option<(usize, Cursor<Vec<u8>>)>,
}

impl<R: Read + Seek + Send> ZipPool<R> {
    pub fn new(container: Container, reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader).with_context(|| "opening zip archive")?;
        let entries = archive
            .file_names()
            .filter_map(|name| {
                archive
                    .index_for_name(name)
                    .map(|i| (name.trim_start_matches("./").to_string(), i))
            })
            .collect::<HashMap<_, _>>();
        Ok(Self {
            container,
            archive,
            entries,
            current: None,
        })
    }
}

impl<R: Read + Seek + Send> Pool for ZipPool<R> {
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
            let path = self.container.file(index)?.path.clone();
            let zip_index = *self
                .entries
                .get(&path)
                .ok_or_else(|| Error::not_found(format!("{path} in zip archive")))?;
            let mut entry = match self.archive.by_index(zip_index) {
                Ok(entry) => entry,
                Err(ZipError::FileNotFound) => {
                    return Err(Error::not_found(format!("{path} in zip archive")))
                }
                Err(e) => return Err(Error::from(e).context(format!("reading {path} from zip"))),
            };
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("inflating {path} from zip"))?;
            drop(entry);
            self.current = Some((index, Cursor::new(data)));
        }

        match self.current.as_mut() {
            Some((_, cursor)) => {
                cursor.seek(SeekFrom::Start(0))?;
                Ok(cursor as &mut dyn ReadSeek)
            }
            None => Err(Error::not_found(format!("file {index}"))),
        }
    }

    fn writer(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("zip pool is read-only (file {index})"),
        )))
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}
