//! Forward-only column cursors that hint large files out of the page cache once consumed.

use crate::block::{decode_block, Block, BlockDescriptor, ColumnSource, DataRange};
use crate::error::PartError;
use crate::fadvis::Fadvis;
use crate::fs::Reader;
use crate::part::{Part, INDEX_DIRNAME};
use crate::telemetry::PartEvent;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files directly under an `idx/` directory belong to the index subsystem.
fn in_index_dir(path: &Path) -> bool {
    path.parent()
        .and_then(Path::file_name)
        .is_some_and(|n| n == INDEX_DIRNAME)
}

/// Sequential cursor over one column stream.
///
/// Whether the file is large is decided once, at open. Dropping a reader over a large
/// file applies the cache hint to it.
pub struct SeqReader {
    reader: Arc<dyn Reader>,
    cursor: Box<dyn Read + Send>,
    bytes_read: u64,
    file_size: u64,
    is_large: bool,
    fadvis: Fadvis,
}

impl fmt::Debug for SeqReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqReader")
            .field("path", &self.reader.path())
            .field("bytes_read", &self.bytes_read)
            .field("file_size", &self.file_size)
            .field("is_large", &self.is_large)
            .finish()
    }
}

impl SeqReader {
    pub fn open(reader: Arc<dyn Reader>, fadvis: &Fadvis) -> Result<Self, PartError> {
        let cursor = reader.sequential_read()?;
        let mut sr = Self {
            reader,
            cursor,
            bytes_read: 0,
            file_size: 0,
            is_large: false,
            fadvis: fadvis.clone(),
        };

        let Some(file) = sr.reader.file_path().map(Path::to_path_buf) else {
            return Ok(sr);
        };
        if in_index_dir(&file) {
            return Ok(sr);
        }
        // Size is best effort; an unreadable size just disables hinting.
        if let Ok(size) = sr.reader.size() {
            sr.file_size = size;
            sr.is_large = fadvis.is_large(size);
        }
        if sr.is_large {
            fadvis.events().on_event(PartEvent::LargeFileDetected {
                path: file.clone(),
                size: sr.file_size,
                threshold: fadvis.get_threshold(),
            });
            fadvis.apply_sequential(&file);
        }
        Ok(sr)
    }

    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_large(&self) -> bool {
        self.is_large
    }

    /// Fills `buf` completely; a short stream is corruption.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<(), PartError> {
        match self.cursor.read_exact(buf) {
            Ok(()) => {
                self.bytes_read += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(PartError::corruption(
                self.reader.path(),
                format!(
                    "Stream ended at {} while reading {} bytes",
                    self.bytes_read,
                    buf.len()
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads `r`, skipping forward if needed. Ranges must be requested in ascending order.
    pub fn read_range(&mut self, r: DataRange) -> Result<Vec<u8>, PartError> {
        if r.offset < self.bytes_read {
            return Err(PartError::Internal(format!(
                "Sequential reader for {:?} is at {}, cannot seek back to {}",
                self.reader.path(),
                self.bytes_read,
                r.offset
            )));
        }
        let gap = r.offset - self.bytes_read;
        if gap > 0 {
            let skipped = io::copy(&mut (&mut self.cursor).take(gap), &mut io::sink())?;
            self.bytes_read += skipped;
            if skipped != gap {
                return Err(PartError::corruption(
                    self.reader.path(),
                    format!("Stream ended at {} before offset {}", self.bytes_read, r.offset),
                ));
            }
        }
        let len = usize::try_from(r.size).map_err(|_| {
            PartError::corruption(self.reader.path(), format!("Range size {} too large", r.size))
        })?;
        let mut buf = vec![0u8; len];
        self.read_full(&mut buf)?;
        Ok(buf)
    }
}

impl Drop for SeqReader {
    fn drop(&mut self) {
        if !self.is_large {
            return;
        }
        if let Some(file) = self.reader.file_path() {
            self.fadvis.apply(file);
        }
    }
}

/// One [`SeqReader`] per column of a part, used to load blocks in file order.
#[derive(Debug)]
pub struct SeqReaders {
    path: PathBuf,
    primary: SeqReader,
    timestamps: SeqReader,
    tag_families: BTreeMap<String, SeqReader>,
    tag_family_metadata: BTreeMap<String, SeqReader>,
}

impl SeqReaders {
    pub fn open(part: &Part, fadvis: &Fadvis) -> Result<Self, PartError> {
        let mut tag_families = BTreeMap::new();
        for (name, r) in part.tag_families() {
            tag_families.insert(name.clone(), SeqReader::open(Arc::clone(r), fadvis)?);
        }
        let mut tag_family_metadata = BTreeMap::new();
        for (name, r) in part.tag_family_metadata() {
            tag_family_metadata.insert(name.clone(), SeqReader::open(Arc::clone(r), fadvis)?);
        }
        Ok(Self {
            path: part.path().map(Path::to_path_buf).unwrap_or_default(),
            primary: SeqReader::open(Arc::clone(part.primary()), fadvis)?,
            timestamps: SeqReader::open(Arc::clone(part.timestamps()), fadvis)?,
            tag_families,
            tag_family_metadata,
        })
    }

    /// Decodes the block at `desc`. Blocks must be loaded in descriptor order.
    pub fn load_block(&mut self, desc: &BlockDescriptor) -> Result<Block, PartError> {
        decode_block(self, desc)
    }

    fn family<'a>(
        readers: &'a mut BTreeMap<String, SeqReader>,
        family: &str,
        path: &Path,
    ) -> Result<&'a mut SeqReader, PartError> {
        readers.get_mut(family).ok_or_else(|| {
            PartError::corruption(path, format!("Block references unknown tag family {}", family))
        })
    }
}

impl ColumnSource for SeqReaders {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_primary(&mut self, r: DataRange) -> Result<Vec<u8>, PartError> {
        self.primary.read_range(r)
    }

    fn read_timestamps(&mut self, r: DataRange) -> Result<Vec<u8>, PartError> {
        self.timestamps.read_range(r)
    }

    fn read_tag_family_metadata(
        &mut self,
        family: &str,
        r: DataRange,
    ) -> Result<Vec<u8>, PartError> {
        Self::family(&mut self.tag_family_metadata, family, &self.path)?.read_range(r)
    }

    fn read_tag_family(&mut self, family: &str, r: DataRange) -> Result<Vec<u8>, PartError> {
        Self::family(&mut self.tag_families, family, &self.path)?.read_range(r)
    }
}
