//! Parts: the immutable unit of storage, in memory ([`MemPart`]) or on disk ([`Part`]).

use crate::block::{
    check_range, decode_block, decode_block_descriptors, Block, BlockDescriptor, BlockWriter,
    ColumnSource, DataRange,
};
use crate::error::PartError;
use crate::fadvis::Fadvis;
use crate::fs::{FileSystem, Reader};
use crate::pool::Reset;
use crate::types::Elements;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const METADATA_FILENAME: &str = "metadata.json";
pub const META_FILENAME: &str = "meta.bin";
pub const PRIMARY_FILENAME: &str = "primary.bin";
pub const TIMESTAMPS_FILENAME: &str = "timestamps.bin";
/// Subdirectory owned by the index subsystem.
pub const INDEX_DIRNAME: &str = "idx";
pub const TAG_FAMILIES_FILENAME_EXT: &str = ".tf";
pub const TAG_FAMILIES_METADATA_FILENAME_EXT: &str = ".tfm";

/// Directory name of part `id`: 16 zero-padded lowercase hex digits.
pub fn part_name(id: u64) -> String {
    format!("{:016x}", id)
}

pub fn part_path(root: &Path, id: u64) -> PathBuf {
    root.join(part_name(id))
}

/// Inverse of [`part_name`]. Anything else yields `None`.
pub fn parse_part_name(name: &str) -> Option<u64> {
    if name.len() != 16
        || !name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Identity and summary statistics of a part (`metadata.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetadata {
    pub id: u64,
    pub compressed_size_bytes: u64,
    pub uncompressed_size_bytes: u64,
    pub total_count: u64,
    pub blocks_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl PartMetadata {
    fn validate(&self, path: &Path) -> Result<(), PartError> {
        if self.total_count > 0 && self.min_timestamp > self.max_timestamp {
            return Err(PartError::corruption(
                path,
                format!(
                    "min_timestamp {} exceeds max_timestamp {}",
                    self.min_timestamp, self.max_timestamp
                ),
            ));
        }
        if self.blocks_count > self.total_count {
            return Err(PartError::corruption(
                path,
                format!(
                    "blocks_count {} exceeds total_count {}",
                    self.blocks_count, self.total_count
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for PartMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id={} blocks={} rows={} ts=[{}, {}] bytes={}/{}}}",
            self.id,
            self.blocks_count,
            self.total_count,
            self.min_timestamp,
            self.max_timestamp,
            self.compressed_size_bytes,
            self.uncompressed_size_bytes
        )
    }
}

/// Lays out already sorted rows as blocks.
///
/// A block ends at every series change, and before any row that would push its
/// uncompressed size past `max_block_size`. A single oversized row still gets a block.
pub(crate) fn write_sorted_elements(
    bw: &mut BlockWriter<'_>,
    es: &Elements,
    max_block_size: u64,
) -> Result<(), PartError> {
    if es.is_empty() {
        return Ok(());
    }
    let mut start = 0usize;
    let mut block_size = 0u64;
    for i in 0..es.len() {
        let row_size = es.uncompressed_size(i);
        if i > start
            && (es.series_ids[i] != es.series_ids[start]
                || block_size.saturating_add(row_size) > max_block_size)
        {
            bw.write_elements(
                es.series_ids[start],
                &es.timestamps[start..i],
                &es.element_ids[start..i],
                &es.tag_families[start..i],
                block_size,
            )?;
            start = i;
            block_size = 0;
        }
        block_size += row_size;
    }
    bw.write_elements(
        es.series_ids[start],
        &es.timestamps[start..],
        &es.element_ids[start..],
        &es.tag_families[start..],
        block_size,
    )
}

/// In-memory builder output: every column stream as a growable buffer.
#[derive(Debug, Default)]
pub struct MemPart {
    pub(crate) meta: Vec<u8>,
    pub(crate) primary: Vec<u8>,
    pub(crate) timestamps: Vec<u8>,
    pub(crate) tag_families: BTreeMap<String, Vec<u8>>,
    pub(crate) tag_family_metadata: BTreeMap<String, Vec<u8>>,
    pub(crate) part_metadata: PartMetadata,
}

impl Reset for MemPart {
    fn reset(&mut self) {
        self.meta.clear();
        self.primary.clear();
        self.timestamps.clear();
        self.tag_families.clear();
        self.tag_family_metadata.clear();
        self.part_metadata = PartMetadata::default();
    }
}

impl MemPart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> &PartMetadata {
        &self.part_metadata
    }

    pub fn set_id(&mut self, id: u64) {
        self.part_metadata.id = id;
    }

    /// True when the part holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.part_metadata.blocks_count == 0
    }

    /// Sorts `es` by (series id, timestamp) and lays it out as blocks. A block ends at
    /// every series change and before any row that would push it past `max_block_size`.
    pub fn init_from_elements(
        &mut self,
        es: &mut Elements,
        max_block_size: u64,
    ) -> Result<(), PartError> {
        self.reset();
        if es.is_empty() {
            return Ok(());
        }
        es.sort();

        let mut bw = BlockWriter::new(self);
        write_sorted_elements(&mut bw, es, max_block_size)?;
        bw.flush()?;
        Ok(())
    }

    /// Column files as (file name, contents), excluding `metadata.json`.
    pub fn files(&self) -> Vec<(String, &[u8])> {
        let mut out: Vec<(String, &[u8])> = vec![
            (META_FILENAME.to_string(), self.meta.as_slice()),
            (PRIMARY_FILENAME.to_string(), self.primary.as_slice()),
            (TIMESTAMPS_FILENAME.to_string(), self.timestamps.as_slice()),
        ];
        for (name, data) in &self.tag_families {
            out.push((format!("{}{}", name, TAG_FAMILIES_FILENAME_EXT), data.as_slice()));
        }
        for (name, data) in &self.tag_family_metadata {
            out.push((format!("{}{}", name, TAG_FAMILIES_METADATA_FILENAME_EXT), data.as_slice()));
        }
        out
    }

    /// Writes the part under `path` (which must not exist) and syncs it.
    ///
    /// Column files larger than the threshold are hinted out of the page cache afterwards.
    /// A directory named [`INDEX_DIRNAME`] is created but left to the index subsystem.
    /// An empty mem part writes nothing.
    pub fn flush(&self, fs: &dyn FileSystem, path: &Path, fadvis: &Fadvis) -> Result<(), PartError> {
        if self.is_empty() {
            return Ok(());
        }
        fs.mkdir_exclusive(path)?;
        if path.file_name().is_some_and(|n| n == INDEX_DIRNAME) {
            return Ok(());
        }

        for (name, data) in self.files() {
            fs.write_file(data, &path.join(name))?;
        }
        let metadata = serde_json::to_vec_pretty(&self.part_metadata)?;
        fs.write_file(&metadata, &path.join(METADATA_FILENAME))?;

        fs.sync_path(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs.sync_path(parent)?;
            }
        }

        fadvis.apply_if_large(&path.join(PRIMARY_FILENAME));
        fadvis.apply_if_large(&path.join(TIMESTAMPS_FILENAME));
        for name in self.tag_families.keys() {
            fadvis.apply_if_large(&path.join(format!("{}{}", name, TAG_FAMILIES_FILENAME_EXT)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MemColumn {
    Primary,
    Timestamps,
    TagFamily(String),
    TagFamilyMetadata(String),
}

/// Shared view of one [`MemPart`] column.
#[derive(Debug, Clone)]
struct MemBytes {
    mp: Arc<MemPart>,
    column: MemColumn,
}

impl AsRef<[u8]> for MemBytes {
    fn as_ref(&self) -> &[u8] {
        match &self.column {
            MemColumn::Primary => self.mp.primary.as_slice(),
            MemColumn::Timestamps => self.mp.timestamps.as_slice(),
            MemColumn::TagFamily(name) => self
                .mp
                .tag_families
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            MemColumn::TagFamilyMetadata(name) => self
                .mp
                .tag_family_metadata
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }
}

/// Memory-backed [`Reader`].
#[derive(Debug)]
struct MemReader {
    bytes: MemBytes,
    path: PathBuf,
}

impl MemReader {
    fn new(mp: &Arc<MemPart>, column: MemColumn, name: String) -> Arc<dyn Reader> {
        Arc::new(Self {
            bytes: MemBytes {
                mp: Arc::clone(mp),
                column,
            },
            path: PathBuf::from(name),
        })
    }
}

impl Reader for MemReader {
    fn path(&self) -> &Path {
        &self.path
    }

    fn file_path(&self) -> Option<&Path> {
        None
    }

    fn size(&self) -> Result<u64, PartError> {
        Ok(self.bytes.as_ref().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), PartError> {
        let data = self.bytes.as_ref();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start
            .checked_add(buf.len())
            .and_then(|end| data.get(start..end))
        {
            Some(src) => {
                buf.copy_from_slice(src);
                Ok(())
            }
            None => Err(PartError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {} bytes at {} past end of {:?} ({} bytes)",
                    buf.len(),
                    offset,
                    self.path,
                    data.len()
                ),
            ))),
        }
    }

    fn sequential_read(&self) -> Result<Box<dyn Read + Send>, PartError> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }
}

/// A readable part: metadata, block descriptors and one stream per column.
///
/// Never mutated after open. File-backed streams open lazily; opening reads only
/// `metadata.json` and `meta.bin`.
#[derive(Debug)]
pub struct Part {
    metadata: PartMetadata,
    descriptors: Vec<BlockDescriptor>,
    primary: Arc<dyn Reader>,
    timestamps: Arc<dyn Reader>,
    tag_families: BTreeMap<String, Arc<dyn Reader>>,
    tag_family_metadata: BTreeMap<String, Arc<dyn Reader>>,
    path: Option<PathBuf>,
    fs: Option<Arc<dyn FileSystem>>,
}

impl Part {
    /// Wraps a built mem part without copying its buffers.
    pub fn open_mem(mp: Arc<MemPart>) -> Result<Self, PartError> {
        let descriptors = decode_block_descriptors(&mp.meta, Path::new(META_FILENAME))?;
        let mut tag_families = BTreeMap::new();
        let mut tag_family_metadata = BTreeMap::new();
        for name in mp.tag_families.keys() {
            tag_families.insert(
                name.clone(),
                MemReader::new(
                    &mp,
                    MemColumn::TagFamily(name.clone()),
                    format!("{}{}", name, TAG_FAMILIES_FILENAME_EXT),
                ),
            );
        }
        for name in mp.tag_family_metadata.keys() {
            tag_family_metadata.insert(
                name.clone(),
                MemReader::new(
                    &mp,
                    MemColumn::TagFamilyMetadata(name.clone()),
                    format!("{}{}", name, TAG_FAMILIES_METADATA_FILENAME_EXT),
                ),
            );
        }
        Ok(Self {
            metadata: mp.part_metadata.clone(),
            descriptors,
            primary: MemReader::new(&mp, MemColumn::Primary, PRIMARY_FILENAME.to_string()),
            timestamps: MemReader::new(&mp, MemColumn::Timestamps, TIMESTAMPS_FILENAME.to_string()),
            tag_families,
            tag_family_metadata,
            path: None,
            fs: None,
        })
    }

    /// Opens part `id` under `root`.
    ///
    /// Unreadable or inconsistent metadata, descriptors, or a missing column file is reported
    /// as an error and the part must not be used.
    pub fn open_file(id: u64, root: &Path, fs: Arc<dyn FileSystem>) -> Result<Self, PartError> {
        let path = part_path(root, id);

        let metadata_path = path.join(METADATA_FILENAME);
        let raw = fs.read_file(&metadata_path)?;
        let mut metadata: PartMetadata = serde_json::from_slice(&raw).map_err(|e| {
            PartError::corruption(&metadata_path, format!("Malformed part metadata: {}", e))
        })?;
        metadata.validate(&metadata_path)?;
        metadata.id = id;

        let meta_path = path.join(META_FILENAME);
        let descriptors = decode_block_descriptors(&fs.read_file(&meta_path)?, &meta_path)?;
        if descriptors.len() as u64 != metadata.blocks_count
            || descriptors.iter().map(|d| d.count).sum::<u64>() != metadata.total_count
        {
            return Err(PartError::corruption(
                &meta_path,
                format!(
                    "{} descriptors disagree with metadata {}",
                    descriptors.len(),
                    metadata
                ),
            ));
        }

        let primary = fs.open_file(&path.join(PRIMARY_FILENAME))?;
        let timestamps = fs.open_file(&path.join(TIMESTAMPS_FILENAME))?;
        let primary_len = primary.size()?;
        let timestamps_len = timestamps.size()?;
        for d in &descriptors {
            check_range(d.primary, primary_len, primary.path())?;
            check_range(d.timestamps, timestamps_len, timestamps.path())?;
        }

        let mut tag_families = BTreeMap::new();
        let mut tag_family_metadata = BTreeMap::new();
        for entry in fs.read_dir(&path)? {
            if entry.is_dir {
                continue;
            }
            if let Some(name) = entry.name.strip_suffix(TAG_FAMILIES_METADATA_FILENAME_EXT) {
                tag_family_metadata.insert(name.to_string(), fs.open_file(&path.join(&entry.name))?);
            } else if let Some(name) = entry.name.strip_suffix(TAG_FAMILIES_FILENAME_EXT) {
                tag_families.insert(name.to_string(), fs.open_file(&path.join(&entry.name))?);
            }
        }
        if let Some(name) = tag_families
            .keys()
            .find(|n| !tag_family_metadata.contains_key(*n))
            .or_else(|| {
                tag_family_metadata
                    .keys()
                    .find(|n| !tag_families.contains_key(*n))
            })
        {
            return Err(PartError::corruption(
                &path,
                format!("Tag family {} is missing its data or metadata file", name),
            ));
        }

        Ok(Self {
            metadata,
            descriptors,
            primary,
            timestamps,
            tag_families,
            tag_family_metadata,
            path: Some(path),
            fs: Some(fs),
        })
    }

    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    pub fn metadata(&self) -> &PartMetadata {
        &self.metadata
    }

    pub fn descriptors(&self) -> &[BlockDescriptor] {
        &self.descriptors
    }

    /// Directory of a file-backed part; `None` for memory-backed parts.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn file_system(&self) -> Option<&Arc<dyn FileSystem>> {
        self.fs.as_ref()
    }

    pub fn tag_family_names(&self) -> impl Iterator<Item = &str> {
        self.tag_families.keys().map(String::as_str)
    }

    pub(crate) fn primary(&self) -> &Arc<dyn Reader> {
        &self.primary
    }

    pub(crate) fn timestamps(&self) -> &Arc<dyn Reader> {
        &self.timestamps
    }

    pub(crate) fn tag_families(&self) -> &BTreeMap<String, Arc<dyn Reader>> {
        &self.tag_families
    }

    pub(crate) fn tag_family_metadata(&self) -> &BTreeMap<String, Arc<dyn Reader>> {
        &self.tag_family_metadata
    }

    /// Decodes one block with random-access reads.
    pub fn load_block(&self, desc: &BlockDescriptor) -> Result<Block, PartError> {
        decode_block(&mut RandomAccess(self), desc)
    }

    /// Releases every open stream handle.
    pub fn close(&self) {
        self.primary.close();
        self.timestamps.close();
        for r in self.tag_families.values() {
            r.close();
        }
        for r in self.tag_family_metadata.values() {
            r.close();
        }
    }

    /// Re-syncs the directory of a file part and hints its large column files.
    /// No-op for memory-backed parts.
    pub fn sync(&self, fadvis: &Fadvis) -> Result<(), PartError> {
        let (Some(path), Some(fs)) = (&self.path, &self.fs) else {
            return Ok(());
        };
        fs.mkdir_if_not_exist(path)?;
        fs.sync_path(path)?;
        fadvis.apply_if_large(&path.join(PRIMARY_FILENAME));
        fadvis.apply_if_large(&path.join(TIMESTAMPS_FILENAME));
        for name in self.tag_families.keys() {
            fadvis.apply_if_large(&path.join(format!("{}{}", name, TAG_FAMILIES_FILENAME_EXT)));
        }
        Ok(())
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part {}", self.metadata.id)
    }
}

fn read_range(reader: &dyn Reader, r: DataRange) -> Result<Vec<u8>, PartError> {
    let len = usize::try_from(r.size)
        .map_err(|_| PartError::corruption(reader.path(), format!("Range size {} too large", r.size)))?;
    let mut buf = vec![0u8; len];
    reader.read_at(r.offset, &mut buf).map_err(|e| match e {
        PartError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            PartError::corruption(reader.path(), io.to_string())
        }
        other => other,
    })?;
    Ok(buf)
}

struct RandomAccess<'a>(&'a Part);

impl RandomAccess<'_> {
    fn family<'m>(
        map: &'m BTreeMap<String, Arc<dyn Reader>>,
        family: &str,
        part: &Part,
    ) -> Result<&'m Arc<dyn Reader>, PartError> {
        map.get(family).ok_or_else(|| {
            PartError::corruption(
                part.path().unwrap_or(Path::new("")),
                format!("Block references unknown tag family {}", family),
            )
        })
    }
}

impl ColumnSource for RandomAccess<'_> {
    fn path(&self) -> &Path {
        self.0.path().unwrap_or(Path::new(""))
    }

    fn read_primary(&mut self, r: DataRange) -> Result<Vec<u8>, PartError> {
        read_range(self.0.primary.as_ref(), r)
    }

    fn read_timestamps(&mut self, r: DataRange) -> Result<Vec<u8>, PartError> {
        read_range(self.0.timestamps.as_ref(), r)
    }

    fn read_tag_family_metadata(
        &mut self,
        family: &str,
        r: DataRange,
    ) -> Result<Vec<u8>, PartError> {
        let reader = Self::family(&self.0.tag_family_metadata, family, self.0)?;
        read_range(reader.as_ref(), r)
    }

    fn read_tag_family(&mut self, family: &str, r: DataRange) -> Result<Vec<u8>, PartError> {
        let reader = Self::family(&self.0.tag_families, family, self.0)?;
        read_range(reader.as_ref(), r)
    }
}
