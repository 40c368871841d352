//! Blocks: descriptors (`meta.bin`), per-block column records and the writer that lays them out.

use crate::encoding::{
    crc32, decode_tag_values, decode_timestamps, encode_tag_value, encode_timestamps, read_i64,
    read_u32, read_u64, write_i64, write_u32, write_u64,
};
use crate::error::PartError;
use crate::part::{MemPart, PartMetadata};
use crate::types::{Element, ElementId, Elements, SeriesId, Tag, TagFamily, TagValue, Timestamp};

use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;

const META_MAGIC: &[u8; 8] = b"PSTMETA1";
const META_VERSION: u32 = 1;
const DESCRIPTOR_LEN: usize = 8 * 8;

/// Default cap on a block's uncompressed size (2 MiB).
pub const DEFAULT_MAX_UNCOMPRESSED_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Byte range inside one column stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub offset: u64,
    pub size: u64,
}

impl DataRange {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// Per-block index entry. Within a part, descriptors are sorted by
/// (series id, min timestamp) and a block never spans two series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub series_id: SeriesId,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub count: u64,
    /// Block row metadata record in `primary.bin`.
    pub primary: DataRange,
    /// Timestamps + element ids in `timestamps.bin`.
    pub timestamps: DataRange,
}

impl BlockDescriptor {
    /// Merge/sort key.
    #[inline]
    pub fn key(&self) -> (SeriesId, Timestamp) {
        (self.series_id, self.min_timestamp)
    }
}

/// Record stored in `primary.bin` for each block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct BlockRowMetadata {
    pub tag_families: Vec<(String, DataRange)>,
}

/// Record stored in `<family>.tfm` for each block containing the family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagFamilyMetadata {
    pub tags: Vec<TagMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TagMetadata {
    pub name: String,
    pub data: DataRange,
}

/// One tag column within a block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagColumn {
    pub name: String,
    pub values: Vec<TagValue>,
}

/// One tag family's columns within a block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagFamilyColumns {
    pub name: String,
    pub tags: Vec<TagColumn>,
}

/// Decoded block payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub series_id: SeriesId,
    pub timestamps: Vec<Timestamp>,
    pub element_ids: Vec<ElementId>,
    pub tag_families: Vec<TagFamilyColumns>,
}

impl Block {
    /// Pivots rows into columns. Families and tags keep first-appearance order;
    /// rows missing a tag get [`TagValue::Null`].
    pub fn from_rows(
        series_id: SeriesId,
        timestamps: &[Timestamp],
        element_ids: &[ElementId],
        rows: &[Vec<TagFamily>],
    ) -> Self {
        let mut tag_families: Vec<TagFamilyColumns> = Vec::new();
        for row in rows {
            for tf in row {
                let fi = match tag_families.iter().position(|c| c.name == tf.name) {
                    Some(i) => i,
                    None => {
                        tag_families.push(TagFamilyColumns {
                            name: tf.name.clone(),
                            tags: Vec::new(),
                        });
                        tag_families.len() - 1
                    }
                };
                for tag in &tf.tags {
                    if !tag_families[fi].tags.iter().any(|c| c.name == tag.name) {
                        tag_families[fi].tags.push(TagColumn {
                            name: tag.name.clone(),
                            values: Vec::with_capacity(rows.len()),
                        });
                    }
                }
            }
        }

        for row in rows {
            for family in &mut tag_families {
                // Same-name entries in one row merge; the first value for a tag wins.
                for col in &mut family.tags {
                    let v = row
                        .iter()
                        .filter(|tf| tf.name == family.name)
                        .flat_map(|tf| tf.tags.iter())
                        .find(|t| t.name == col.name)
                        .map(|t| t.value.clone())
                        .unwrap_or(TagValue::Null);
                    col.values.push(v);
                }
            }
        }

        Self {
            series_id,
            timestamps: timestamps.to_vec(),
            element_ids: element_ids.to_vec(),
            tag_families,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Appends every row to `es`.
    pub fn append_to(&self, es: &mut Elements) {
        for i in 0..self.len() {
            es.push(self.row(i));
        }
    }

    /// Rebuilds row `i`. Null values are kept so rows round-trip through [`Block::from_rows`].
    pub fn row(&self, i: usize) -> Element {
        Element {
            series_id: self.series_id,
            timestamp: self.timestamps[i],
            element_id: self.element_ids[i],
            tag_families: self
                .tag_families
                .iter()
                .map(|f| TagFamily {
                    name: f.name.clone(),
                    tags: f
                        .tags
                        .iter()
                        .map(|c| Tag::new(c.name.clone(), c.values[i].clone()))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Lays out blocks into a [`MemPart`]'s column buffers.
pub(crate) struct BlockWriter<'a> {
    mp: &'a mut MemPart,
    descriptors: Vec<BlockDescriptor>,
    total_count: u64,
    uncompressed_size_bytes: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl<'a> BlockWriter<'a> {
    /// `mp` must be reset.
    pub fn new(mp: &'a mut MemPart) -> Self {
        Self {
            mp,
            descriptors: Vec::new(),
            total_count: 0,
            uncompressed_size_bytes: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
        }
    }

    pub fn write_elements(
        &mut self,
        series_id: SeriesId,
        timestamps: &[Timestamp],
        element_ids: &[ElementId],
        rows: &[Vec<TagFamily>],
        uncompressed_size_bytes: u64,
    ) -> Result<(), PartError> {
        let block = Block::from_rows(series_id, timestamps, element_ids, rows);
        self.write_block(&block, uncompressed_size_bytes)
    }

    pub fn write_block(
        &mut self,
        block: &Block,
        uncompressed_size_bytes: u64,
    ) -> Result<(), PartError> {
        if block.is_empty() {
            return Err(PartError::Internal(
                "Refusing to write an empty block".to_string(),
            ));
        }
        let min_ts = block.timestamps[0];
        let max_ts = block.timestamps[block.timestamps.len() - 1];
        if let Some(prev) = self.descriptors.last() {
            let ordered = prev.series_id < block.series_id
                || (prev.series_id == block.series_id && prev.max_timestamp <= min_ts);
            if !ordered {
                return Err(PartError::Internal(format!(
                    "Block (series={}, min_ts={}) written after (series={}, max_ts={})",
                    block.series_id, min_ts, prev.series_id, prev.max_timestamp
                )));
            }
        }

        let ts_offset = self.mp.timestamps.len() as u64;
        encode_timestamps(&block.timestamps, &block.element_ids, &mut self.mp.timestamps)?;
        let timestamps = DataRange {
            offset: ts_offset,
            size: self.mp.timestamps.len() as u64 - ts_offset,
        };

        let mut row_meta = BlockRowMetadata::default();
        for family in &block.tag_families {
            let mut tfm = TagFamilyMetadata::default();
            {
                let data = self
                    .mp
                    .tag_families
                    .entry(family.name.clone())
                    .or_default();
                for col in &family.tags {
                    if col.values.len() != block.len() {
                        return Err(PartError::Internal(format!(
                            "Tag column {}.{} has {} values, block has {} rows",
                            family.name,
                            col.name,
                            col.values.len(),
                            block.len()
                        )));
                    }
                    let offset = data.len() as u64;
                    for v in &col.values {
                        encode_tag_value(v, data);
                    }
                    tfm.tags.push(TagMetadata {
                        name: col.name.clone(),
                        data: DataRange {
                            offset,
                            size: data.len() as u64 - offset,
                        },
                    });
                }
            }
            let meta = self
                .mp
                .tag_family_metadata
                .entry(family.name.clone())
                .or_default();
            let offset = meta.len() as u64;
            bincode::serialize_into(&mut *meta, &tfm)?;
            row_meta.tag_families.push((
                family.name.clone(),
                DataRange {
                    offset,
                    size: meta.len() as u64 - offset,
                },
            ));
        }

        let primary_offset = self.mp.primary.len() as u64;
        bincode::serialize_into(&mut self.mp.primary, &row_meta)?;
        let primary = DataRange {
            offset: primary_offset,
            size: self.mp.primary.len() as u64 - primary_offset,
        };

        self.descriptors.push(BlockDescriptor {
            series_id: block.series_id,
            min_timestamp: min_ts,
            max_timestamp: max_ts,
            count: block.len() as u64,
            primary,
            timestamps,
        });
        self.total_count += block.len() as u64;
        self.uncompressed_size_bytes += uncompressed_size_bytes;
        self.min_timestamp = self.min_timestamp.min(min_ts);
        self.max_timestamp = self.max_timestamp.max(max_ts);
        Ok(())
    }

    /// Writes the descriptor array to `meta.bin` and records the part summary.
    pub fn flush(self) -> Result<PartMetadata, PartError> {
        encode_block_descriptors(&self.descriptors, &mut self.mp.meta)?;
        let mp = self.mp;
        let compressed = mp.meta.len()
            + mp.primary.len()
            + mp.timestamps.len()
            + mp.tag_families.values().map(Vec::len).sum::<usize>()
            + mp.tag_family_metadata.values().map(Vec::len).sum::<usize>();
        let pm = PartMetadata {
            id: mp.part_metadata.id,
            compressed_size_bytes: compressed as u64,
            uncompressed_size_bytes: self.uncompressed_size_bytes,
            total_count: self.total_count,
            blocks_count: self.descriptors.len() as u64,
            min_timestamp: if self.descriptors.is_empty() {
                0
            } else {
                self.min_timestamp
            },
            max_timestamp: if self.descriptors.is_empty() {
                0
            } else {
                self.max_timestamp
            },
        };
        mp.part_metadata = pm.clone();
        Ok(pm)
    }
}

/// The meta.bin header stores the descriptor count as a u32.
fn descriptor_count(len: usize) -> Result<u32, PartError> {
    u32::try_from(len).map_err(|_| {
        PartError::Internal(format!(
            "{} block descriptors exceed the meta.bin count field",
            len
        ))
    })
}

pub(crate) fn encode_block_descriptors(
    descriptors: &[BlockDescriptor],
    out: &mut Vec<u8>,
) -> Result<(), PartError> {
    if descriptors.is_empty() {
        return Ok(());
    }
    let count = descriptor_count(descriptors.len())?;
    let mut entries = Vec::with_capacity(descriptors.len() * DESCRIPTOR_LEN);
    for d in descriptors {
        write_u64(&mut entries, d.series_id);
        write_i64(&mut entries, d.min_timestamp);
        write_i64(&mut entries, d.max_timestamp);
        write_u64(&mut entries, d.count);
        write_u64(&mut entries, d.primary.offset);
        write_u64(&mut entries, d.primary.size);
        write_u64(&mut entries, d.timestamps.offset);
        write_u64(&mut entries, d.timestamps.size);
    }
    out.extend_from_slice(META_MAGIC);
    write_u32(out, META_VERSION);
    write_u32(out, count);
    out.extend_from_slice(&entries);
    write_u32(out, crc32(&entries));
    Ok(())
}

/// Decodes `meta.bin`. An empty buffer is a part without blocks.
pub(crate) fn decode_block_descriptors(
    bytes: &[u8],
    path: &Path,
) -> Result<Vec<BlockDescriptor>, PartError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let header_len = META_MAGIC.len() + 4 + 4;
    if bytes.len() < header_len + 4 {
        return Err(PartError::corruption(path, "Truncated block metadata"));
    }
    if &bytes[..8] != META_MAGIC {
        return Err(PartError::corruption(path, "Bad block metadata magic"));
    }
    let mut cur = Cursor::new(&bytes[8..header_len]);
    let version = read_u32(&mut cur)?;
    if version != META_VERSION {
        return Err(PartError::corruption(
            path,
            format!("Unsupported block metadata version {}", version),
        ));
    }
    let count = read_u32(&mut cur)? as usize;
    let expected = header_len + count * DESCRIPTOR_LEN + 4;
    if bytes.len() != expected {
        return Err(PartError::corruption(
            path,
            format!(
                "Block metadata length {} does not match {} descriptors",
                bytes.len(),
                count
            ),
        ));
    }
    let entries = &bytes[header_len..expected - 4];
    let mut crc_cur = Cursor::new(&bytes[expected - 4..]);
    if crc32(entries) != read_u32(&mut crc_cur)? {
        return Err(PartError::corruption(path, "Block metadata CRC mismatch"));
    }

    let mut cur = Cursor::new(entries);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(BlockDescriptor {
            series_id: read_u64(&mut cur)?,
            min_timestamp: read_i64(&mut cur)?,
            max_timestamp: read_i64(&mut cur)?,
            count: read_u64(&mut cur)?,
            primary: DataRange {
                offset: read_u64(&mut cur)?,
                size: read_u64(&mut cur)?,
            },
            timestamps: DataRange {
                offset: read_u64(&mut cur)?,
                size: read_u64(&mut cur)?,
            },
        });
    }
    validate_descriptors(&out, path)?;
    Ok(out)
}

fn validate_descriptors(descriptors: &[BlockDescriptor], path: &Path) -> Result<(), PartError> {
    for (i, d) in descriptors.iter().enumerate() {
        if d.count == 0 || d.min_timestamp > d.max_timestamp {
            return Err(PartError::corruption(
                path,
                format!("Invalid block descriptor #{}: {:?}", i, d),
            ));
        }
        if i > 0 && descriptors[i - 1].key() > d.key() {
            return Err(PartError::corruption(
                path,
                format!("Block descriptor #{} out of order", i),
            ));
        }
    }
    Ok(())
}

/// Fetches raw column bytes for block decoding.
pub(crate) trait ColumnSource {
    fn path(&self) -> &Path;
    fn read_primary(&mut self, r: DataRange) -> Result<Vec<u8>, PartError>;
    fn read_timestamps(&mut self, r: DataRange) -> Result<Vec<u8>, PartError>;
    fn read_tag_family_metadata(&mut self, family: &str, r: DataRange)
        -> Result<Vec<u8>, PartError>;
    fn read_tag_family(&mut self, family: &str, r: DataRange) -> Result<Vec<u8>, PartError>;
}

/// Decodes the block `desc` points at. Reads happen in ascending offset order per stream.
pub(crate) fn decode_block<S: ColumnSource>(
    src: &mut S,
    desc: &BlockDescriptor,
) -> Result<Block, PartError> {
    let count = desc.count as usize;
    let primary = src.read_primary(desc.primary)?;
    let row_meta: BlockRowMetadata = bincode::deserialize(&primary)
        .map_err(|e| PartError::corruption(src.path(), format!("Bad block row metadata: {}", e)))?;

    let ts_bytes = src.read_timestamps(desc.timestamps)?;
    let (timestamps, element_ids) = decode_timestamps(&ts_bytes, count, src.path())?;
    if timestamps.first() != Some(&desc.min_timestamp)
        || timestamps.last() != Some(&desc.max_timestamp)
    {
        return Err(PartError::corruption(
            src.path(),
            format!(
                "Timestamps of block (series={}) disagree with its descriptor",
                desc.series_id
            ),
        ));
    }

    let mut tag_families = Vec::with_capacity(row_meta.tag_families.len());
    for (family, range) in &row_meta.tag_families {
        let raw = src.read_tag_family_metadata(family, *range)?;
        let tfm: TagFamilyMetadata = bincode::deserialize(&raw).map_err(|e| {
            PartError::corruption(
                src.path(),
                format!("Bad tag family metadata for {}: {}", family, e),
            )
        })?;
        let mut tags = Vec::with_capacity(tfm.tags.len());
        for tag in tfm.tags {
            let data = src.read_tag_family(family, tag.data)?;
            let values = decode_tag_values(&data, count, src.path())?;
            tags.push(TagColumn {
                name: tag.name,
                values,
            });
        }
        tag_families.push(TagFamilyColumns {
            name: family.clone(),
            tags,
        });
    }

    Ok(Block {
        series_id: desc.series_id,
        timestamps,
        element_ids,
        tag_families,
    })
}

/// Checks `r` lies within a stream of `len` bytes.
pub(crate) fn check_range(r: DataRange, len: u64, path: &Path) -> Result<(), PartError> {
    if r.end() > len || r.end() < r.offset {
        return Err(PartError::corruption(
            path,
            format!(
                "Range {}..{} exceeds stream length {}",
                r.offset,
                r.end(),
                len
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(sid: u64, min: i64, max: i64) -> BlockDescriptor {
        BlockDescriptor {
            series_id: sid,
            min_timestamp: min,
            max_timestamp: max,
            count: 1,
            primary: DataRange { offset: 1, size: 2 },
            timestamps: DataRange { offset: 3, size: 4 },
        }
    }

    #[test]
    fn test_descriptors_encode_decode() {
        let ds = vec![desc(1, -5, 10), desc(1, 10, 20), desc(7, 0, 0)];
        let mut buf = Vec::new();
        encode_block_descriptors(&ds, &mut buf).unwrap();
        let got = decode_block_descriptors(&buf, Path::new("meta.bin")).unwrap();
        assert_eq!(got, ds);
    }

    #[test]
    fn test_descriptors_crc_mismatch_is_corruption() {
        let mut buf = Vec::new();
        encode_block_descriptors(&[desc(1, 0, 1)], &mut buf).unwrap();
        buf[20] ^= 0xFF;
        let err = decode_block_descriptors(&buf, Path::new("meta.bin")).unwrap_err();
        assert!(matches!(err, PartError::Corruption { .. }));
    }

    #[test]
    fn test_descriptor_count_must_fit_header() {
        assert_eq!(descriptor_count(3).unwrap(), 3);
        assert_eq!(descriptor_count(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            descriptor_count(u32::MAX as usize + 1),
            Err(PartError::Internal(_))
        ));
    }

    #[test]
    fn test_descriptors_out_of_order_is_corruption() {
        let mut buf = Vec::new();
        encode_block_descriptors(&[desc(2, 0, 1), desc(1, 0, 1)], &mut buf).unwrap();
        assert!(decode_block_descriptors(&buf, Path::new("meta.bin")).is_err());
    }

    #[test]
    fn test_from_rows_fills_missing_tags_with_null() {
        let rows = vec![
            vec![TagFamily::new(
                "default",
                vec![Tag::new("host", TagValue::Str("a".into()))],
            )],
            vec![
                TagFamily::new(
                    "default",
                    vec![
                        Tag::new("region", TagValue::Str("eu".into())),
                        Tag::new("host", TagValue::Str("b".into())),
                    ],
                ),
                TagFamily::new("extra", vec![Tag::new("n", TagValue::Int64(3))]),
            ],
        ];
        let b = Block::from_rows(9, &[1, 2], &[10, 20], &rows);

        assert_eq!(b.tag_families.len(), 2);
        let default = &b.tag_families[0];
        assert_eq!(default.tags[0].name, "host");
        assert_eq!(
            default.tags[0].values,
            vec![TagValue::Str("a".into()), TagValue::Str("b".into())]
        );
        assert_eq!(default.tags[1].name, "region");
        assert_eq!(
            default.tags[1].values,
            vec![TagValue::Null, TagValue::Str("eu".into())]
        );
        assert_eq!(
            b.tag_families[1].tags[0].values,
            vec![TagValue::Null, TagValue::Int64(3)]
        );

        let row = b.row(1);
        assert_eq!(row.timestamp, 2);
        assert_eq!(row.element_id, 20);
        assert_eq!(row.tag_families.len(), 2);
    }

    #[test]
    fn test_from_rows_merges_same_name_families() {
        let rows = vec![vec![
            TagFamily::new("d", vec![Tag::new("a", TagValue::Int64(1))]),
            TagFamily::new(
                "d",
                vec![
                    Tag::new("b", TagValue::Int64(2)),
                    Tag::new("a", TagValue::Int64(9)),
                ],
            ),
        ]];
        let b = Block::from_rows(1, &[5], &[0], &rows);

        assert_eq!(b.tag_families.len(), 1);
        let d = &b.tag_families[0];
        assert_eq!(d.tags.len(), 2);
        assert_eq!(d.tags[0].name, "a");
        assert_eq!(d.tags[0].values, vec![TagValue::Int64(1)]);
        assert_eq!(d.tags[1].name, "b");
        assert_eq!(d.tags[1].values, vec![TagValue::Int64(2)]);
    }
}
