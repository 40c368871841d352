use std::collections::HashSet;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = i64;

/// Identifier of the series a row belongs to.
pub type SeriesId = u64;

/// Identifier of a single element (row) within its series.
pub type ElementId = u64;

/// A single typed tag value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagValue {
    Null,
    Str(String),
    Int64(i64),
    Binary(Vec<u8>),
    StrArray(Vec<String>),
    Int64Array(Vec<i64>),
}

impl TagValue {
    /// Serialized payload size in bytes, excluding the per-value type/length prefix.
    pub fn size(&self) -> usize {
        match self {
            TagValue::Null => 0,
            TagValue::Str(s) => s.len(),
            TagValue::Int64(_) => 8,
            TagValue::Binary(b) => b.len(),
            TagValue::StrArray(items) => items
                .iter()
                .map(|s| crate::encoding::var_u64_len(s.len() as u64) + s.len())
                .sum(),
            TagValue::Int64Array(items) => items.len() * 8,
        }
    }
}

/// A named tag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: TagValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A named group of tags stored together as one column family.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagFamily {
    pub name: String,
    pub tags: Vec<Tag>,
}

impl TagFamily {
    pub fn new(name: impl Into<String>, tags: Vec<Tag>) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

/// A single row as handed to the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub element_id: ElementId,
    pub tag_families: Vec<TagFamily>,
}

/// A buffered write batch in columnar (struct-of-arrays) layout.
#[derive(Debug, Default, Clone)]
pub struct Elements {
    pub series_ids: Vec<SeriesId>,
    pub timestamps: Vec<Timestamp>,
    pub element_ids: Vec<ElementId>,
    pub tag_families: Vec<Vec<TagFamily>>,
}

impl Elements {
    pub fn push(&mut self, e: Element) {
        self.series_ids.push(e.series_id);
        self.timestamps.push(e.timestamp);
        self.element_ids.push(e.element_id);
        self.tag_families.push(e.tag_families);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn reset(&mut self) {
        self.series_ids.clear();
        self.timestamps.clear();
        self.element_ids.clear();
        self.tag_families.clear();
    }

    /// Stable sort by (series id, timestamp). Rows sharing both keep their insertion order.
    pub fn sort(&mut self) {
        let n = self.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (self.series_ids[i], self.timestamps[i]));
        if order.iter().enumerate().all(|(pos, &i)| pos == i) {
            return;
        }

        let mut series_ids = Vec::with_capacity(n);
        let mut timestamps = Vec::with_capacity(n);
        let mut element_ids = Vec::with_capacity(n);
        let mut tag_families = Vec::with_capacity(n);
        for &i in &order {
            series_ids.push(self.series_ids[i]);
            timestamps.push(self.timestamps[i]);
            element_ids.push(self.element_ids[i]);
            tag_families.push(std::mem::take(&mut self.tag_families[i]));
        }
        self.series_ids = series_ids;
        self.timestamps = timestamps;
        self.element_ids = element_ids;
        self.tag_families = tag_families;
    }

    /// Uncompressed size of row `index`: 8 bytes timestamp + 8 bytes element id,
    /// plus every tag family name and tag value payload.
    pub fn uncompressed_size(&self, index: usize) -> u64 {
        let mut n = 8 + 8;
        for tf in &self.tag_families[index] {
            n += tf.name.len() as u64;
            for tag in &tf.tags {
                n += tag.value.size() as u64;
            }
        }
        n
    }
}

/// Identifier of an indexed chunk.
pub type ChunkId = u64;

/// A collection of chunk identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkIds(pub Vec<ChunkId>);

impl ChunkIds {
    /// Hash-based intersection. Each id present in both inputs appears exactly once,
    /// in the order of its first occurrence in `other`.
    pub fn hash_intersect(&self, other: &ChunkIds) -> ChunkIds {
        if self.0.is_empty() || other.0.is_empty() {
            return ChunkIds::default();
        }
        let mut lookup: HashSet<ChunkId> = self.0.iter().copied().collect();
        let mut out = Vec::with_capacity(lookup.len().min(other.0.len()));
        for id in &other.0 {
            if lookup.remove(id) {
                out.push(*id);
            }
        }
        ChunkIds(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ChunkId>> for ChunkIds {
    fn from(v: Vec<ChunkId>) -> Self {
        ChunkIds(v)
    }
}
