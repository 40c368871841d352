#![doc = include_str!("../README.md")]
// Declare modules
pub mod block;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fadvis;
pub mod fs;
pub mod merge;
pub mod part;
pub mod pool;
pub mod seq_reader;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod wrapper;

/// Per-block index entry and decoded block payload.
pub use crate::block::{Block, BlockDescriptor};
/// Storage configuration.
pub use crate::config::{CacheHintMode, StorageConfig};
/// Error type for part storage operations.
pub use crate::error::PartError;
/// Large-file threshold and page-cache hints.
pub use crate::fadvis::{CacheHint, Fadvis, LargeFileThreshold, MemoryProtector};
/// Filesystem collaborator.
pub use crate::fs::{FileSystem, LocalFileSystem, Reader};
/// K-way merge over parts.
pub use crate::merge::{MergeReader, PartBlockIter, PartMergeIter};
/// In-memory and file-backed parts.
pub use crate::part::{MemPart, Part, PartMetadata};
/// Sequential column readers.
pub use crate::seq_reader::{SeqReader, SeqReaders};
/// Entry point tying builder, flush, open and merge together.
pub use crate::store::PartStore;
/// Structured event hook for observability.
pub use crate::telemetry::{PartEvent, PartEventListener};
/// Row and identifier types.
pub use crate::types::{ChunkIds, Element, Elements, Tag, TagFamily, TagValue};
/// Reference-counted part handles.
pub use crate::wrapper::{PartRef, PartWrapper};
