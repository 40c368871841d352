use crate::block::DEFAULT_MAX_UNCOMPRESSED_BLOCK_SIZE;
use crate::error::PartError;
use crate::fadvis::{
    platform_cache_hint, CacheHint, Fadvis, LargeFileThreshold, NoopCacheHint,
    DEFAULT_LARGE_FILE_THRESHOLD,
};
use crate::telemetry::{tracing_event_listener, PartEventListener};

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Which cache hint implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHintMode {
    /// `posix_fadvise` where available, no-op elsewhere.
    #[default]
    Platform,
    Disabled,
}

impl CacheHintMode {
    pub fn cache_hint(self) -> Arc<dyn CacheHint> {
        match self {
            CacheHintMode::Platform => platform_cache_hint(),
            CacheHintMode::Disabled => Arc::new(NoopCacheHint),
        }
    }
}

/// Configuration for a [`PartStore`](crate::store::PartStore).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per part.
    pub root: PathBuf,
    /// Files strictly larger than this are hinted out of the page cache.
    pub large_file_threshold: i64,
    /// Shared threshold handle (e.g. [`LargeFileThreshold::global`]). When set,
    /// `large_file_threshold` is ignored and the handle's current value is used.
    pub shared_threshold: Option<LargeFileThreshold>,
    /// Cap on a block's uncompressed size.
    pub max_uncompressed_block_size: u64,
    pub cache_hint: CacheHintMode,
    /// Worker threads for background part removal.
    pub removal_threads: usize,
    /// Released mem parts kept for reuse.
    pub mem_part_pool_capacity: usize,
    pub event_listener: Arc<dyn PartEventListener>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: PathBuf::from("./data/parts"),
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            shared_threshold: None,
            max_uncompressed_block_size: DEFAULT_MAX_UNCOMPRESSED_BLOCK_SIZE,
            cache_hint: CacheHintMode::Platform,
            removal_threads: 2,
            mem_part_pool_capacity: 16,
            event_listener: tracing_event_listener(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), PartError> {
        if self.max_uncompressed_block_size == 0 {
            return Err(PartError::ConfigError(
                "max_uncompressed_block_size must be positive".to_string(),
            ));
        }
        if self.removal_threads == 0 {
            return Err(PartError::ConfigError(
                "removal_threads must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Threshold handle + hint + listener for this configuration.
    pub fn fadvis(&self) -> Fadvis {
        let threshold = self
            .shared_threshold
            .clone()
            .unwrap_or_else(|| LargeFileThreshold::new(self.large_file_threshold));
        Fadvis::new(
            threshold,
            self.cache_hint.cache_hint(),
            Arc::clone(&self.event_listener),
        )
    }

    /// Overwrites the fields that are `Some` in `partial`.
    pub fn merge(&mut self, partial: &StorageFileConfig) {
        if let Some(root) = &partial.root {
            self.root = root.clone();
        }
        if let Some(t) = partial.large_file_threshold {
            self.large_file_threshold = t;
        }
        if let Some(n) = partial.max_uncompressed_block_size {
            self.max_uncompressed_block_size = n;
        }
        if let Some(mode) = partial.cache_hint {
            self.cache_hint = mode;
        }
        if let Some(n) = partial.removal_threads {
            self.removal_threads = n;
        }
        if let Some(n) = partial.mem_part_pool_capacity {
            self.mem_part_pool_capacity = n;
        }
    }
}

/// File/env form of [`StorageConfig`]; every field optional for layering.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageFileConfig {
    pub root: Option<PathBuf>,
    pub large_file_threshold: Option<i64>,
    pub max_uncompressed_block_size: Option<u64>,
    pub cache_hint: Option<CacheHintMode>,
    pub removal_threads: Option<usize>,
    pub mem_part_pool_capacity: Option<usize>,
}
