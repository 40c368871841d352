use std::path::PathBuf;
use thiserror::Error;

/// Error type for part storage operations.
#[derive(Error, Debug)]
pub enum PartError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// On-disk state that cannot be trusted. Parts reporting this must not be used.
    #[error("Corruption detected in {path:?}: {details}")]
    Corruption { details: String, path: PathBuf },

    /// A constituent part iterator failed while merging.
    #[error("Merge failed on part {part_id}: {source}")]
    Merge {
        part_id: u64,
        #[source]
        source: Box<PartError>,
    },

    #[error("Part directory already exists: {0:?}")]
    PartExists(PathBuf),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        PartError::Corruption {
            details: details.into(),
            path: path.into(),
        }
    }
}

impl From<bincode::Error> for PartError {
    fn from(err: bincode::Error) -> Self {
        PartError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for PartError {
    fn from(err: serde_json::Error) -> Self {
        PartError::Serialization(err.to_string())
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for PartError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PartError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
