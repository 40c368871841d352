use std::path::PathBuf;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; it never prints. Callers choose where events go:
/// [`TracingEventListener`] forwards them to `tracing`, [`NoopEventListener`] drops them,
/// and tests can install their own recorder.
pub trait PartEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: PartEvent);
}

/// Which representation a released part had.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Mem,
    File,
}

/// Structured events emitted by the part storage layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PartEvent {
    LargeFileThresholdChanged { threshold: i64 },
    /// The external memory protector could not supply a usable threshold.
    MemoryProtectorIgnored { reason: String },

    LargeFileDetected { path: PathBuf, size: u64, threshold: i64 },
    CacheHintApplied { path: PathBuf },
    CacheHintFailed { path: PathBuf, error: String },

    PartReleased { id: u64, kind: PartKind },
    PartRemoveScheduled { id: u64, path: PathBuf },
    PartRemoved { id: u64, path: PathBuf },
    PartRemoveFailed { id: u64, path: PathBuf, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl PartEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: PartEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn PartEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to the `tracing` ecosystem. Advisory failures are logged at `warn`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl PartEventListener for TracingEventListener {
    fn on_event(&self, event: PartEvent) {
        match event {
            PartEvent::LargeFileThresholdChanged { threshold } => {
                tracing::info!(threshold, "set large file threshold for fadvis");
            }
            PartEvent::MemoryProtectorIgnored { reason } => {
                tracing::warn!(%reason, "memory protector unusable, keeping current threshold");
            }
            PartEvent::LargeFileDetected {
                path,
                size,
                threshold,
            } => {
                tracing::debug!(
                    path = %path.display(),
                    size,
                    threshold,
                    "large file detected, will apply fadvis on close"
                );
            }
            PartEvent::CacheHintApplied { path } => {
                tracing::debug!(path = %path.display(), "applied fadvis to file");
            }
            PartEvent::CacheHintFailed { path, error } => {
                tracing::warn!(path = %path.display(), %error, "failed to apply fadvis");
            }
            PartEvent::PartReleased { id, kind } => {
                tracing::debug!(id, ?kind, "part released");
            }
            PartEvent::PartRemoveScheduled { id, path } => {
                tracing::debug!(id, path = %path.display(), "scheduled part removal");
            }
            PartEvent::PartRemoved { id, path } => {
                tracing::info!(id, path = %path.display(), "removed part directory");
            }
            PartEvent::PartRemoveFailed { id, path, error } => {
                tracing::warn!(id, path = %path.display(), %error, "failed to remove part directory");
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn PartEventListener> {
    Arc::new(TracingEventListener)
}
