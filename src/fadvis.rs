//! Page-cache hints for large immutable files.
//!
//! Files larger than the configured threshold are hinted out of the OS page cache after
//! they have been written or fully scanned, so bulk flushes and merges do not evict the
//! pages hot query paths depend on. Hinting is advisory: failures are reported through
//! the event listener and never fail the surrounding operation.

use crate::error::PartError;
use crate::telemetry::{PartEvent, PartEventListener};

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Once, OnceLock};

/// Default large file threshold (64 MiB).
pub const DEFAULT_LARGE_FILE_THRESHOLD: i64 = 64 * 1024 * 1024;

/// External memory-pressure signal exposing the byte size above which files count as large.
pub trait MemoryProtector: fmt::Debug + Send + Sync {
    fn threshold(&self) -> Result<i64, String>;
}

/// Outcome of [`LargeFileThreshold::register_memory_protector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Applied(i64),
    Ignored(String),
    AlreadyRegistered,
}

/// Byte-size cutoff above which cache hints are applied.
///
/// Clones share the same value. Components receive a handle through configuration;
/// [`LargeFileThreshold::global`] exists for callers that need process-wide access.
#[derive(Debug, Clone)]
pub struct LargeFileThreshold {
    value: Arc<AtomicI64>,
    registered: Arc<Once>,
}

impl Default for LargeFileThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_LARGE_FILE_THRESHOLD)
    }
}

impl LargeFileThreshold {
    /// Creates a threshold; non-positive values fall back to the default.
    pub fn new(threshold: i64) -> Self {
        let v = if threshold > 0 {
            threshold
        } else {
            DEFAULT_LARGE_FILE_THRESHOLD
        };
        Self {
            value: Arc::new(AtomicI64::new(v)),
            registered: Arc::new(Once::new()),
        }
    }

    /// Process-wide instance, initialized to the default on first access.
    pub fn global() -> &'static LargeFileThreshold {
        static GLOBAL: OnceLock<LargeFileThreshold> = OnceLock::new();
        GLOBAL.get_or_init(LargeFileThreshold::default)
    }

    /// Stores `threshold` if positive. Returns whether the value was stored.
    pub fn set(&self, threshold: i64) -> bool {
        if threshold > 0 {
            self.value.store(threshold, Ordering::Release);
            return true;
        }
        false
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Strictly greater than the threshold.
    pub fn is_large(&self, size: u64) -> bool {
        match i64::try_from(size) {
            Ok(size) => size > self.get(),
            Err(_) => true,
        }
    }

    /// Imports the protector's threshold. Only the first call on this handle (or any clone)
    /// has an effect; later calls return [`Registration::AlreadyRegistered`].
    pub fn register_memory_protector(
        &self,
        protector: Option<&dyn MemoryProtector>,
    ) -> Registration {
        let mut outcome = Registration::AlreadyRegistered;
        self.registered.call_once(|| {
            outcome = match protector {
                None => Registration::Ignored("received no memory protector".to_string()),
                // A panicking protector must not poison the guard or reach the caller.
                Some(p) => match panic::catch_unwind(AssertUnwindSafe(|| p.threshold())) {
                    Ok(Ok(t)) if self.set(t) => Registration::Applied(t),
                    Ok(Ok(t)) => Registration::Ignored(format!("non-positive threshold {}", t)),
                    Ok(Err(e)) => Registration::Ignored(e),
                    Err(_) => Registration::Ignored(
                        "recovered from panic in threshold".to_string(),
                    ),
                },
            };
        });
        outcome
    }
}

/// Advisory page-cache capability.
pub trait CacheHint: fmt::Debug + Send + Sync {
    /// Tells the OS the file's cached pages are no longer needed.
    fn apply(&self, path: &Path) -> io::Result<()>;

    /// Tells the OS the file is about to be read sequentially.
    fn apply_sequential(&self, path: &Path) -> io::Result<()>;
}

/// Hint implementation for platforms without an advisory call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheHint;

impl CacheHint for NoopCacheHint {
    fn apply(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn apply_sequential(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// `posix_fadvise(2)` based hints.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixFadvise;

#[cfg(target_os = "linux")]
impl PosixFadvise {
    fn advise(path: &Path, advice: libc::c_int) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::File::open(path)?;
        // SAFETY: the descriptor is valid for the lifetime of `file`; offset/len 0 covers the whole file.
        let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, advice) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl CacheHint for PosixFadvise {
    fn apply(&self, path: &Path) -> io::Result<()> {
        Self::advise(path, libc::POSIX_FADV_DONTNEED)
    }

    fn apply_sequential(&self, path: &Path) -> io::Result<()> {
        Self::advise(path, libc::POSIX_FADV_SEQUENTIAL)
    }
}

/// The real advisory implementation where supported, otherwise [`NoopCacheHint`].
pub fn platform_cache_hint() -> Arc<dyn CacheHint> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(PosixFadvise)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoopCacheHint)
    }
}

/// Threshold + hint capability + event sink, passed to every flush path and sequential reader.
#[derive(Debug, Clone)]
pub struct Fadvis {
    threshold: LargeFileThreshold,
    hint: Arc<dyn CacheHint>,
    events: Arc<dyn PartEventListener>,
}

impl Fadvis {
    pub fn new(
        threshold: LargeFileThreshold,
        hint: Arc<dyn CacheHint>,
        events: Arc<dyn PartEventListener>,
    ) -> Self {
        Self {
            threshold,
            hint,
            events,
        }
    }

    pub fn threshold(&self) -> &LargeFileThreshold {
        &self.threshold
    }

    pub fn events(&self) -> &Arc<dyn PartEventListener> {
        &self.events
    }

    /// Non-positive values are ignored.
    pub fn set_threshold(&self, threshold: i64) {
        if self.threshold.set(threshold) {
            self.events
                .on_event(PartEvent::LargeFileThresholdChanged { threshold });
        }
    }

    pub fn get_threshold(&self) -> i64 {
        self.threshold.get()
    }

    pub fn register_memory_protector(
        &self,
        protector: Option<&dyn MemoryProtector>,
    ) -> Registration {
        let outcome = self.threshold.register_memory_protector(protector);
        match &outcome {
            Registration::Applied(t) => self
                .events
                .on_event(PartEvent::LargeFileThresholdChanged { threshold: *t }),
            Registration::Ignored(reason) => self.events.on_event(PartEvent::MemoryProtectorIgnored {
                reason: reason.clone(),
            }),
            Registration::AlreadyRegistered => {}
        }
        outcome
    }

    pub fn is_large(&self, size: u64) -> bool {
        self.threshold.is_large(size)
    }

    /// Applies the hint and reports the outcome. Never fails.
    pub fn apply(&self, path: &Path) {
        match self.hint.apply(path) {
            Ok(()) => self.events.on_event(PartEvent::CacheHintApplied {
                path: path.to_path_buf(),
            }),
            Err(e) => self.events.on_event(PartEvent::CacheHintFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            }),
        }
    }

    pub fn apply_sequential(&self, path: &Path) {
        if let Err(e) = self.hint.apply_sequential(path) {
            self.events.on_event(PartEvent::CacheHintFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            });
        }
    }

    /// Applies the hint if `path` is strictly larger than the threshold.
    /// Returns whether the hint was attempted; a file that cannot be stat'ed is skipped.
    pub fn apply_if_large(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        if !self.is_large(meta.len()) {
            return false;
        }
        self.apply(path);
        true
    }

    /// Like [`Fadvis::apply_if_large`], but hint failures are returned instead of logged.
    pub fn must_apply_if_large(&self, path: &Path) -> Result<bool, PartError> {
        let size = std::fs::metadata(path)?.len();
        if !self.is_large(size) {
            return Ok(false);
        }
        self.hint.apply(path)?;
        self.events.on_event(PartEvent::CacheHintApplied {
            path: path.to_path_buf(),
        });
        Ok(true)
    }
}
