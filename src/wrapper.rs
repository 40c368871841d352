//! Reference-counted part handles with deferred, background directory removal.

use crate::error::PartError;
use crate::fs::FileSystem;
use crate::part::{MemPart, Part, PartMetadata};
use crate::pool::Pool;
use crate::telemetry::{PartEvent, PartEventListener, PartKind};

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Runs part directory removals on a bounded worker pool.
///
/// Removal failures are reported as events and never retried.
pub struct BackgroundRemover {
    workers: rayon::ThreadPool,
    pending: Arc<(Mutex<usize>, Condvar)>,
    events: Arc<dyn PartEventListener>,
}

impl fmt::Debug for BackgroundRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundRemover")
            .field("threads", &self.workers.current_num_threads())
            .field("pending", &self.pending())
            .finish()
    }
}

impl BackgroundRemover {
    pub fn new(threads: usize, events: Arc<dyn PartEventListener>) -> Result<Self, PartError> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("part-remover-{}", i))
            .build()
            .map_err(|e| PartError::BackgroundTaskError(e.to_string()))?;
        Ok(Self {
            workers,
            pending: Arc::new((Mutex::new(0), Condvar::new())),
            events,
        })
    }

    /// Queues recursive removal of `path`. Returns immediately.
    pub fn schedule(&self, id: u64, fs: Arc<dyn FileSystem>, path: PathBuf) {
        {
            let (lock, _) = &*self.pending;
            let mut n = lock.lock().unwrap_or_else(|p| p.into_inner());
            *n += 1;
        }
        self.events.on_event(PartEvent::PartRemoveScheduled {
            id,
            path: path.clone(),
        });

        let pending = Arc::clone(&self.pending);
        let events = Arc::clone(&self.events);
        self.workers.spawn(move || {
            match fs.remove_all(&path) {
                Ok(()) => events.on_event(PartEvent::PartRemoved { id, path }),
                Err(e) => events.on_event(PartEvent::PartRemoveFailed {
                    id,
                    path,
                    error: e.to_string(),
                }),
            }
            let (lock, cvar) = &*pending;
            let mut n = lock.lock().unwrap_or_else(|p| p.into_inner());
            *n = n.saturating_sub(1);
            cvar.notify_all();
        });
    }

    /// Number of removals queued or running.
    pub fn pending(&self) -> usize {
        let (lock, _) = &*self.pending;
        *lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocks until every scheduled removal has finished.
    pub fn wait_idle(&self) {
        let (lock, cvar) = &*self.pending;
        let mut n = lock.lock().unwrap_or_else(|p| p.into_inner());
        while *n > 0 {
            n = cvar.wait(n).unwrap_or_else(|p| p.into_inner());
        }
    }
}

enum Backing {
    Mem { mp: Arc<MemPart>, part: Arc<Part> },
    File(Arc<Part>),
}

/// Shared-ownership handle around a published part.
///
/// Starts with one reference owned by the publisher. Readers [`acquire`](Self::acquire)
/// before use and [`release`](Self::release) after; the release that brings the count to
/// zero frees the part exactly once. Mem parts go back to the reuse pool; file parts close
/// their streams and, when marked removable, have their directory deleted in the background.
pub struct PartWrapper {
    metadata: PartMetadata,
    kind: PartKind,
    backing: Mutex<Option<Backing>>,
    ref_count: AtomicI32,
    removable: AtomicBool,
    pool: Option<Arc<Pool<MemPart>>>,
    remover: Option<Arc<BackgroundRemover>>,
    events: Arc<dyn PartEventListener>,
}

impl PartWrapper {
    pub fn new_mem(
        mp: MemPart,
        pool: Option<Arc<Pool<MemPart>>>,
        events: Arc<dyn PartEventListener>,
    ) -> Result<Arc<Self>, PartError> {
        let mp = Arc::new(mp);
        let part = Arc::new(Part::open_mem(Arc::clone(&mp))?);
        Ok(Arc::new(Self {
            metadata: part.metadata().clone(),
            kind: PartKind::Mem,
            backing: Mutex::new(Some(Backing::Mem { mp, part })),
            ref_count: AtomicI32::new(1),
            removable: AtomicBool::new(false),
            pool,
            remover: None,
            events,
        }))
    }

    /// Without a remover, removable file parts are only closed, never deleted.
    pub fn new_file(
        part: Part,
        remover: Option<Arc<BackgroundRemover>>,
        events: Arc<dyn PartEventListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata: part.metadata().clone(),
            kind: PartKind::File,
            backing: Mutex::new(Some(Backing::File(Arc::new(part)))),
            ref_count: AtomicI32::new(1),
            removable: AtomicBool::new(false),
            pool: None,
            remover,
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    pub fn metadata(&self) -> &PartMetadata {
        &self.metadata
    }

    pub fn kind(&self) -> PartKind {
        self.kind
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The wrapped part, or `None` once released.
    pub fn part(&self) -> Option<Arc<Part>> {
        let guard = self.backing.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|b| match b {
            Backing::Mem { part, .. } => Arc::clone(part),
            Backing::File(part) => Arc::clone(part),
        })
    }

    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn guard(self: &Arc<Self>) -> PartRef {
        self.acquire();
        PartRef {
            wrapper: Arc::clone(self),
        }
    }

    pub fn release(&self) {
        if self.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.release_resources();
    }

    /// Flags the directory for deletion at the final release. Safe at any time.
    pub fn mark_removable(&self) {
        self.removable.store(true, Ordering::Release);
    }

    pub fn is_removable(&self) -> bool {
        self.removable.load(Ordering::Acquire)
    }

    fn release_resources(&self) {
        let backing = self
            .backing
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(backing) = backing else {
            return;
        };
        let id = self.id();
        match backing {
            Backing::Mem { mp, part } => {
                drop(part);
                if let Some(pool) = &self.pool {
                    if let Ok(mp) = Arc::try_unwrap(mp) {
                        pool.put(mp);
                    }
                }
                self.events.on_event(PartEvent::PartReleased {
                    id,
                    kind: PartKind::Mem,
                });
            }
            Backing::File(part) => {
                part.close();
                self.events.on_event(PartEvent::PartReleased {
                    id,
                    kind: PartKind::File,
                });
                if !self.is_removable() {
                    return;
                }
                if let (Some(remover), Some(path), Some(fs)) =
                    (&self.remover, part.path(), part.file_system())
                {
                    remover.schedule(id, Arc::clone(fs), path.to_path_buf());
                }
            }
        }
    }
}

impl fmt::Debug for PartWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartWrapper")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("ref_count", &self.ref_count())
            .field("removable", &self.is_removable())
            .finish()
    }
}

impl fmt::Display for PartWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PartKind::Mem => write!(f, "mem part {}", self.metadata),
            PartKind::File => write!(f, "part {}", self.metadata),
        }
    }
}

/// One counted reference to a [`PartWrapper`], released on drop.
#[derive(Debug)]
pub struct PartRef {
    wrapper: Arc<PartWrapper>,
}

impl PartRef {
    pub fn wrapper(&self) -> &Arc<PartWrapper> {
        &self.wrapper
    }
}

impl Clone for PartRef {
    fn clone(&self) -> Self {
        self.wrapper.guard()
    }
}

impl Deref for PartRef {
    type Target = PartWrapper;

    fn deref(&self) -> &PartWrapper {
        &self.wrapper
    }
}

impl Drop for PartRef {
    fn drop(&mut self) {
        self.wrapper.release();
    }
}
