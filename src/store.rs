//! Part store: owns the storage context (filesystem, hints, pools, remover) and ties the
//! builder, flush/open, wrappers and merge readers together.

use crate::block::BlockWriter;
use crate::config::StorageConfig;
use crate::error::PartError;
use crate::fadvis::Fadvis;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::merge::{MergeReader, PartBlockIter, PartMergeIter};
use crate::part::{parse_part_name, part_path, write_sorted_elements, MemPart, Part};
use crate::pool::{Pool, Reset};
use crate::types::{Elements, SeriesId, Timestamp};
use crate::wrapper::{BackgroundRemover, PartWrapper};

use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct PartStore {
    config: StorageConfig,
    fs: Arc<dyn FileSystem>,
    fadvis: Fadvis,
    pool: Arc<Pool<MemPart>>,
    remover: Arc<BackgroundRemover>,
    next_id: AtomicU64,
}

impl PartStore {
    pub fn open(config: StorageConfig) -> Result<Self, PartError> {
        Self::open_with_fs(config, Arc::new(LocalFileSystem))
    }

    /// Opens the store over `fs`. Part ids continue after the highest id found under the root.
    pub fn open_with_fs(config: StorageConfig, fs: Arc<dyn FileSystem>) -> Result<Self, PartError> {
        config.validate()?;
        fs.mkdir_if_not_exist(&config.root)?;

        let fadvis = config.fadvis();
        let remover = Arc::new(BackgroundRemover::new(
            config.removal_threads,
            Arc::clone(&config.event_listener),
        )?);
        let pool = Arc::new(Pool::new(config.mem_part_pool_capacity));

        let store = Self {
            config,
            fs,
            fadvis,
            pool,
            remover,
            next_id: AtomicU64::new(1),
        };
        let max_id = store.part_ids()?.into_iter().max().unwrap_or(0);
        let next = max_id.checked_add(1).ok_or_else(|| {
            PartError::Internal(format!(
                "Part id space exhausted under {:?}: found part {:016x}",
                store.config.root, max_id
            ))
        })?;
        store.next_id.store(next, Ordering::Release);
        Ok(store)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn fadvis(&self) -> &Fadvis {
        &self.fadvis
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn next_part_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Ids of the part directories under the root, ascending.
    pub fn part_ids(&self) -> Result<Vec<u64>, PartError> {
        let mut ids: Vec<u64> = self
            .fs
            .read_dir(&self.config.root)?
            .into_iter()
            .filter(|e| e.is_dir)
            .filter_map(|e| parse_part_name(&e.name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Builds a mem part from `es` (sorting it in place). Non-empty parts get a fresh id.
    pub fn build_mem_part(&self, es: &mut Elements) -> Result<MemPart, PartError> {
        let mut mp = self.pool.get();
        mp.init_from_elements(es, self.config.max_uncompressed_block_size)?;
        if !mp.is_empty() {
            mp.set_id(self.next_part_id());
        }
        Ok(mp)
    }

    /// Publishes a mem part. Its buffers return to the pool at the final release.
    pub fn publish_mem_part(&self, mp: MemPart) -> Result<Arc<PartWrapper>, PartError> {
        PartWrapper::new_mem(
            mp,
            Some(Arc::clone(&self.pool)),
            Arc::clone(&self.config.event_listener),
        )
    }

    /// Flushes `mp` under the root and opens the result. Empty parts yield `None`.
    pub fn flush_mem_part(&self, mp: &MemPart) -> Result<Option<Arc<PartWrapper>>, PartError> {
        if mp.is_empty() {
            return Ok(None);
        }
        let id = mp.metadata().id;
        mp.flush(
            self.fs.as_ref(),
            &part_path(&self.config.root, id),
            &self.fadvis,
        )?;
        self.open_part(id).map(Some)
    }

    /// Returns a pooled mem part once it is no longer needed.
    pub fn recycle_mem_part(&self, mp: MemPart) {
        self.pool.put(mp);
    }

    pub fn open_part(&self, id: u64) -> Result<Arc<PartWrapper>, PartError> {
        let part = Part::open_file(id, &self.config.root, Arc::clone(&self.fs))?;
        Ok(PartWrapper::new_file(
            part,
            Some(Arc::clone(&self.remover)),
            Arc::clone(&self.config.event_listener),
        ))
    }

    /// Opens every part under the root. Fails if any part fails to open.
    pub fn open_existing(&self) -> Result<Vec<Arc<PartWrapper>>, PartError> {
        self.part_ids()?
            .par_iter()
            .map(|&id| self.open_part(id))
            .collect()
    }

    /// Merge reader over `parts`, holding a reference on each until it is dropped.
    pub fn merge_reader(&self, parts: &[Arc<PartWrapper>]) -> Result<MergeReader, PartError> {
        let mut iters = Vec::with_capacity(parts.len());
        for p in parts {
            iters.push(PartMergeIter::new(p.guard(), &self.fadvis)?);
        }
        MergeReader::new(iters)
    }

    /// Merges `parts` into one new mem part. The inputs are left untouched.
    pub fn merge_parts(&self, parts: &[Arc<PartWrapper>]) -> Result<MemPart, PartError> {
        let mut reader = self.merge_reader(parts)?;
        let mut mp = self.pool.get();
        merge_into_mem_part(&mut reader, &mut mp, self.config.max_uncompressed_block_size)?;
        if !mp.is_empty() {
            mp.set_id(self.next_part_id());
        }
        Ok(mp)
    }

    /// Merges `parts` into a new file part and marks the inputs removable.
    ///
    /// The inputs' directories are deleted once their last reference is released;
    /// callers still own the references they hold.
    pub fn compact(&self, parts: &[Arc<PartWrapper>]) -> Result<Option<Arc<PartWrapper>>, PartError> {
        let mp = self.merge_parts(parts)?;
        let merged = self.flush_mem_part(&mp)?;
        self.recycle_mem_part(mp);
        for p in parts {
            p.mark_removable();
        }
        Ok(merged)
    }

    /// Blocks until all scheduled part removals have finished.
    pub fn wait_for_removals(&self) {
        self.remover.wait_idle();
    }
}

impl Drop for PartStore {
    fn drop(&mut self) {
        self.remover.wait_idle();
    }
}

/// Rows of one series collected from consecutive merged blocks.
#[derive(Default)]
struct SeriesRun {
    rows: Elements,
    series_id: SeriesId,
    max_timestamp: Timestamp,
    size: u64,
    overlapping: bool,
}

impl SeriesRun {
    fn write(&mut self, bw: &mut BlockWriter<'_>, max_block_size: u64) -> Result<(), PartError> {
        if self.overlapping {
            self.rows.sort();
        }
        write_sorted_elements(bw, &self.rows, max_block_size)?;
        self.rows.reset();
        self.size = 0;
        self.overlapping = false;
        Ok(())
    }
}

/// Streams `reader` into `mp`, keeping blocks sorted and non-overlapping per series.
///
/// Blocks of one series are coalesced up to `max_block_size`; blocks whose time ranges
/// overlap are re-merged row by row; rows with equal timestamps keep merge order.
pub fn merge_into_mem_part<I: PartBlockIter>(
    reader: &mut MergeReader<I>,
    mp: &mut MemPart,
    max_block_size: u64,
) -> Result<(), PartError> {
    mp.reset();
    let mut bw = BlockWriter::new(mp);
    let mut run = SeriesRun::default();

    while let Some(desc) = reader.next_block()? {
        let desc = *desc;
        let same_series = !run.rows.is_empty() && run.series_id == desc.series_id;
        let overlaps = same_series && desc.min_timestamp < run.max_timestamp;
        if !run.rows.is_empty() && (!same_series || (!overlaps && run.size >= max_block_size)) {
            run.write(&mut bw, max_block_size)?;
        }

        let block = reader.load_block_data()?;
        let first = run.rows.len();
        block.append_to(&mut run.rows);
        for i in first..run.rows.len() {
            run.size += run.rows.uncompressed_size(i);
        }
        if first == 0 {
            run.series_id = desc.series_id;
            run.max_timestamp = desc.max_timestamp;
        } else {
            run.overlapping |= overlaps;
            run.max_timestamp = run.max_timestamp.max(desc.max_timestamp);
        }
    }
    if !run.rows.is_empty() {
        run.write(&mut bw, max_block_size)?;
    }
    bw.flush()?;
    Ok(())
}
