use std::sync::Arc;

use proptest::prelude::*;
use tempfile::tempdir;

use partstore::part::part_path;
use partstore::store::merge_into_mem_part;
use partstore::telemetry::noop_event_listener;
use partstore::{
    Elements, Fadvis, LargeFileThreshold, MemPart, MergeReader, Part, PartMergeIter, PartStore,
    PartWrapper, StorageConfig,
};

mod test_support;
use test_support::{elements, test_config, RecordingHint, RecordingListener};

fn flush_rows(store: &PartStore, rows: &[(u64, i64)], base_eid: u64) -> Arc<PartWrapper> {
    let mut es = elements(rows, base_eid);
    let mp = store.build_mem_part(&mut es).unwrap();
    let part = store.flush_mem_part(&mp).unwrap().unwrap();
    store.recycle_mem_part(mp);
    part
}

/// Every row of `part` as (sid, ts, eid), in storage order.
fn rows_of(part: &Part) -> Vec<(u64, i64, u64)> {
    let mut out = Vec::new();
    for d in part.descriptors() {
        let block = part.load_block(d).unwrap();
        for (ts, eid) in block.timestamps.iter().zip(&block.element_ids) {
            out.push((block.series_id, *ts, *eid));
        }
    }
    out
}

fn assert_non_overlapping(part: &Part) {
    for w in part.descriptors().windows(2) {
        assert!(w[0].key() <= w[1].key());
        if w[0].series_id == w[1].series_id {
            assert!(
                w[0].max_timestamp <= w[1].min_timestamp,
                "{:?} overlaps {:?}",
                w[0],
                w[1]
            );
        }
    }
}

#[test]
fn test_compaction_interleaves_overlapping_parts() {
    let dir = tempdir().unwrap();
    let store = PartStore::open(test_config(dir.path(), noop_event_listener())).unwrap();
    let a = flush_rows(&store, &[(1, 0), (1, 2), (1, 4), (2, 8)], 0);
    let b = flush_rows(&store, &[(1, 1), (1, 3), (1, 5), (2, 7)], 100);

    let merged = store.compact(&[Arc::clone(&a), Arc::clone(&b)]).unwrap().unwrap();
    let part = merged.part().unwrap();
    assert_non_overlapping(&part);
    assert_eq!(part.descriptors().len(), 2);
    assert_eq!(
        rows_of(&part),
        vec![
            (1, 0, 0),
            (1, 1, 100),
            (1, 2, 1),
            (1, 3, 101),
            (1, 4, 2),
            (1, 5, 102),
            (2, 7, 103),
            (2, 8, 3),
        ]
    );
    assert_eq!(part.metadata().total_count, 8);
    assert_eq!(part.metadata().min_timestamp, 0);
    assert_eq!(part.metadata().max_timestamp, 8);
    assert!(merged.id() > b.id());

    assert!(a.is_removable() && b.is_removable());
    let (pa, pb) = (part_path(dir.path(), a.id()), part_path(dir.path(), b.id()));
    assert!(pa.is_dir() && pb.is_dir());
    a.release();
    b.release();
    store.wait_for_removals();
    assert!(!pa.exists());
    assert!(!pb.exists());
    assert_eq!(store.part_ids().unwrap(), vec![merged.id()]);

    drop(part);
    merged.release();
}

#[test]
fn test_equal_timestamps_keep_merge_order() {
    let dir = tempdir().unwrap();
    let store = PartStore::open(test_config(dir.path(), noop_event_listener())).unwrap();
    let a = flush_rows(&store, &[(1, 1), (1, 5)], 0);
    let b = flush_rows(&store, &[(1, 3), (1, 5)], 100);
    let c = flush_rows(&store, &[(1, 5)], 200);

    let mp = store
        .merge_parts(&[Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)])
        .unwrap();
    let part = Part::open_mem(Arc::new(mp)).unwrap();
    assert_eq!(
        rows_of(&part),
        vec![(1, 1, 0), (1, 3, 100), (1, 5, 1), (1, 5, 101), (1, 5, 200)]
    );

    // merge_parts leaves the inputs alone.
    for p in [&a, &b, &c] {
        assert!(!p.is_removable());
        assert_eq!(p.ref_count(), 1);
        p.release();
    }
}

#[test]
fn test_small_blocks_are_coalesced() {
    let dir = tempdir().unwrap();
    let store = PartStore::open(test_config(dir.path(), noop_event_listener())).unwrap();
    let parts: Vec<_> = (0..10)
        .map(|i| flush_rows(&store, &[(1, i * 10), (1, i * 10 + 1)], i as u64 * 10))
        .collect();

    let mp = store.merge_parts(&parts).unwrap();
    let part = Part::open_mem(Arc::new(mp)).unwrap();
    assert_eq!(part.descriptors().len(), 1);
    assert_eq!(part.descriptors()[0].count, 20);
    assert_eq!(part.descriptors()[0].min_timestamp, 0);
    assert_eq!(part.descriptors()[0].max_timestamp, 91);

    for p in parts {
        p.release();
    }
}

#[test]
fn test_compaction_respects_block_cap() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        max_uncompressed_block_size: 100,
        ..test_config(dir.path(), noop_event_listener())
    };
    let store = PartStore::open(config).unwrap();
    let a = flush_rows(&store, &[(1, 0), (1, 2), (1, 4), (1, 6)], 0);
    let b = flush_rows(&store, &[(1, 1), (1, 3), (1, 5), (1, 7)], 10);

    let mp = store.merge_parts(&[Arc::clone(&a), Arc::clone(&b)]).unwrap();
    let part = Part::open_mem(Arc::new(mp)).unwrap();
    assert_non_overlapping(&part);
    // 45-byte rows: two per block.
    assert!(part.descriptors().iter().all(|d| d.count == 2));
    assert_eq!(part.metadata().total_count, 8);

    a.release();
    b.release();
}

#[test]
fn test_compacting_nothing_yields_no_part() {
    let dir = tempdir().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let store = PartStore::open(test_config(dir.path(), listener.clone())).unwrap();
    assert!(store.compact(&[]).unwrap().is_none());

    let mut empty = Elements::default();
    let mp = store.build_mem_part(&mut empty).unwrap();
    assert!(mp.is_empty());
    assert!(store.flush_mem_part(&mp).unwrap().is_none());
    store.recycle_mem_part(mp);
    assert!(store.part_ids().unwrap().is_empty());
}

#[test]
fn test_store_rejects_invalid_config() {
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        removal_threads: 0,
        ..test_config(dir.path(), noop_event_listener())
    };
    assert!(PartStore::open(config).is_err());
}

fn mem_part(rows: &[(u64, i64)], id: u64, base_eid: u64, cap: u64) -> Arc<PartWrapper> {
    let mut es = elements(rows, base_eid);
    let mut mp = MemPart::new();
    mp.init_from_elements(&mut es, cap).unwrap();
    mp.set_id(id);
    PartWrapper::new_mem(mp, None, noop_event_listener()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_merge_into_mem_part_preserves_rows(
        inputs in prop::collection::vec(
            prop::collection::vec((1u64..4, -30i64..30), 0..30),
            1..5,
        ),
        cap in 45u64..400,
    ) {
        let fadvis = Fadvis::new(
            LargeFileThreshold::default(),
            Arc::new(RecordingHint::default()),
            noop_event_listener(),
        );
        let mut expected = Vec::new();
        let mut parts = Vec::new();
        for (i, rows) in inputs.iter().enumerate() {
            let base = i as u64 * 1000;
            for (j, &(sid, ts)) in rows.iter().enumerate() {
                expected.push((sid, ts, base + j as u64));
            }
            parts.push(mem_part(rows, i as u64 + 1, base, cap));
        }

        let iters: Vec<PartMergeIter> = parts
            .iter()
            .map(|p| PartMergeIter::new(p.guard(), &fadvis).unwrap())
            .collect();
        let mut reader = MergeReader::new(iters).unwrap();
        let mut mp = MemPart::new();
        merge_into_mem_part(&mut reader, &mut mp, cap).unwrap();
        drop(reader);

        let part = Part::open_mem(Arc::new(mp)).unwrap();
        let mut rows = rows_of(&part);
        prop_assert!(rows.windows(2).all(|w| (w[0].0, w[0].1) <= (w[1].0, w[1].1)));
        for w in part.descriptors().windows(2) {
            prop_assert!(w[0].key() <= w[1].key());
            if w[0].series_id == w[1].series_id {
                prop_assert!(w[0].max_timestamp <= w[1].min_timestamp);
            }
        }

        rows.sort();
        expected.sort();
        prop_assert_eq!(rows, expected);

        for p in &parts {
            p.release();
        }
    }
}
