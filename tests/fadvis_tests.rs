use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use partstore::fadvis::{MemoryProtector, Registration, DEFAULT_LARGE_FILE_THRESHOLD};
use partstore::part::part_path;
use partstore::telemetry::noop_event_listener;
use partstore::{
    Fadvis, LargeFileThreshold, LocalFileSystem, MemPart, MergeReader, PartError, PartEvent,
    PartMergeIter, PartStore, PartWrapper,
};

mod test_support;
use test_support::{elements, test_config, RecordingHint, RecordingListener};

fn recording(threshold: i64) -> (Fadvis, Arc<RecordingHint>, Arc<RecordingListener>) {
    let hint = Arc::new(RecordingHint::default());
    let listener = Arc::new(RecordingListener::default());
    let f = Fadvis::new(
        LargeFileThreshold::new(threshold),
        hint.clone(),
        listener.clone(),
    );
    (f, hint, listener)
}

#[test]
fn test_non_positive_thresholds_are_ignored() {
    let (f, _, listener) = recording(DEFAULT_LARGE_FILE_THRESHOLD);
    f.set_threshold(33_554_432);
    assert_eq!(f.get_threshold(), 33_554_432);
    f.set_threshold(0);
    assert_eq!(f.get_threshold(), 33_554_432);
    f.set_threshold(-5);
    assert_eq!(f.get_threshold(), 33_554_432);
    assert_eq!(
        listener.events(),
        vec![PartEvent::LargeFileThresholdChanged {
            threshold: 33_554_432
        }]
    );

    assert_eq!(LargeFileThreshold::new(0).get(), DEFAULT_LARGE_FILE_THRESHOLD);
    assert_eq!(LargeFileThreshold::new(-1).get(), DEFAULT_LARGE_FILE_THRESHOLD);
}

#[test]
fn test_threshold_comparison_is_strict() {
    let dir = tempdir().unwrap();
    let exact = dir.path().join("exact.bin");
    let over = dir.path().join("over.bin");
    fs::write(&exact, vec![0u8; 100]).unwrap();
    fs::write(&over, vec![0u8; 101]).unwrap();

    let (f, hint, _) = recording(100);
    assert!(!f.is_large(100));
    assert!(f.is_large(101));
    assert!(!f.apply_if_large(&exact));
    assert!(f.apply_if_large(&over));
    assert_eq!(hint.applied_names(), vec!["over.bin"]);

    // Missing files are skipped by the lenient variant and surface in the strict one.
    let missing = dir.path().join("missing.bin");
    assert!(!f.apply_if_large(&missing));
    assert!(matches!(f.must_apply_if_large(&missing), Err(PartError::Io(_))));
}

#[test]
fn test_hint_failures_become_events() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("big.bin");
    fs::write(&file, vec![1u8; 64]).unwrap();

    let listener = Arc::new(RecordingListener::default());
    let f = Fadvis::new(
        LargeFileThreshold::new(10),
        Arc::new(RecordingHint::failing()),
        listener.clone(),
    );
    assert!(f.apply_if_large(&file));
    assert_eq!(
        listener.count(|e| matches!(e, PartEvent::CacheHintFailed { path, .. } if *path == file)),
        1
    );
    assert!(matches!(f.must_apply_if_large(&file), Err(PartError::Io(_))));
}

#[test]
fn test_successful_hint_is_reported() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("big.bin");
    fs::write(&file, vec![1u8; 64]).unwrap();

    let (f, hint, listener) = recording(10);
    assert!(f.must_apply_if_large(&file).unwrap());
    assert_eq!(hint.applied.lock().unwrap().as_slice(), &[file.clone()]);
    assert_eq!(
        listener.events(),
        vec![PartEvent::CacheHintApplied { path: file }]
    );
}

#[test]
fn test_global_threshold_is_one_instance() {
    let a = LargeFileThreshold::global();
    let b = LargeFileThreshold::global();
    assert!(std::ptr::eq(a, b));
    assert!(a.get() > 0);

    // Clones share the value.
    let local = LargeFileThreshold::new(5);
    let clone = local.clone();
    clone.set(9);
    assert_eq!(local.get(), 9);
}

#[derive(Debug)]
struct FixedProtector(Result<i64, String>);

impl MemoryProtector for FixedProtector {
    fn threshold(&self) -> Result<i64, String> {
        self.0.clone()
    }
}

#[test]
fn test_memory_protector_registration() {
    let (f, _, listener) = recording(1000);
    assert_eq!(
        f.register_memory_protector(Some(&FixedProtector(Ok(4096)))),
        Registration::Applied(4096)
    );
    assert_eq!(f.get_threshold(), 4096);
    assert_eq!(
        f.register_memory_protector(Some(&FixedProtector(Ok(1)))),
        Registration::AlreadyRegistered
    );
    assert_eq!(f.get_threshold(), 4096);
    assert_eq!(
        listener.events(),
        vec![PartEvent::LargeFileThresholdChanged { threshold: 4096 }]
    );

    let (f, _, listener) = recording(1000);
    assert!(matches!(
        f.register_memory_protector(Some(&FixedProtector(Err("no cgroup".into())))),
        Registration::Ignored(_)
    ));
    assert_eq!(f.get_threshold(), 1000);
    assert_eq!(
        listener.count(|e| matches!(e, PartEvent::MemoryProtectorIgnored { .. })),
        1
    );

    let (f, _, _) = recording(1000);
    assert!(matches!(
        f.register_memory_protector(None),
        Registration::Ignored(_)
    ));
    assert!(matches!(
        f.register_memory_protector(Some(&FixedProtector(Ok(0)))),
        Registration::AlreadyRegistered
    ));
    assert_eq!(f.get_threshold(), 1000);
}

#[derive(Debug)]
struct PanickingProtector;

impl MemoryProtector for PanickingProtector {
    fn threshold(&self) -> Result<i64, String> {
        panic!("cgroup reader crashed");
    }
}

#[test]
fn test_panicking_protector_leaves_threshold_unchanged() {
    let (f, _, listener) = recording(1000);
    assert_eq!(
        f.register_memory_protector(Some(&PanickingProtector)),
        Registration::Ignored("recovered from panic in threshold".to_string())
    );
    assert_eq!(f.get_threshold(), 1000);
    assert_eq!(
        listener.count(|e| matches!(e, PartEvent::MemoryProtectorIgnored { .. })),
        1
    );

    // The guard is not poisoned: later calls report the earlier registration.
    assert_eq!(
        f.register_memory_protector(Some(&FixedProtector(Ok(4096)))),
        Registration::AlreadyRegistered
    );
    assert_eq!(f.get_threshold(), 1000);
}

#[test]
fn test_merge_over_large_files_hints_after_drop() {
    let dir = tempdir().unwrap();
    let store = PartStore::open(test_config(dir.path(), noop_event_listener())).unwrap();
    let mut es = elements(&[(1, 1), (2, 2), (3, 3)], 0);
    let mp = store.build_mem_part(&mut es).unwrap();
    let part = store.flush_mem_part(&mp).unwrap().unwrap();
    store.recycle_mem_part(mp);

    let (f, hint, listener) = recording(1);
    let iter = PartMergeIter::new(part.guard(), &f).unwrap();
    let mut reader = MergeReader::new(vec![iter]).unwrap();

    let detected = listener.count(|e| matches!(e, PartEvent::LargeFileDetected { .. }));
    assert_eq!(detected, 6, "primary, timestamps and two files per tag family");
    assert_eq!(hint.sequential.lock().unwrap().len(), 6);
    assert!(hint.applied_names().is_empty());

    while reader.next_block().unwrap().is_some() {
        reader.load_block_data().unwrap();
    }
    assert!(hint.applied_names().is_empty());

    drop(reader);
    assert_eq!(
        hint.applied_names(),
        vec![
            "default.tf",
            "default.tfm",
            "extra.tf",
            "extra.tfm",
            "primary.bin",
            "timestamps.bin"
        ]
    );
    part.release();
}

#[test]
fn test_merge_below_threshold_never_hints() {
    let dir = tempdir().unwrap();
    let store = PartStore::open(test_config(dir.path(), noop_event_listener())).unwrap();
    let mut es = elements(&[(1, 1)], 0);
    let mp = store.build_mem_part(&mut es).unwrap();
    let part = store.flush_mem_part(&mp).unwrap().unwrap();
    store.recycle_mem_part(mp);

    let (f, hint, listener) = recording(1 << 30);
    let reader = MergeReader::new(vec![PartMergeIter::new(part.guard(), &f).unwrap()]).unwrap();
    drop(reader);
    assert!(hint.applied_names().is_empty());
    assert!(hint.sequential.lock().unwrap().is_empty());
    assert!(listener.events().is_empty());
    part.release();
}

#[test]
fn test_mem_parts_are_never_hinted() {
    let mut es = elements(&[(1, 1), (2, 2)], 0);
    let mut mp = MemPart::new();
    mp.init_from_elements(&mut es, 1 << 20).unwrap();
    mp.set_id(1);
    let part = PartWrapper::new_mem(mp, None, noop_event_listener()).unwrap();

    let (f, hint, listener) = recording(1);
    let mut reader =
        MergeReader::new(vec![PartMergeIter::new(part.guard(), &f).unwrap()]).unwrap();
    while reader.next_block().unwrap().is_some() {
        reader.load_block_data().unwrap();
    }
    drop(reader);
    assert!(hint.applied_names().is_empty());
    assert!(listener.events().is_empty());
    part.release();
}

#[test]
fn test_flush_into_index_directory_hints_nothing() {
    let dir = tempdir().unwrap();
    let mut es = elements(&[(1, 1)], 0);
    let mut mp = MemPart::new();
    mp.init_from_elements(&mut es, 1 << 20).unwrap();

    let (f, hint, _) = recording(1);
    let idx = part_path(dir.path(), 1).join("idx");
    mp.flush(&LocalFileSystem, &idx, &f).unwrap();
    assert!(hint.applied_names().is_empty());
}
