#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use partstore::config::CacheHintMode;
use partstore::fadvis::CacheHint;
use partstore::{
    Element, Elements, PartEvent, PartEventListener, StorageConfig, Tag, TagFamily, TagValue,
};

/// Test-only listener that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<PartEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<PartEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&PartEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl PartEventListener for RecordingListener {
    fn on_event(&self, event: PartEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Test-only cache hint that records the paths it was applied to.
#[derive(Debug, Default)]
pub struct RecordingHint {
    pub applied: Mutex<Vec<PathBuf>>,
    pub sequential: Mutex<Vec<PathBuf>>,
    pub fail: bool,
}

impl RecordingHint {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn applied_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .applied
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl CacheHint for RecordingHint {
    fn apply(&self, path: &Path) -> io::Result<()> {
        self.applied.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "hint refused"));
        }
        Ok(())
    }

    fn apply_sequential(&self, path: &Path) -> io::Result<()> {
        self.sequential.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

pub fn element(series_id: u64, timestamp: i64, element_id: u64) -> Element {
    Element {
        series_id,
        timestamp,
        element_id,
        tag_families: vec![
            TagFamily::new(
                "default",
                vec![
                    Tag::new("host", TagValue::Str(format!("host-{}", series_id))),
                    Tag::new("seq", TagValue::Int64(element_id as i64)),
                ],
            ),
            TagFamily::new(
                "extra",
                vec![Tag::new("payload", TagValue::Binary(vec![timestamp as u8; 3]))],
            ),
        ],
    }
}

/// Rows `(series id, timestamp)`; element ids are `base_eid + position`.
pub fn elements(rows: &[(u64, i64)], base_eid: u64) -> Elements {
    let mut es = Elements::default();
    for (i, &(sid, ts)) in rows.iter().enumerate() {
        es.push(element(sid, ts, base_eid + i as u64));
    }
    es
}

pub fn test_config(root: &Path, events: Arc<dyn PartEventListener>) -> StorageConfig {
    StorageConfig {
        root: root.to_path_buf(),
        cache_hint: CacheHintMode::Disabled,
        event_listener: events,
        ..Default::default()
    }
}
