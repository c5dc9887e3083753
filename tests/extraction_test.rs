use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexwatch::Settings;
use indexwatch::cli::commands::extract;
use indexwatch::config::ExtractionConfig;
use indexwatch::extract::{
    ErrorReportStore, ExtractionItem, ExtractionQueue, ExtractorRegistry, FailFast, JsonlStore,
    MemoryStore, PersistenceLog, StoreSink,
};
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Default)]
struct NeverExit {
    reasons: Mutex<Vec<String>>,
}

impl FailFast for NeverExit {
    fn terminate(&self, reason: &str) {
        self.reasons.lock().push(reason.to_string());
    }
}

struct Workspace {
    temp: TempDir,
    docs: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        Self { temp, docs }
    }

    fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.docs.join(name);
        fs::write(&path, contents).unwrap();
        path.canonicalize().unwrap()
    }

    fn markers(&self) -> PersistenceLog {
        PersistenceLog::open(Some(self.temp.path().join("markers"))).unwrap()
    }

    fn reports(&self) -> ErrorReportStore {
        ErrorReportStore::open(self.temp.path().join("errors")).unwrap()
    }

    fn queue(&self, store: MemoryStore) -> ExtractionQueue {
        ExtractionQueue::new(
            &ExtractionConfig::default(),
            ExtractorRegistry::with_builtin().unwrap(),
            self.markers(),
            Box::new(store),
            Box::new(self.reports()),
        )
        .with_fail_fast(Arc::new(NeverExit::default()))
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.extraction.persistence_dir = Some(self.temp.path().join("markers"));
        settings.extraction.error_report_dir = Some(self.temp.path().join("errors"));
        settings.extraction.store_path = self.temp.path().join("store.jsonl");
        settings
    }
}

fn uri(path: &Path) -> String {
    ExtractionItem::from_path(path).uri().to_string()
}

#[test]
fn test_crash_marker_becomes_failure_on_next_start() {
    let ws = Workspace::new();
    let crashed = ws.file("crashed.txt", b"took the extractor down\n");

    // A previous run died between recording and finishing this file
    ws.markers().record(&crashed).unwrap();
    assert!(ws.markers().contains(&crashed));

    let store = MemoryStore::new();
    let mut queue = ws.queue(store.clone());
    assert_eq!(queue.recover().unwrap(), 1);

    assert!(!ws.markers().contains(&crashed));
    assert!(queue.is_up_to_date(&crashed));

    let updates = store.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].uri, uri(&crashed));
    assert!(updates[0].graph.is_none());

    let report = ws.reports().lookup(&uri(&crashed)).unwrap().unwrap();
    assert_eq!(report.extra.as_deref(), Some("text/plain"));

    // Nothing left to recover the second time around
    assert_eq!(queue.recover().unwrap(), 0);
}

#[test]
fn test_recovered_file_is_not_retried() {
    let ws = Workspace::new();
    let crashed = ws.file("crashed.txt", b"boom\n");
    let fine = ws.file("fine.txt", b"one two three\n");
    ws.markers().record(&crashed).unwrap();

    let store = MemoryStore::new();
    let mut queue = ws.queue(store.clone());
    queue.recover().unwrap();

    let mut items: VecDeque<ExtractionItem> = [&crashed, &fine]
        .into_iter()
        .map(ExtractionItem::from_path)
        .collect();
    let summary = queue.run(&mut items);

    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.up_to_date, 1);
    assert_eq!(summary.terminated, None);

    let graph = store
        .updates()
        .into_iter()
        .find(|u| u.uri == uri(&fine))
        .and_then(|u| u.graph)
        .unwrap();
    assert_eq!(graph.get("nfo:wordCount").map(ToString::to_string), Some("3".into()));
    assert!(ws.markers().dir().read_dir().unwrap().next().is_none());
}

#[test]
fn test_extract_command_marks_every_file() {
    let ws = Workspace::new();
    ws.file("notes.txt", b"plain words here\n");
    ws.file("blob.bin", &[0u8, 159, 146, 150, 0, 1, 2, 3]);
    let settings = ws.settings();

    let first = extract::run(&settings, &[ws.docs.clone()], false).unwrap();
    assert_eq!(first.extracted, 1);
    assert_eq!(first.failed, 1);

    let store = JsonlStore::open(&settings.extraction.store_path).unwrap();
    assert_eq!(store.len(), 2);

    let second = extract::run(&settings, &[ws.docs.clone()], false).unwrap();
    assert_eq!(second.extracted, 0);
    assert_eq!(second.up_to_date, 2);

    let forced = extract::run(&settings, &[ws.docs.clone()], true).unwrap();
    assert_eq!(forced.extracted, 1);
    assert_eq!(forced.up_to_date, 0);
}

#[test]
fn test_failed_extraction_leaves_a_report() {
    let ws = Workspace::new();
    let blob = ws.file("blob.bin", &[0u8, 159, 146, 150, 0, 1, 2, 3]);
    let settings = ws.settings();

    extract::run(&settings, &[ws.docs.clone()], false).unwrap();

    let report = ws.reports().lookup(&uri(&blob)).unwrap().unwrap();
    assert!(!report.message.is_empty());
    let store = JsonlStore::open(&settings.extraction.store_path).unwrap();
    assert!(store.marker(&uri(&blob)).is_some());
}
