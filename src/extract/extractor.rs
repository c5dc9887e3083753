//! Format extractors and the worker threads that run them.
//!
//! Every registered extractor module gets a dedicated thread, so a slow or
//! misbehaving parser only ever blocks work for its own formats.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::UNIX_EPOCH;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{ExtractError, ExtractResult};
use super::mime;

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(n) => write!(f, "{n}"),
            PropertyValue::Text(s) => {
                let escaped = s
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n");
                write!(f, "\"{escaped}\"")
            }
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Integer(n)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Text(s)
    }
}

/// Structured metadata for one file: its classes plus property values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGraph {
    pub types: Vec<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, class: impl Into<String>) -> Self {
        self.types.push(class.into());
        self
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(property.into(), value.into());
    }

    pub fn get(&self, property: &str) -> Option<&PropertyValue> {
        self.properties.get(property)
    }
}

/// A format-specific metadata parser.
pub trait Extractor: Send {
    /// Module name, unique per registry.
    fn module(&self) -> &str;

    /// Bumping the version invalidates earlier extraction markers.
    fn version(&self) -> &str {
        "1"
    }

    /// MIME patterns handled, e.g. `text/*` or `audio/mpeg`.
    fn mime_patterns(&self) -> Vec<String>;

    fn extract(&mut self, path: &Path, mime: &str) -> ExtractResult<ResourceGraph>;
}

/// Hash naming an extractor module and version.
pub fn extractor_identity(module: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    hasher.update(b"\0");
    hasher.update(version.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Marker stored with an extracted file.
///
/// Combines the extractor identity with the file's size and modification
/// time, so both a new extractor and an edited file invalidate it. A file
/// that cannot be stat'ed gets a marker no live file will match.
pub fn extraction_marker(identity: &str, path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b"\0");

    match fs::metadata(path) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .unwrap_or_default();
            hasher.update(meta.len().to_le_bytes());
            hasher.update(modified.as_secs().to_le_bytes());
            hasher.update(modified.subsec_nanos().to_le_bytes());
        }
        Err(_) => hasher.update(b"missing"),
    }

    format!("{:x}", hasher.finalize())
}

/// Module name used when no extractor handles a file.
pub const NO_EXTRACTOR: &str = "none";

/// Counts lines, words and bytes of text files.
#[derive(Debug, Default)]
pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn module(&self) -> &str {
        "text"
    }

    fn mime_patterns(&self) -> Vec<String> {
        vec!["text/*".to_string()]
    }

    fn extract(&mut self, path: &Path, mime: &str) -> ExtractResult<ResourceGraph> {
        let bytes = fs::read(path).map_err(|source| ExtractError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let mut graph = ResourceGraph::new()
            .with_type("nfo:PlainTextDocument")
            .with_type("nfo:FileDataObject");
        graph.set("nie:mimeType", mime);
        graph.set("nie:byteSize", bytes.len() as i64);

        if std::str::from_utf8(&bytes).is_ok() {
            graph.set("nie:characterSet", "UTF-8");
        }
        let text = String::from_utf8_lossy(&bytes);
        graph.set("nfo:lineCount", text.lines().count() as i64);
        graph.set("nfo:wordCount", text.split_whitespace().count() as i64);

        Ok(graph)
    }
}

struct Job {
    path: PathBuf,
    mime: String,
    reply: Sender<ExtractResult<ResourceGraph>>,
}

struct ModuleWorker {
    module: String,
    version: String,
    patterns: Vec<String>,
    jobs: Option<Sender<Job>>,
    join: Option<JoinHandle<()>>,
}

/// An extraction handed to a module thread, not yet finished.
pub struct PendingExtraction {
    module: String,
    marker: String,
    reply: Receiver<ExtractResult<ResourceGraph>>,
}

impl PendingExtraction {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub(crate) fn receiver(&self) -> &Receiver<ExtractResult<ResourceGraph>> {
        &self.reply
    }
}

/// Extractors looked up by MIME type, each on its own thread.
#[derive(Default)]
pub struct ExtractorRegistry {
    workers: Vec<ModuleWorker>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in extractors.
    pub fn with_builtin() -> ExtractResult<Self> {
        let mut registry = Self::new();
        registry.register(Box::new(TextExtractor))?;
        Ok(registry)
    }

    /// Start a worker thread for `extractor`.
    pub fn register(&mut self, mut extractor: Box<dyn Extractor>) -> ExtractResult<()> {
        let module = extractor.module().to_string();
        let version = extractor.version().to_string();
        let patterns = extractor.mime_patterns();
        let (jobs_tx, jobs_rx) = unbounded::<Job>();

        let thread_module = module.clone();
        let join = thread::Builder::new()
            .name(format!("extract-{module}"))
            .spawn(move || {
                for job in jobs_rx {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        extractor.extract(&job.path, &job.mime)
                    }));
                    let result = outcome.unwrap_or_else(|_| {
                        tracing::error!(
                            "[extract] {thread_module} panicked on {}",
                            job.path.display()
                        );
                        Err(ExtractError::ExtractorPanicked {
                            module: thread_module.clone(),
                            path: job.path.clone(),
                        })
                    });
                    let _ = job.reply.send(result);
                }
            })?;

        crate::debug_event!(
            "extract",
            "module registered",
            "{module} {version} ({})",
            patterns.join(", ")
        );

        self.workers.push(ModuleWorker {
            module,
            version,
            patterns,
            jobs: Some(jobs_tx),
            join: Some(join),
        });
        Ok(())
    }

    /// Names of the registered modules.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.module.as_str())
    }

    /// Module handling `mime`: an exact pattern beats a wildcard, earlier
    /// registrations beat later ones.
    fn lookup(&self, mime_type: &str) -> Option<&ModuleWorker> {
        self.workers
            .iter()
            .find(|w| w.patterns.iter().any(|p| p == mime_type))
            .or_else(|| {
                self.workers
                    .iter()
                    .find(|w| w.patterns.iter().any(|p| mime::matches(p, mime_type)))
            })
    }

    /// Identity of the module handling files of type `mime`.
    pub fn identity_for(&self, mime_type: &str) -> String {
        match self.lookup(mime_type) {
            Some(worker) => extractor_identity(&worker.module, &worker.version),
            None => extractor_identity(NO_EXTRACTOR, env!("CARGO_PKG_VERSION")),
        }
    }

    /// Marker `path` carries once handled by the module for `mime`.
    pub fn marker_for(&self, path: &Path, mime_type: &str) -> String {
        extraction_marker(&self.identity_for(mime_type), path)
    }

    /// Queue `path` on the module handling `mime` without waiting.
    pub fn dispatch(&self, path: &Path, mime_type: &str) -> ExtractResult<PendingExtraction> {
        let worker = self
            .lookup(mime_type)
            .ok_or_else(|| ExtractError::NoExtractor {
                mime: mime_type.to_string(),
            })?;

        let (reply_tx, reply_rx) = bounded(1);
        let job = Job {
            path: path.to_path_buf(),
            mime: mime_type.to_string(),
            reply: reply_tx,
        };

        let sent = worker.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !sent {
            return Err(ExtractError::WorkerGone {
                module: worker.module.clone(),
            });
        }

        Ok(PendingExtraction {
            module: worker.module.clone(),
            marker: extraction_marker(&extractor_identity(&worker.module, &worker.version), path),
            reply: reply_rx,
        })
    }

    /// Run one extraction to completion on the calling thread's behalf.
    pub fn extract(&self, path: &Path, mime_type: &str) -> ExtractResult<ResourceGraph> {
        let pending = self.dispatch(path, mime_type)?;
        pending
            .reply
            .recv()
            .map_err(|_| ExtractError::WorkerGone {
                module: pending.module.clone(),
            })?
    }
}

impl Drop for ExtractorRegistry {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixed {
        name: &'static str,
        patterns: Vec<String>,
    }

    impl Extractor for Fixed {
        fn module(&self) -> &str {
            self.name
        }

        fn mime_patterns(&self) -> Vec<String> {
            self.patterns.clone()
        }

        fn extract(&mut self, _path: &Path, _mime: &str) -> ExtractResult<ResourceGraph> {
            let mut graph = ResourceGraph::new();
            graph.set("test:module", self.name);
            Ok(graph)
        }
    }

    struct Explodes;

    impl Extractor for Explodes {
        fn module(&self) -> &str {
            "explodes"
        }

        fn mime_patterns(&self) -> Vec<String> {
            vec!["image/*".to_string()]
        }

        fn extract(&mut self, _path: &Path, _mime: &str) -> ExtractResult<ResourceGraph> {
            panic!("bad header");
        }
    }

    #[test]
    fn test_text_extractor_counts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        fs::write(&path, "one two\nthree\n").unwrap();

        let registry = ExtractorRegistry::with_builtin().unwrap();
        let graph = registry.extract(&path, "text/plain").unwrap();

        assert_eq!(graph.get("nfo:lineCount"), Some(&PropertyValue::Integer(2)));
        assert_eq!(graph.get("nfo:wordCount"), Some(&PropertyValue::Integer(3)));
        assert_eq!(graph.get("nie:byteSize"), Some(&PropertyValue::Integer(14)));
        assert!(graph.types.contains(&"nfo:PlainTextDocument".to_string()));
    }

    #[test]
    fn test_exact_pattern_beats_wildcard() {
        let mut registry = ExtractorRegistry::new();
        registry
            .register(Box::new(Fixed {
                name: "generic",
                patterns: vec!["audio/*".to_string()],
            }))
            .unwrap();
        registry
            .register(Box::new(Fixed {
                name: "mp3",
                patterns: vec!["audio/mpeg".to_string()],
            }))
            .unwrap();

        let mp3 = registry.extract(Path::new("/x.mp3"), "audio/mpeg").unwrap();
        let ogg = registry.extract(Path::new("/x.ogg"), "audio/ogg").unwrap();

        assert_eq!(mp3.get("test:module"), Some(&"mp3".into()));
        assert_eq!(ogg.get("test:module"), Some(&"generic".into()));
    }

    #[test]
    fn test_missing_extractor() {
        let registry = ExtractorRegistry::new();
        let result = registry.dispatch(Path::new("/x.bin"), "application/octet-stream");
        assert!(matches!(result, Err(ExtractError::NoExtractor { .. })));
    }

    #[test]
    fn test_panic_becomes_error_and_worker_survives() {
        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(Explodes)).unwrap();

        for _ in 0..2 {
            let result = registry.extract(Path::new("/x.png"), "image/png");
            assert!(matches!(result, Err(ExtractError::ExtractorPanicked { .. })));
        }
    }

    #[test]
    fn test_marker_tracks_module_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, "one\n").unwrap();
        let registry = ExtractorRegistry::with_builtin().unwrap();

        assert_eq!(registry.identity_for("text/plain"), extractor_identity("text", "1"));
        assert_eq!(
            registry.marker_for(&path, "text/plain"),
            extraction_marker(&extractor_identity("text", "1"), &path)
        );
        assert_ne!(
            registry.marker_for(&path, "text/plain"),
            registry.marker_for(&path, "image/png")
        );
    }

    #[test]
    fn test_marker_changes_when_file_is_edited() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, "one\n").unwrap();
        let identity = extractor_identity("text", "1");

        let before = extraction_marker(&identity, &path);
        assert_eq!(before, extraction_marker(&identity, &path));

        fs::write(&path, "one\ntwo\nthree\n").unwrap();
        assert_ne!(before, extraction_marker(&identity, &path));

        fs::remove_file(&path).unwrap();
        assert_ne!(before, extraction_marker(&identity, &path));
    }

    #[test]
    fn test_dispatch_marker_matches_registry() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, "words\n").unwrap();
        let registry = ExtractorRegistry::with_builtin().unwrap();

        let pending = registry.dispatch(&path, "text/plain").unwrap();
        assert_eq!(pending.marker(), registry.marker_for(&path, "text/plain"));
    }

    #[test]
    fn test_text_value_rendering_escapes() {
        let value = PropertyValue::from("say \"hi\"\n");
        assert_eq!(value.to_string(), "\"say \\\"hi\\\"\\n\"");
    }
}
