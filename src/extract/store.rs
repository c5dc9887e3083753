//! Store updates produced by extraction, and sinks that accept them.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{ExtractError, ExtractResult};
use super::extractor::ResourceGraph;

const MARKER_PROPERTY: &str = "nie:extractorHash";

/// Everything the store must learn about one processed file.
///
/// `graph` is `None` for failed extractions; the marker is still written
/// so the file is not retried on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub uri: String,
    pub marker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<ResourceGraph>,
}

impl StoreUpdate {
    pub fn extracted(uri: impl Into<String>, marker: impl Into<String>, graph: ResourceGraph) -> Self {
        Self {
            uri: uri.into(),
            marker: marker.into(),
            graph: Some(graph),
        }
    }

    pub fn failed(uri: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            marker: marker.into(),
            graph: None,
        }
    }

    /// SPARQL update replacing the marker and inserting the graph.
    pub fn render(&self) -> String {
        let subject = format!("<{}>", escape_iri(&self.uri));
        let marker = format!("\"{}\"", self.marker);

        let mut statement = format!(
            "DELETE {{ {subject} {MARKER_PROPERTY} ?h }} WHERE {{ {subject} {MARKER_PROPERTY} ?h }} ;\nINSERT DATA {{ {subject}"
        );

        let mut clauses = Vec::new();
        if let Some(graph) = &self.graph {
            if !graph.types.is_empty() {
                clauses.push(format!("a {}", graph.types.join(", ")));
            }
            for (property, value) in &graph.properties {
                clauses.push(format!("{property} {value}"));
            }
        }
        clauses.push(format!("{MARKER_PROPERTY} {marker}"));

        statement.push(' ');
        statement.push_str(&clauses.join(" ; "));
        statement.push_str(" . }");
        statement
    }
}

fn escape_iri(uri: &str) -> String {
    let mut out = String::with_capacity(uri.len());
    for c in uri.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '<' => out.push_str("%3C"),
            '>' => out.push_str("%3E"),
            '"' => out.push_str("%22"),
            '{' => out.push_str("%7B"),
            '}' => out.push_str("%7D"),
            '\\' => out.push_str("%5C"),
            c if c.is_control() => out.push_str(&format!("%{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Destination for store updates.
pub trait StoreSink: Send {
    fn apply(&mut self, update: StoreUpdate) -> ExtractResult<()>;

    /// Marker last written for `uri`.
    fn marker(&self, uri: &str) -> Option<String>;

    fn is_up_to_date(&self, uri: &str, marker: &str) -> bool {
        self.marker(uri).as_deref() == Some(marker)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    #[serde(flatten)]
    update: StoreUpdate,
    sparql: String,
}

/// Append-only journal of updates, one JSON object per line.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: File,
    markers: HashMap<String, String>,
}

impl JsonlStore {
    /// Open the journal, replaying existing lines to learn current markers.
    pub fn open(path: impl Into<PathBuf>) -> ExtractResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut markers = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalLine>(&line) {
                    Ok(entry) => {
                        markers.insert(entry.update.uri, entry.update.marker);
                    }
                    Err(e) => tracing::warn!(
                        "[store] {}:{} unreadable: {e}",
                        path.display(),
                        number + 1
                    ),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        crate::debug_event!(
            "store",
            "opened",
            "{} ({} files)",
            path.display(),
            markers.len()
        );

        Ok(Self {
            path,
            file,
            markers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Snapshot of uri to marker, for skipping up-to-date files elsewhere.
    pub fn markers(&self) -> HashMap<String, String> {
        self.markers.clone()
    }
}

impl StoreSink for JsonlStore {
    fn apply(&mut self, update: StoreUpdate) -> ExtractResult<()> {
        let sparql = update.render();
        let line = JournalLine { update, sparql };
        let json = serde_json::to_string(&line)?;

        writeln!(self.file, "{json}").map_err(|e| ExtractError::Store(e.to_string()))?;
        self.markers.insert(line.update.uri, line.update.marker);
        Ok(())
    }

    fn marker(&self, uri: &str) -> Option<String> {
        self.markers.get(uri).cloned()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    updates: Vec<StoreUpdate>,
    markers: HashMap<String, String>,
}

/// In-memory sink. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StoreUpdate> {
        self.inner.lock().updates.clone()
    }
}

impl StoreSink for MemoryStore {
    fn apply(&mut self, update: StoreUpdate) -> ExtractResult<()> {
        let mut inner = self.inner.lock();
        inner
            .markers
            .insert(update.uri.clone(), update.marker.clone());
        inner.updates.push(update);
        Ok(())
    }

    fn marker(&self, uri: &str) -> Option<String> {
        self.inner.lock().markers.get(uri).cloned()
    }
}
