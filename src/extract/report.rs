//! Recorded extraction failures, queryable later by path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::ExtractResult;

/// Sink for extraction failures.
pub trait ErrorReporter: Send {
    fn report(&self, uri: &str, message: &str, extra: Option<&str>);

    /// Forget the failure for `uri`, e.g. after the file was removed.
    fn delete_report(&self, uri: &str);
}

/// One failed extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub uri: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// One JSON file per failed URI, named by the URI's SHA-256.
#[derive(Debug, Clone)]
pub struct ErrorReportStore {
    dir: PathBuf,
}

impl ErrorReportStore {
    pub fn open(dir: impl Into<PathBuf>) -> ExtractResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, uri: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    /// The failure recorded for `uri`, if any.
    pub fn lookup(&self, uri: &str) -> ExtractResult<Option<ErrorReport>> {
        match fs::read_to_string(self.record_path(uri)) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded failure, oldest first. Unreadable records are skipped.
    pub fn list(&self) -> ExtractResult<Vec<ErrorReport>> {
        let mut reports = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|json| {
                    serde_json::from_str::<ErrorReport>(&json).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!("[report] skipping {}: {e}", path.display()),
            }
        }

        reports.sort_by(|a, b| a.reported_at.cmp(&b.reported_at).then(a.uri.cmp(&b.uri)));
        Ok(reports)
    }

    fn write(&self, report: &ErrorReport) -> ExtractResult<()> {
        let json = serde_json::to_string_pretty(report)?;
        fs::write(self.record_path(&report.uri), json)?;
        Ok(())
    }
}

impl ErrorReporter for ErrorReportStore {
    fn report(&self, uri: &str, message: &str, extra: Option<&str>) {
        let report = ErrorReport {
            uri: uri.to_string(),
            message: message.to_string(),
            extra: extra.map(str::to_string),
            reported_at: Utc::now(),
        };

        if let Err(e) = self.write(&report) {
            tracing::error!("[report] failed to record error for {uri}: {e}");
        }
    }

    fn delete_report(&self, uri: &str) {
        match fs::remove_file(self.record_path(uri)) {
            Ok(()) => crate::debug_event!("report", "deleted", "{uri}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("[report] failed to delete report for {uri}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_lookup_delete() {
        let temp = TempDir::new().unwrap();
        let store = ErrorReportStore::open(temp.path().join("errors")).unwrap();

        store.report("file:///a.mp3", "truncated tag", Some("offset 42"));

        let report = store.lookup("file:///a.mp3").unwrap().unwrap();
        assert_eq!(report.message, "truncated tag");
        assert_eq!(report.extra.as_deref(), Some("offset 42"));
        assert!(store.lookup("file:///b.mp3").unwrap().is_none());

        store.delete_report("file:///a.mp3");
        assert!(store.lookup("file:///a.mp3").unwrap().is_none());

        // Deleting an absent report is a no-op
        store.delete_report("file:///a.mp3");
    }

    #[test]
    fn test_report_overwrites_previous() {
        let temp = TempDir::new().unwrap();
        let store = ErrorReportStore::open(temp.path()).unwrap();

        store.report("file:///a.ps", "first", None);
        store.report("file:///a.ps", "second", None);

        let reports = store.list().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "second");
    }

    #[test]
    fn test_list_skips_garbage() {
        let temp = TempDir::new().unwrap();
        let store = ErrorReportStore::open(temp.path()).unwrap();
        store.report("file:///a.jpg", "bad exif", None);
        store.report("file:///b.jpg", "bad exif", None);
        fs::write(temp.path().join("junk.json"), "{not json").unwrap();

        let uris: Vec<String> = store.list().unwrap().into_iter().map(|r| r.uri).collect();
        assert_eq!(uris.len(), 2);
        assert!(uris.contains(&"file:///a.jpg".to_string()));
    }
}
