//! Error types for metadata extraction.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Cannot create crash-recovery directory {path}: {source}")]
    PersistenceDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write crash-recovery marker for {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No extractor handles {mime}")]
    NoExtractor { mime: String },

    #[error("Extractor {module} failed on {path}: {reason}")]
    Extractor {
        module: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Extractor {module} panicked on {path}")]
    ExtractorPanicked { module: String, path: PathBuf },

    #[error("Extractor {module} is no longer running")]
    WorkerGone { module: String },

    #[error("Cannot read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExtractResult<T> = Result<T, ExtractError>;
