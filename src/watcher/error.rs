//! Error types for the directory watch multiplexer.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Failed to spawn watcher thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("Watcher thread is no longer running")]
    ThreadGone,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

/// Result type for watcher operations.
pub type WatchResult<T> = Result<T, WatchError>;
