//! Cache of not-yet-delivered events, one per path.
//!
//! A created or changed file is held until the backend says the write
//! burst settled; a deletion is held until the loop next goes idle so a
//! quick create/delete pair can cancel out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Logical kind of a cached event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Created,
    Changed,
    Deleted,
}

/// The most recent undelivered event for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: PendingKind,
    pub path: PathBuf,
    pub other: Option<PathBuf>,
    pub is_directory: bool,
    /// Flushed on the first idle pass at or after this instant.
    pub flush_at: Option<Instant>,
}

impl PendingEvent {
    pub fn new(kind: PendingKind, path: PathBuf, is_directory: bool) -> Self {
        Self {
            kind,
            path,
            other: None,
            is_directory,
            flush_at: None,
        }
    }

    pub fn flush_at(mut self, at: Instant) -> Self {
        self.flush_at = Some(at);
        self
    }
}

/// Pending events keyed by path.
#[derive(Debug, Default)]
pub struct PendingCache {
    entries: HashMap<PathBuf, PendingEvent>,
}

impl PendingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<&PendingEvent> {
        self.entries.get(path)
    }

    pub fn kind_of(&self, path: &Path) -> Option<PendingKind> {
        self.entries.get(path).map(|e| e.kind)
    }

    /// Cache `event` unless its path already has an entry.
    ///
    /// Returns whether the event was stored.
    pub fn insert_if_absent(&mut self, event: PendingEvent) -> bool {
        if self.entries.contains_key(&event.path) {
            return false;
        }
        self.entries.insert(event.path.clone(), event);
        true
    }

    /// Cache `event`, replacing whatever was pending for its path.
    pub fn replace(&mut self, event: PendingEvent) -> Option<PendingEvent> {
        self.entries.insert(event.path.clone(), event)
    }

    pub fn remove(&mut self, path: &Path) -> Option<PendingEvent> {
        self.entries.remove(path)
    }

    /// Take every entry whose flush time has come, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<PendingEvent> {
        let mut due = Vec::new();

        self.entries.retain(|_, event| match event.flush_at {
            Some(at) if at <= now => {
                due.push(event.clone());
                false
            }
            _ => true,
        });

        due.sort_by_key(|e| e.flush_at);
        due
    }

    /// Earliest scheduled flush.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.flush_at).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
