//! Reconciles raw backend events into a minimal notification stream.
//!
//! Rules applied per path:
//!
//! - created/changed are cached until the changes-done hint, except that
//!   backends which already coalesce writes get `Updated` immediately
//! - a deletion cancels a still-cached creation outright; otherwise it
//!   replaces whatever was cached and is flushed when the loop goes idle
//! - attribute changes, renames and moves with a known origin go out at once
//! - a directory that moves or disappears has its watches (and those of
//!   its descendants) detached; late events from those detached watches
//!   are dropped

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::backend::Backend;
use super::event::{Notification, RawEvent, RawEventKind};
use super::pending::{PendingCache, PendingEvent, PendingKind};
use super::table::WatchTable;

/// Per-path state machine turning [`RawEvent`]s into [`Notification`]s.
#[derive(Debug)]
pub struct EventReconciler {
    cache: PendingCache,
    coalesces_changed_events: bool,
    hint_timeout: Duration,
}

impl EventReconciler {
    pub fn new(backend: Backend, hint_timeout: Duration) -> Self {
        Self {
            cache: PendingCache::new(),
            coalesces_changed_events: backend.coalesces_changed_events(),
            hint_timeout,
        }
    }

    /// Feed one raw event, appending anything deliverable to `out`.
    pub fn process(
        &mut self,
        event: RawEvent,
        now: Instant,
        table: &mut WatchTable,
        out: &mut Vec<Notification>,
    ) {
        let RawEvent {
            kind,
            path,
            other,
            directory_hint,
        } = event;

        match kind {
            RawEventKind::Created => {
                let is_directory = classify(&path, directory_hint, table);
                self.on_created(path, is_directory, now, table, out);
            }
            RawEventKind::Changed => {
                let is_directory = classify(&path, directory_hint, table);
                self.on_changed(path, is_directory, now, out);
            }
            RawEventKind::ChangesDoneHint => {
                if let Some(pending) = self.cache.remove(&path) {
                    out.push(deliver(pending));
                }
            }
            RawEventKind::AttributeChanged => {
                let is_directory = classify(&path, directory_hint, table);
                out.push(Notification::AttributeUpdated { path, is_directory });
            }
            RawEventKind::Deleted => {
                let is_directory = classify(&path, directory_hint, table);
                self.on_deleted(path, is_directory, now, table);
            }
            RawEventKind::MovedIn => match other {
                Some(from) => self.on_moved(from, path, directory_hint, table, out),
                None => {
                    let is_directory = classify(&path, directory_hint, table);
                    self.on_created(path, is_directory, now, table, out);
                }
            },
            RawEventKind::MovedOut => {
                // With a known destination the moved-in half carries the move
                if other.is_none() {
                    let is_directory = classify(&path, directory_hint, table);
                    self.on_deleted(path, is_directory, now, table);
                }
            }
            RawEventKind::Renamed | RawEventKind::Moved => match other {
                Some(to) => self.on_moved(path, to, directory_hint, table, out),
                None => {
                    let is_directory = classify(&path, directory_hint, table);
                    self.on_deleted(path, is_directory, now, table);
                }
            },
            RawEventKind::PreUnmount | RawEventKind::Unmounted => {
                crate::debug_event!("reconciler", "ignored unmount", "{}", path.display());
            }
        }
    }

    /// Deliver cached events whose idle flush is due.
    pub fn flush_due(&mut self, now: Instant, out: &mut Vec<Notification>) {
        for pending in self.cache.take_due(now) {
            out.push(deliver(pending));
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.cache.next_deadline()
    }

    pub fn pending_len(&self) -> usize {
        self.cache.len()
    }

    fn on_created(
        &mut self,
        path: PathBuf,
        is_directory: bool,
        now: Instant,
        table: &mut WatchTable,
        out: &mut Vec<Notification>,
    ) {
        // Something exists here again; earlier detached watches are history
        table.clear_cancelled(&path);

        match self.cache.kind_of(&path) {
            Some(PendingKind::Deleted) => {
                // Keep the order the consumer sees: the old file went first
                if let Some(deleted) = self.cache.remove(&path) {
                    out.push(deliver(deleted));
                }
            }
            Some(_) => return,
            None => {}
        }

        // Directories and hint-less backends never get a changes-done hint
        let flush_at = if is_directory || self.coalesces_changed_events {
            now
        } else {
            now + self.hint_timeout
        };
        self.cache.insert_if_absent(
            PendingEvent::new(PendingKind::Created, path, is_directory).flush_at(flush_at),
        );
    }

    fn on_changed(
        &mut self,
        path: PathBuf,
        is_directory: bool,
        now: Instant,
        out: &mut Vec<Notification>,
    ) {
        if self.coalesces_changed_events {
            if self.cache.get(&path).is_none() {
                out.push(Notification::Updated { path, is_directory });
            }
            return;
        }

        self.cache.insert_if_absent(
            PendingEvent::new(PendingKind::Changed, path, is_directory)
                .flush_at(now + self.hint_timeout),
        );
    }

    fn on_deleted(
        &mut self,
        path: PathBuf,
        is_directory: bool,
        now: Instant,
        table: &mut WatchTable,
    ) {
        // The directory's own watch and its parent's both report the
        // removal; whichever comes second finds the watch already detached
        if !table.is_active(&path) && table.clear_cancelled(&path) {
            crate::debug_event!("reconciler", "duplicate delete", "{}", path.display());
            return;
        }

        if is_directory {
            table.cancel_recursive(&path);
        }

        match self.cache.remove(&path) {
            Some(pending) if pending.kind == PendingKind::Created => {
                crate::debug_event!(
                    "reconciler",
                    "created and deleted before settling",
                    "{}",
                    path.display()
                );
                return;
            }
            Some(stale) => {
                crate::debug_event!(
                    "reconciler",
                    "dropped stale",
                    "{:?} {}",
                    stale.kind,
                    path.display()
                );
            }
            None => {}
        }

        self.cache
            .replace(PendingEvent::new(PendingKind::Deleted, path, is_directory).flush_at(now));
    }

    fn on_moved(
        &mut self,
        from: PathBuf,
        to: PathBuf,
        directory_hint: Option<bool>,
        table: &mut WatchTable,
        out: &mut Vec<Notification>,
    ) {
        let is_directory = match std::fs::symlink_metadata(&to) {
            Ok(meta) => meta.is_dir(),
            Err(_) => classify(&from, directory_hint, table),
        };
        let source_monitored = table.parent_is_active(&from) || table.is_active(&from);

        table.clear_cancelled(&to);

        // Whatever was still pending at the destination happened before this
        if let Some(earlier) = self.cache.remove(&to) {
            out.push(deliver(earlier));
        }

        let mut announce_move = true;
        match self.cache.remove(&from) {
            Some(pending) if pending.kind == PendingKind::Deleted => {
                // The old directory watch firing as it is replaced
                crate::debug_event!("reconciler", "dropped stale delete", "{}", from.display());
            }
            Some(pending) if pending.kind == PendingKind::Created => {
                // Never announced under its old name
                out.push(Notification::Created {
                    path: to.clone(),
                    is_directory,
                });
                announce_move = false;
            }
            Some(pending) => out.push(deliver(pending)),
            None => {}
        }

        if is_directory {
            table.cancel_recursive(&from);
        }

        if announce_move {
            out.push(Notification::Moved {
                from,
                to,
                is_directory,
                source_monitored,
            });
        }
    }
}

/// Whether `path` is a directory, asking the filesystem first.
///
/// Once the path is gone the backend's hint and the watch table are all
/// that is left: a path that had a watch of its own was a directory.
fn classify(path: &Path, hint: Option<bool>, table: &WatchTable) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.is_dir(),
        Err(_) => hint == Some(true) || table.is_active(path) || table.was_cancelled(path),
    }
}

fn deliver(pending: PendingEvent) -> Notification {
    let PendingEvent {
        kind,
        path,
        is_directory,
        ..
    } = pending;

    match kind {
        PendingKind::Created => Notification::Created { path, is_directory },
        PendingKind::Changed => Notification::Updated { path, is_directory },
        PendingKind::Deleted => Notification::Deleted { path, is_directory },
    }
}
