//! Raw backend events and the normalized notifications delivered to consumers.
//!
//! `notify` reports renames in halves tied together by a tracker cookie.
//! [`RawEventTranslator`] turns its events into the raw event vocabulary the
//! reconciler works with, pairing rename halves along the way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind};

/// Raw event kinds as a directory-watching backend reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    Created,
    Changed,
    ChangesDoneHint,
    AttributeChanged,
    Deleted,
    /// Arrived in a watched directory; `other` is the origin if known.
    MovedIn,
    /// Left a watched directory; `other` is the destination if known.
    MovedOut,
    /// Renamed within one directory; `other` is the new path.
    Renamed,
    /// Combined move from backends that do not split it; `other` is the destination.
    Moved,
    PreUnmount,
    Unmounted,
}

/// One event from the backend, before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub other: Option<PathBuf>,
    /// Whether the backend said the subject is a directory.
    pub directory_hint: Option<bool>,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            other: None,
            directory_hint: None,
        }
    }

    pub fn with_other(mut self, other: impl Into<PathBuf>) -> Self {
        self.other = Some(other.into());
        self
    }

    pub fn with_directory_hint(mut self, is_directory: bool) -> Self {
        self.directory_hint = Some(is_directory);
        self
    }
}

/// A reconciled change, as delivered to the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Created {
        path: PathBuf,
        is_directory: bool,
    },
    Updated {
        path: PathBuf,
        is_directory: bool,
    },
    AttributeUpdated {
        path: PathBuf,
        is_directory: bool,
    },
    Deleted {
        path: PathBuf,
        is_directory: bool,
    },
    Moved {
        from: PathBuf,
        to: PathBuf,
        is_directory: bool,
        /// The origin's directory was watched, so the consumer may already
        /// know about `from`.
        source_monitored: bool,
    },
}

impl Notification {
    /// The path the notification is about (the destination for moves).
    pub fn path(&self) -> &Path {
        match self {
            Notification::Created { path, .. }
            | Notification::Updated { path, .. }
            | Notification::AttributeUpdated { path, .. }
            | Notification::Deleted { path, .. } => path,
            Notification::Moved { to, .. } => to,
        }
    }

    pub fn is_directory(&self) -> bool {
        match self {
            Notification::Created { is_directory, .. }
            | Notification::Updated { is_directory, .. }
            | Notification::AttributeUpdated { is_directory, .. }
            | Notification::Deleted { is_directory, .. }
            | Notification::Moved { is_directory, .. } => *is_directory,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Notification::Created { .. } => "created",
            Notification::Updated { .. } => "updated",
            Notification::AttributeUpdated { .. } => "attribute-updated",
            Notification::Deleted { .. } => "deleted",
            Notification::Moved { .. } => "moved",
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let suffix = if self.is_directory() { "/" } else { "" };
        match self {
            Notification::Moved { from, to, .. } => write!(
                f,
                "{} {}{suffix} -> {}{suffix}",
                self.kind_name(),
                from.display(),
                to.display()
            ),
            other => write!(f, "{} {}{suffix}", other.kind_name(), other.path().display()),
        }
    }
}

/// Converts `notify` events into [`RawEvent`]s.
///
/// Rename halves carrying the same tracker are paired into a single
/// renamed/moved-in event. The combined event inotify sends after the
/// second half is dropped. A lone "from" half becomes moved-out once the
/// pairing window passes.
#[derive(Debug)]
pub struct RawEventTranslator {
    pairing_window: Duration,
    /// tracker -> (origin, seen at)
    unpaired_from: HashMap<usize, (PathBuf, Instant)>,
    /// Trackers already emitted whose combined event may still arrive.
    paired: HashMap<usize, Instant>,
}

impl RawEventTranslator {
    pub fn new(pairing_window: Duration) -> Self {
        Self {
            pairing_window,
            unpaired_from: HashMap::new(),
            paired: HashMap::new(),
        }
    }

    pub fn translate(&mut self, event: Event, now: Instant) -> Vec<RawEvent> {
        let tracker = event.tracker();
        let mut raw = Vec::new();

        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    raw.push(with_hint(
                        RawEvent::new(RawEventKind::Created, path),
                        create_hint(kind),
                    ));
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    raw.push(with_hint(
                        RawEvent::new(RawEventKind::Deleted, path),
                        remove_hint(kind),
                    ));
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                for path in event.paths {
                    raw.push(RawEvent::new(RawEventKind::AttributeChanged, path));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.translate_rename(mode, event.paths, tracker, now, &mut raw);
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    raw.push(RawEvent::new(RawEventKind::Changed, path));
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in event.paths {
                    raw.push(RawEvent::new(RawEventKind::ChangesDoneHint, path));
                }
            }
            EventKind::Access(_) => {}
            EventKind::Any | EventKind::Other => {
                crate::debug_event!("translator", "ignored", "{:?} {:?}", event.kind, event.paths);
            }
        }

        raw
    }

    fn translate_rename(
        &mut self,
        mode: RenameMode,
        paths: Vec<PathBuf>,
        tracker: Option<usize>,
        now: Instant,
        raw: &mut Vec<RawEvent>,
    ) {
        match mode {
            RenameMode::From => {
                for path in paths {
                    match tracker {
                        Some(cookie) => {
                            self.unpaired_from.insert(cookie, (path, now));
                        }
                        None => raw.push(RawEvent::new(RawEventKind::MovedOut, path)),
                    }
                }
            }
            RenameMode::To => {
                for path in paths {
                    let origin = tracker.and_then(|cookie| {
                        self.unpaired_from.remove(&cookie).map(|(from, _)| {
                            self.paired.insert(cookie, now);
                            from
                        })
                    });
                    match origin {
                        Some(from) => raw.push(combined_move(from, path)),
                        None => raw.push(RawEvent::new(RawEventKind::MovedIn, path)),
                    }
                }
            }
            RenameMode::Both => {
                if let Some(cookie) = tracker {
                    if self.paired.remove(&cookie).is_some() {
                        return;
                    }
                    self.unpaired_from.remove(&cookie);
                }
                let mut paths = paths.into_iter();
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    raw.push(combined_move(from, to));
                }
            }
            RenameMode::Any | RenameMode::Other => {
                // No direction given: whichever side still exists is the destination
                for path in paths {
                    let kind = if path.symlink_metadata().is_ok() {
                        RawEventKind::MovedIn
                    } else {
                        RawEventKind::MovedOut
                    };
                    raw.push(RawEvent::new(kind, path));
                }
            }
        }
    }

    /// Emit rename halves whose partner never showed up.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<RawEvent> {
        let window = self.pairing_window;
        let mut raw = Vec::new();

        self.unpaired_from.retain(|_, (path, seen)| {
            if now.duration_since(*seen) >= window {
                raw.push(RawEvent::new(RawEventKind::MovedOut, std::mem::take(path)));
                false
            } else {
                true
            }
        });
        self.paired
            .retain(|_, seen| now.duration_since(*seen) < window);

        raw
    }

    /// When the next unpaired half expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unpaired_from
            .values()
            .map(|(_, seen)| *seen)
            .chain(self.paired.values().copied())
            .min()
            .map(|seen| seen + self.pairing_window)
    }
}

fn combined_move(from: PathBuf, to: PathBuf) -> RawEvent {
    if from.parent() == to.parent() {
        RawEvent::new(RawEventKind::Renamed, from).with_other(to)
    } else {
        RawEvent::new(RawEventKind::MovedIn, to).with_other(from)
    }
}

fn with_hint(event: RawEvent, hint: Option<bool>) -> RawEvent {
    match hint {
        Some(is_directory) => event.with_directory_hint(is_directory),
        None => event,
    }
}

fn create_hint(kind: CreateKind) -> Option<bool> {
    match kind {
        CreateKind::Folder => Some(true),
        CreateKind::File => Some(false),
        _ => None,
    }
}

fn remove_hint(kind: RemoveKind) -> Option<bool> {
    match kind {
        RemoveKind::Folder => Some(true),
        RemoveKind::File => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, MetadataKind};

    fn rename(mode: RenameMode, paths: &[&str], tracker: Option<usize>) -> Event {
        let mut event = Event::new(EventKind::Modify(ModifyKind::Name(mode)));
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        if let Some(cookie) = tracker {
            event = event.set_tracker(cookie);
        }
        event
    }

    #[test]
    fn test_basic_kinds() {
        let mut translator = RawEventTranslator::new(Duration::from_millis(100));
        let now = Instant::now();

        let created = translator.translate(
            Event::new(EventKind::Create(CreateKind::Folder)).add_path("/w/dir".into()),
            now,
        );
        assert_eq!(
            created,
            vec![RawEvent::new(RawEventKind::Created, "/w/dir").with_directory_hint(true)]
        );

        let changed = translator.translate(
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path("/w/f".into()),
            now,
        );
        assert_eq!(changed[0].kind, RawEventKind::Changed);

        let attrs = translator.translate(
            Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
                .add_path("/w/f".into()),
            now,
        );
        assert_eq!(attrs[0].kind, RawEventKind::AttributeChanged);

        let hint = translator.translate(
            Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
                .add_path("/w/f".into()),
            now,
        );
        assert_eq!(hint[0].kind, RawEventKind::ChangesDoneHint);

        let read = translator.translate(
            Event::new(EventKind::Access(AccessKind::Close(AccessMode::Read)))
                .add_path("/w/f".into()),
            now,
        );
        assert!(read.is_empty());
    }

    #[test]
    fn test_rename_halves_pair_into_one_event() {
        let mut translator = RawEventTranslator::new(Duration::from_millis(100));
        let now = Instant::now();

        assert!(
            translator
                .translate(rename(RenameMode::From, &["/w/a"], Some(7)), now)
                .is_empty()
        );
        let to = translator.translate(rename(RenameMode::To, &["/w/b"], Some(7)), now);
        assert_eq!(
            to,
            vec![RawEvent::new(RawEventKind::Renamed, "/w/a").with_other("/w/b")]
        );

        // The combined event that follows is redundant
        let both = translator.translate(rename(RenameMode::Both, &["/w/a", "/w/b"], Some(7)), now);
        assert!(both.is_empty());
        assert!(translator.flush_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_cross_directory_rename_is_moved_in_with_origin() {
        let mut translator = RawEventTranslator::new(Duration::from_millis(100));
        let now = Instant::now();

        translator.translate(rename(RenameMode::From, &["/w/x/a"], Some(3)), now);
        let to = translator.translate(rename(RenameMode::To, &["/w/y/a"], Some(3)), now);
        assert_eq!(
            to,
            vec![RawEvent::new(RawEventKind::MovedIn, "/w/y/a").with_other("/w/x/a")]
        );
    }

    #[test]
    fn test_unpaired_from_expires_as_moved_out() {
        let mut translator = RawEventTranslator::new(Duration::from_millis(100));
        let now = Instant::now();

        translator.translate(rename(RenameMode::From, &["/w/gone"], Some(9)), now);
        assert_eq!(translator.next_deadline(), Some(now + Duration::from_millis(100)));
        assert!(translator.flush_expired(now + Duration::from_millis(50)).is_empty());

        let expired = translator.flush_expired(now + Duration::from_millis(100));
        assert_eq!(expired, vec![RawEvent::new(RawEventKind::MovedOut, "/w/gone")]);
        assert_eq!(translator.next_deadline(), None);
    }

    #[test]
    fn test_unpaired_to_is_moved_in_without_origin() {
        let mut translator = RawEventTranslator::new(Duration::from_millis(100));
        let to = translator.translate(rename(RenameMode::To, &["/w/new"], Some(11)), Instant::now());
        assert_eq!(to, vec![RawEvent::new(RawEventKind::MovedIn, "/w/new")]);
    }

    #[test]
    fn test_display() {
        let moved = Notification::Moved {
            from: "/a".into(),
            to: "/b".into(),
            is_directory: true,
            source_monitored: true,
        };
        assert_eq!(moved.to_string(), "moved /a/ -> /b/");
        assert_eq!(moved.path(), Path::new("/b"));

        let deleted = Notification::Deleted {
            path: "/f".into(),
            is_directory: false,
        };
        assert_eq!(deleted.to_string(), "deleted /f");
    }
}
