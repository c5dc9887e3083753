//! Native monitor backend capabilities.
//!
//! Each backend carries its own watch-ceiling discovery strategy and
//! whether it already coalesces write bursts, which decides how the
//! reconciler treats plain "changed" events.

use notify::{RecommendedWatcher, Watcher, WatcherKind};
use std::path::Path;

/// Ceiling used when the kernel limit cannot be read.
const DEFAULT_INOTIFY_LIMIT: usize = 8192;
/// Conservative ceiling for descriptor-per-directory backends.
const KQUEUE_LIMIT: usize = 400;
/// Guessed ceiling for backends with no per-directory cost we can query.
const UNBOUNDED_BACKEND_LIMIT: usize = 8192;

const INOTIFY_MAX_WATCHES: &str = "/proc/sys/fs/inotify/max_user_watches";

/// The native notification backend in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Inotify,
    Kqueue,
    FsEvents,
    Windows,
    Poll,
}

impl Backend {
    /// Backend picked by `notify::recommended_watcher` on this platform.
    pub fn recommended() -> Self {
        Self::from_kind(RecommendedWatcher::kind())
    }

    pub fn from_kind(kind: WatcherKind) -> Self {
        match kind {
            WatcherKind::Inotify => Backend::Inotify,
            WatcherKind::Kqueue => Backend::Kqueue,
            WatcherKind::Fsevent => Backend::FsEvents,
            WatcherKind::ReadDirectoryChangesWatcher => Backend::Windows,
            _ => Backend::Poll,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Backend::Inotify => "inotify",
            Backend::Kqueue => "kqueue",
            Backend::FsEvents => "fsevents",
            Backend::Windows => "windows",
            Backend::Poll => "poll",
        }
    }

    /// Whether the backend reports a write burst as a single change.
    ///
    /// Only inotify emits a close-after-write hint; everywhere else a
    /// "changed" event is already the whole story and is delivered
    /// immediately.
    pub fn coalesces_changed_events(self) -> bool {
        !matches!(self, Backend::Inotify)
    }

    /// Maximum number of directory watches to hold.
    ///
    /// inotify watches come out of a per-user table shared with every
    /// other process, so `reserve` of them are left alone.
    pub fn watch_limit(self, reserve: usize) -> usize {
        match self {
            Backend::Inotify => {
                read_limit(Path::new(INOTIFY_MAX_WATCHES))
                    .unwrap_or(DEFAULT_INOTIFY_LIMIT)
                    .saturating_sub(reserve)
            }
            Backend::Kqueue | Backend::Poll => KQUEUE_LIMIT,
            Backend::FsEvents | Backend::Windows => UNBOUNDED_BACKEND_LIMIT,
        }
    }
}

fn read_limit(path: &Path) -> Option<usize> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse().ok(),
        Err(e) => {
            tracing::debug!("[monitor] cannot read {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_only_inotify_caches_changes() {
        assert!(!Backend::Inotify.coalesces_changed_events());
        assert!(Backend::Kqueue.coalesces_changed_events());
        assert!(Backend::FsEvents.coalesces_changed_events());
        assert!(Backend::Poll.coalesces_changed_events());
    }

    #[test]
    fn test_fixed_limits_ignore_reserve() {
        assert_eq!(Backend::Kqueue.watch_limit(500), KQUEUE_LIMIT);
        assert_eq!(Backend::Windows.watch_limit(500), UNBOUNDED_BACKEND_LIMIT);
    }

    #[test]
    fn test_inotify_limit_never_underflows() {
        assert_eq!(Backend::Inotify.watch_limit(usize::MAX), 0);
    }

    #[test]
    fn test_read_limit_parses_proc_format() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("max_user_watches");
        fs::write(&file, "65536\n").unwrap();
        assert_eq!(read_limit(&file), Some(65536));

        fs::write(&file, "garbage").unwrap();
        assert_eq!(read_limit(&file), None);
        assert_eq!(read_limit(&dir.path().join("missing")), None);
    }
}
