//! Desired set of watched directories.
//!
//! The registry is what callers see: it enforces the watch ceiling, keeps
//! the desired set stable while monitoring is disabled, and forwards every
//! change to the watcher thread as a blocking [`MonitorRequest`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::WatchResult;
use super::table::subtree;
use super::thread::{Handoff, MonitorRequest};

/// Directories the caller wants watched, capped at `limit`.
pub struct WatchRegistry {
    desired: BTreeSet<PathBuf>,
    limit: usize,
    ignored: usize,
    limit_warned: bool,
    enabled: bool,
    handoff: Arc<Handoff>,
}

impl WatchRegistry {
    pub(crate) fn new(handoff: Arc<Handoff>, limit: usize, enabled: bool) -> Self {
        Self {
            desired: BTreeSet::new(),
            limit,
            ignored: 0,
            limit_warned: false,
            enabled,
            handoff,
        }
    }

    /// Start watching `dir`.
    ///
    /// Returns `false` only when the ceiling is reached. A directory the
    /// backend refuses to watch still counts as added; the failure is logged.
    pub fn add(&mut self, dir: &Path) -> bool {
        if self.desired.contains(dir) {
            return true;
        }

        if self.desired.len() >= self.limit {
            self.ignored += 1;
            if !self.limit_warned {
                tracing::warn!(
                    "[monitor] watch limit of {} reached, not monitoring {} (further warnings suppressed)",
                    self.limit,
                    dir.display()
                );
                self.limit_warned = true;
            }
            return false;
        }

        if self.enabled {
            if let Err(e) = self.send(vec![MonitorRequest::add(vec![dir.to_path_buf()])]) {
                tracing::error!("[monitor] failed to add {}: {e}", dir.display());
                return false;
            }
        }

        self.desired.insert(dir.to_path_buf());
        true
    }

    /// Stop watching `dir` itself. Descendants are left alone.
    pub fn remove(&mut self, dir: &Path) -> bool {
        if !self.desired.remove(dir) {
            return false;
        }
        self.limit_warned = false;

        if self.enabled {
            if let Err(e) = self.send(vec![MonitorRequest::remove(vec![dir.to_path_buf()])]) {
                tracing::error!("[monitor] failed to remove {}: {e}", dir.display());
            }
        }
        true
    }

    /// Stop watching every directory below `dir`, and `dir` itself when
    /// `include_top` is set.
    pub fn remove_recursive(&mut self, dir: &Path, include_top: bool) -> bool {
        let doomed: Vec<PathBuf> = subtree(&self.desired, dir)
            .filter(|path| include_top || path.as_path() != dir)
            .cloned()
            .collect();

        if doomed.is_empty() {
            return false;
        }

        for path in &doomed {
            self.desired.remove(path);
        }
        self.limit_warned = false;

        crate::debug_event!(
            "monitor",
            "remove recursive",
            "{} directories under {}",
            doomed.len(),
            dir.display()
        );

        if self.enabled {
            if let Err(e) = self.send(vec![MonitorRequest::remove(doomed)]) {
                tracing::error!("[monitor] failed to remove {}: {e}", dir.display());
            }
        }
        true
    }

    /// Re-key `old` and its subtree under `new`.
    ///
    /// New watches are installed before the old ones are released, and the
    /// call returns once both steps are applied.
    pub fn move_path(&mut self, old: &Path, new: &Path) -> bool {
        let moved: Vec<PathBuf> = subtree(&self.desired, old).cloned().collect();
        if moved.is_empty() {
            return false;
        }

        let rewritten: Vec<PathBuf> = moved
            .iter()
            .filter_map(|path| path.strip_prefix(old).ok())
            .map(|relative| rebase(new, relative))
            .collect();

        for path in &moved {
            self.desired.remove(path);
        }
        self.desired.extend(rewritten.iter().cloned());

        crate::debug_event!(
            "monitor",
            "move",
            "{} directories {} -> {}",
            moved.len(),
            old.display(),
            new.display()
        );

        if self.enabled {
            let stale: Vec<PathBuf> = moved
                .into_iter()
                .filter(|path| !self.desired.contains(path))
                .collect();
            let requests = vec![MonitorRequest::add(rewritten), MonitorRequest::remove(stale)];
            if let Err(e) = self.send(requests) {
                tracing::error!("[monitor] failed to move {}: {e}", old.display());
            }
        }
        true
    }

    /// Turn native watching on or off. The desired set survives either way.
    pub fn set_enabled(&mut self, enabled: bool) -> WatchResult<()> {
        if self.enabled == enabled {
            return Ok(());
        }
        self.enabled = enabled;

        let paths: Vec<PathBuf> = self.desired.iter().cloned().collect();
        crate::log_event!(
            "monitor",
            if enabled { "enabled" } else { "disabled" },
            "{} directories",
            paths.len()
        );

        let request = if enabled {
            MonitorRequest::add(paths)
        } else {
            MonitorRequest::remove(paths)
        };
        self.send(vec![request])
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.desired.contains(dir)
    }

    pub fn count(&self) -> usize {
        self.desired.len()
    }

    /// Directories turned away by the ceiling since startup.
    pub fn ignored_count(&self) -> usize {
        self.ignored
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.desired.iter().map(PathBuf::as_path)
    }

    fn send(&self, requests: Vec<MonitorRequest>) -> WatchResult<()> {
        let requests: Vec<MonitorRequest> = requests
            .into_iter()
            .filter(|request| !request.paths.is_empty())
            .collect();
        self.handoff.submit(requests)
    }
}

fn rebase(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::watcher::monitor::FileMonitor;
    use crate::watcher::table::NativeWatcher;
    use crate::watcher::table::tests::ScriptedWatcher;

    fn monitor_with(native: ScriptedWatcher, limit: usize) -> FileMonitor {
        let config = MonitorConfig {
            fixed_limit: Some(limit),
            ..MonitorConfig::default()
        };
        FileMonitor::builder()
            .config(config)
            .native(move |_events| Ok(Box::new(native) as Box<dyn NativeWatcher>))
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let native = ScriptedWatcher::default();
        let calls = native.calls.clone();
        let mut monitor = monitor_with(native, 10);

        assert!(monitor.add(Path::new("/w/a")));
        assert!(monitor.add(Path::new("/w/a")));

        assert_eq!(monitor.count(), 1);
        assert_eq!(calls.lock().as_slice(), ["watch /w/a"]);
    }

    #[test]
    fn test_ceiling_rejects_and_counts() {
        let mut monitor = monitor_with(ScriptedWatcher::default(), 2);

        assert!(monitor.add(Path::new("/w/a")));
        assert!(monitor.add(Path::new("/w/b")));
        assert!(!monitor.add(Path::new("/w/c")));
        assert!(!monitor.add(Path::new("/w/d")));

        assert_eq!(monitor.count(), 2);
        assert_eq!(monitor.ignored_count(), 2);

        // Room again after a removal; the ignored tally never shrinks
        assert!(monitor.remove(Path::new("/w/a")));
        assert!(monitor.add(Path::new("/w/c")));
        assert_eq!(monitor.ignored_count(), 2);
    }

    #[test]
    fn test_refused_watch_still_counts_as_added() {
        let native = ScriptedWatcher::default();
        native.refuse.lock().insert(PathBuf::from("/w/locked"));
        let mut monitor = monitor_with(native, 10);

        assert!(monitor.add(Path::new("/w/locked")));
        assert!(monitor.is_watched(Path::new("/w/locked")));
    }

    #[test]
    fn test_remove_leaves_descendants() {
        let mut monitor = monitor_with(ScriptedWatcher::default(), 10);
        monitor.add(Path::new("/w/a"));
        monitor.add(Path::new("/w/a/b"));

        assert!(monitor.remove(Path::new("/w/a")));
        assert!(!monitor.remove(Path::new("/w/a")));
        assert!(monitor.is_watched(Path::new("/w/a/b")));
    }

    #[test]
    fn test_remove_recursive_top_optional() {
        let mut monitor = monitor_with(ScriptedWatcher::default(), 10);
        for dir in ["/w/a", "/w/a/b", "/w/a/b/c", "/w/ab"] {
            monitor.add(Path::new(dir));
        }

        assert!(monitor.remove_recursive(Path::new("/w/a"), false));
        assert!(monitor.is_watched(Path::new("/w/a")));
        assert!(!monitor.is_watched(Path::new("/w/a/b/c")));
        assert!(monitor.is_watched(Path::new("/w/ab")));

        assert!(monitor.remove_recursive(Path::new("/w/a"), true));
        assert!(!monitor.is_watched(Path::new("/w/a")));
        assert!(!monitor.remove_recursive(Path::new("/w/a"), true));
        assert_eq!(monitor.count(), 1);
    }

    #[test]
    fn test_move_adds_before_removing() {
        let native = ScriptedWatcher::default();
        let calls = native.calls.clone();
        let mut monitor = monitor_with(native, 10);
        monitor.add(Path::new("/w/a"));
        monitor.add(Path::new("/w/a/b"));
        calls.lock().clear();

        assert!(monitor.move_path(Path::new("/w/a"), Path::new("/w/z")));

        let watched: Vec<&Path> = monitor.watched().collect();
        assert_eq!(watched, vec![Path::new("/w/z"), Path::new("/w/z/b")]);
        assert_eq!(
            calls.lock().as_slice(),
            ["watch /w/z", "watch /w/z/b", "unwatch /w/a", "unwatch /w/a/b"]
        );
    }

    #[test]
    fn test_move_there_and_back_restores_set() {
        let mut monitor = monitor_with(ScriptedWatcher::default(), 10);
        for dir in ["/w/a", "/w/a/b", "/w/c"] {
            monitor.add(Path::new(dir));
        }
        let before: Vec<PathBuf> = monitor.watched().map(Path::to_path_buf).collect();

        assert!(monitor.move_path(Path::new("/w/a"), Path::new("/w/x")));
        assert!(monitor.move_path(Path::new("/w/x"), Path::new("/w/a")));

        let after: Vec<PathBuf> = monitor.watched().map(Path::to_path_buf).collect();
        assert_eq!(before, after);
        assert!(!monitor.move_path(Path::new("/w/missing"), Path::new("/w/y")));
    }

    #[test]
    fn test_disable_keeps_desired_set() {
        let native = ScriptedWatcher::default();
        let calls = native.calls.clone();
        let mut monitor = monitor_with(native, 10);
        monitor.add(Path::new("/w/a"));

        monitor.set_enabled(false).unwrap();
        assert!(monitor.is_watched(Path::new("/w/a")));

        // Bookkeeping only while disabled
        assert!(monitor.add(Path::new("/w/b")));
        assert_eq!(calls.lock().as_slice(), ["watch /w/a", "unwatch /w/a"]);

        monitor.set_enabled(true).unwrap();
        assert_eq!(
            calls.lock().as_slice(),
            ["watch /w/a", "unwatch /w/a", "watch /w/a", "watch /w/b"]
        );
    }
}
