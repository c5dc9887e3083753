//! Native watch handles, owned by the watcher thread.
//!
//! Nothing outside the watcher thread touches a [`WatchTable`]; other
//! threads ask for changes through [`MonitorRequest`](super::thread::MonitorRequest)s.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

use super::backend::Backend;
use super::error::{WatchError, WatchResult};

/// A backend able to subscribe to changes of single directories.
pub trait NativeWatcher: Send {
    /// Which backend this is, for capability decisions.
    fn backend(&self) -> Backend;

    /// Start receiving events for the direct children of `dir`.
    fn watch(&mut self, dir: &Path) -> WatchResult<()>;

    /// Stop receiving events for `dir`.
    fn unwatch(&mut self, dir: &Path) -> WatchResult<()>;
}

/// [`NativeWatcher`] backed by `notify`'s recommended watcher.
pub struct NotifyWatcher {
    inner: RecommendedWatcher,
    backend: Backend,
}

impl NotifyWatcher {
    /// Create the watcher, forwarding every raw event into `events`.
    pub fn new(events: Sender<notify::Result<Event>>) -> WatchResult<Self> {
        let inner = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = events.send(res);
        })?;

        Ok(Self {
            inner,
            backend: Backend::recommended(),
        })
    }
}

impl NativeWatcher for NotifyWatcher {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn watch(&mut self, dir: &Path) -> WatchResult<()> {
        self.inner
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })
    }

    fn unwatch(&mut self, dir: &Path) -> WatchResult<()> {
        self.inner
            .unwatch(dir)
            .map_err(|e| WatchError::PathWatchFailed {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// `root` and everything below it in an ordered path set.
pub(crate) fn subtree<'a>(
    set: &'a BTreeSet<PathBuf>,
    root: &'a Path,
) -> impl Iterator<Item = &'a PathBuf> + 'a {
    set.range(root.to_path_buf()..)
        .take_while(move |p| p.starts_with(root))
}

/// Active native watches plus the ones detached after a directory went away.
pub struct WatchTable {
    native: Box<dyn NativeWatcher>,
    active: BTreeSet<PathBuf>,
    /// Tops of subtrees detached because the directory itself moved or
    /// vanished. A late event for one of these is stale. Consuming a mark
    /// also drops every mark below it.
    cancelled: BTreeSet<PathBuf>,
}

impl WatchTable {
    pub fn new(native: Box<dyn NativeWatcher>) -> Self {
        Self {
            native,
            active: BTreeSet::new(),
            cancelled: BTreeSet::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.native.backend()
    }

    /// Install a watch on `dir`. At most one handle exists per path.
    ///
    /// A failure is logged and leaves the path unmonitored.
    pub fn add(&mut self, dir: &Path) -> bool {
        if self.active.contains(dir) {
            return true;
        }
        self.clear_cancelled(dir);

        match self.native.watch(dir) {
            Ok(()) => {
                crate::debug_event!("monitor", "watching", "{}", dir.display());
                self.active.insert(dir.to_path_buf());
                true
            }
            Err(e) => {
                tracing::warn!("[monitor] {e}");
                false
            }
        }
    }

    /// Drop the watch on `dir`, if any.
    pub fn remove(&mut self, dir: &Path) -> bool {
        if !self.active.remove(dir) {
            return false;
        }
        self.release(dir);
        crate::debug_event!("monitor", "unwatched", "{}", dir.display());
        true
    }

    /// Detach every watch at or below `dir`, remembering `dir` as cancelled.
    pub fn cancel_recursive(&mut self, dir: &Path) -> usize {
        let doomed: Vec<PathBuf> = subtree(&self.active, dir).cloned().collect();

        for path in &doomed {
            self.active.remove(path);
            self.release(path);
        }
        if !doomed.is_empty() {
            self.cancelled.insert(dir.to_path_buf());
        }

        if !doomed.is_empty() {
            crate::debug_event!(
                "monitor",
                "cancelled",
                "{} watches under {}",
                doomed.len(),
                dir.display()
            );
        }
        doomed.len()
    }

    /// Forget cancelled marks at or below `dir`; returns whether `dir`
    /// itself was marked.
    pub fn clear_cancelled(&mut self, dir: &Path) -> bool {
        let below: Vec<PathBuf> = subtree(&self.cancelled, dir).cloned().collect();
        for path in &below {
            self.cancelled.remove(path);
        }
        below.first().is_some_and(|first| first == dir)
    }

    /// Number of detached subtrees still waiting for their own event.
    pub fn cancelled_len(&self) -> usize {
        self.cancelled.len()
    }

    pub fn is_active(&self, dir: &Path) -> bool {
        self.active.contains(dir)
    }

    pub fn was_cancelled(&self, dir: &Path) -> bool {
        self.cancelled.contains(dir)
    }

    /// Whether events for `path` come from a watched parent directory.
    pub fn parent_is_active(&self, path: &Path) -> bool {
        path.parent().is_some_and(|parent| self.active.contains(parent))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &Path> {
        self.active.iter().map(PathBuf::as_path)
    }

    fn release(&mut self, dir: &Path) {
        // The kernel drops watches of deleted directories on its own
        if let Err(e) = self.native.unwatch(dir) {
            crate::debug_event!("monitor", "unwatch failed", "{e}");
        }
    }
}
