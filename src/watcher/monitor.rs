//! Public face of the change monitor.

use std::path::Path;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::Event;

use crate::config::MonitorConfig;

use super::backend::Backend;
use super::error::WatchResult;
use super::event::Notification;
use super::registry::WatchRegistry;
use super::table::{NativeWatcher, NotifyWatcher};
use super::thread::WatcherThread;

type NativeFactory = Box<
    dyn FnOnce(Sender<notify::Result<Event>>) -> WatchResult<Box<dyn NativeWatcher>> + Send,
>;

/// Watches directories on a background thread and hands out reconciled
/// [`Notification`]s.
///
/// Dropping the monitor stops the thread; pending events are discarded.
pub struct FileMonitor {
    registry: WatchRegistry,
    notifications: Receiver<Notification>,
    thread: WatcherThread,
}

impl FileMonitor {
    pub fn builder() -> FileMonitorBuilder {
        FileMonitorBuilder::new()
    }

    /// Monitor using the platform's recommended backend.
    pub fn new(config: &MonitorConfig) -> WatchResult<Self> {
        Self::builder().config(config.clone()).build()
    }

    pub fn backend(&self) -> Backend {
        self.thread.backend()
    }

    /// Channel the reconciled notifications arrive on, in emission order.
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    /// Next notification, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.notifications.recv_timeout(timeout).ok()
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn add(&mut self, dir: &Path) -> bool {
        self.registry.add(dir)
    }

    pub fn remove(&mut self, dir: &Path) -> bool {
        self.registry.remove(dir)
    }

    pub fn remove_recursive(&mut self, dir: &Path, include_top: bool) -> bool {
        self.registry.remove_recursive(dir, include_top)
    }

    pub fn move_path(&mut self, old: &Path, new: &Path) -> bool {
        self.registry.move_path(old, new)
    }

    pub fn set_enabled(&mut self, enabled: bool) -> WatchResult<()> {
        self.registry.set_enabled(enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_enabled()
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.registry.is_watched(dir)
    }

    pub fn count(&self) -> usize {
        self.registry.count()
    }

    pub fn ignored_count(&self) -> usize {
        self.registry.ignored_count()
    }

    pub fn limit(&self) -> usize {
        self.registry.limit()
    }

    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.registry.watched()
    }
}

/// Builder for [`FileMonitor`].
pub struct FileMonitorBuilder {
    config: MonitorConfig,
    native: Option<NativeFactory>,
}

impl Default for FileMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMonitorBuilder {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
            native: None,
        }
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the native backend, mainly for tests.
    pub fn native<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(Sender<notify::Result<Event>>) -> WatchResult<Box<dyn NativeWatcher>>
            + Send
            + 'static,
    {
        self.native = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> WatchResult<FileMonitor> {
        let factory: NativeFactory = match self.native {
            Some(factory) => factory,
            None => Box::new(|events| {
                NotifyWatcher::new(events).map(|w| Box::new(w) as Box<dyn NativeWatcher>)
            }),
        };

        let (notify_tx, notify_rx) = unbounded();
        let thread = WatcherThread::spawn(&self.config, factory, notify_tx)?;
        let backend = thread.backend();

        let limit = self
            .config
            .fixed_limit
            .unwrap_or_else(|| backend.watch_limit(self.config.limit_reserve));
        crate::log_event!(
            "monitor",
            "ready",
            "{} backend, limit {limit} directories",
            backend.name()
        );

        Ok(FileMonitor {
            registry: WatchRegistry::new(thread.handoff(), limit, self.config.enabled),
            notifications: notify_rx,
            thread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::error::WatchError;

    #[test]
    fn test_native_failure_surfaces_from_build() {
        let result = FileMonitor::builder()
            .native(|_events| {
                Err(WatchError::InitFailed {
                    reason: "no backend".to_string(),
                })
            })
            .build();

        assert!(matches!(result, Err(WatchError::InitFailed { .. })));
    }

    #[test]
    fn test_disabled_config_starts_disabled() {
        use crate::watcher::table::tests::ScriptedWatcher;

        let native = ScriptedWatcher::default();
        let calls = native.calls.clone();
        let config = MonitorConfig {
            enabled: false,
            ..MonitorConfig::default()
        };
        let mut monitor = FileMonitor::builder()
            .config(config)
            .native(move |_events| Ok(Box::new(native) as Box<dyn NativeWatcher>))
            .build()
            .unwrap();

        assert!(!monitor.is_enabled());
        assert!(monitor.add(Path::new("/w/a")));
        assert!(calls.lock().is_empty());
    }
}
