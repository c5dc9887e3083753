//! The extraction loop.
//!
//! Items are pulled from an [`ItemSource`] into a small window, each one is
//! guarded by a [`PersistenceLog`] marker while its extractor runs, and the
//! outcome becomes a [`StoreUpdate`]. A hung extractor or a cancellation
//! arriving mid-extraction goes to the [`FailFast`] policy, which by default
//! ends the process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Select, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::config::ExtractionConfig;

use super::error::{ExtractError, ExtractResult};
use super::extractor::{ExtractorRegistry, PendingExtraction, ResourceGraph};
use super::item::{ExtractionItem, ItemSource, Pull};
use super::mime;
use super::persistence::PersistenceLog;
use super::report::ErrorReporter;
use super::store::{StoreSink, StoreUpdate};

/// How often in-flight items are checked for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Policy for conditions the queue must not survive.
pub trait FailFast: Send + Sync {
    /// Called once; the production policy does not return.
    fn terminate(&self, reason: &str);
}

/// Logs and exits the process so a supervisor can restart it.
#[derive(Debug, Default)]
pub struct ExitProcess;

impl FailFast for ExitProcess {
    fn terminate(&self, reason: &str) {
        tracing::error!("[extract] {reason}, terminating");
        std::process::exit(1);
    }
}

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    stopped: bool,
    wakes: u64,
}

/// Pause, resume and wake a running queue from any thread.
#[derive(Debug, Clone, Default)]
pub struct QueueControl {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl QueueControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop pulling new items. In-flight items still complete.
    pub fn pause(&self) {
        self.inner.0.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.inner.0.lock();
        state.paused = false;
        state.wakes += 1;
        self.inner.1.notify_all();
    }

    /// Ask a waiting queue to poll its source again.
    pub fn wake(&self) {
        self.inner.0.lock().wakes += 1;
        self.inner.1.notify_all();
    }

    /// End the current run once in-flight items finish.
    pub fn stop(&self) {
        self.inner.0.lock().stopped = true;
        self.inner.1.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.0.lock().paused
    }

    fn is_stopped(&self) -> bool {
        self.inner.0.lock().stopped
    }

    fn wake_count(&self) -> u64 {
        self.inner.0.lock().wakes
    }

    /// Block until resumed, woken after `seen`, or stopped.
    fn wait(&self, seen: u64) {
        let mut state = self.inner.0.lock();
        while !state.stopped && (state.paused || state.wakes == seen) {
            self.inner.1.wait(&mut state);
        }
    }
}

/// Elapsed time that only runs while the queue is working.
#[derive(Debug, Default)]
struct Stopwatch {
    started: Option<Instant>,
    total: Duration,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.total + self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

/// Tally of one [`ExtractionQueue::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub extracted: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Files passed over because their marker was already current.
    pub up_to_date: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
    /// Set when the fail-fast policy was invoked.
    pub terminated: Option<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} extracted, {} failed, {} skipped in {:.2}s",
            self.extracted,
            self.failed,
            self.skipped,
            self.elapsed.as_secs_f64()
        )?;
        if self.up_to_date > 0 {
            write!(f, ", {} up to date", self.up_to_date)?;
        }
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        Ok(())
    }
}

struct InFlight {
    item: ExtractionItem,
    path: PathBuf,
    mime: String,
    pending: PendingExtraction,
    started: Instant,
}

/// Pulls items, extracts them and records the results.
pub struct ExtractionQueue {
    registry: ExtractorRegistry,
    persistence: PersistenceLog,
    store: Box<dyn StoreSink>,
    reporter: Box<dyn ErrorReporter>,
    control: QueueControl,
    fail_fast: Arc<dyn FailFast>,
    max_in_flight: usize,
    deadline: Duration,
    skip_up_to_date: bool,
}

impl ExtractionQueue {
    pub fn new(
        config: &ExtractionConfig,
        registry: ExtractorRegistry,
        persistence: PersistenceLog,
        store: Box<dyn StoreSink>,
        reporter: Box<dyn ErrorReporter>,
    ) -> Self {
        Self {
            registry,
            persistence,
            store,
            reporter,
            control: QueueControl::new(),
            fail_fast: Arc::new(ExitProcess),
            max_in_flight: config.max_in_flight.max(1),
            deadline: config.deadline(),
            skip_up_to_date: true,
        }
    }

    /// Re-extract files even when their marker is current.
    pub fn force(mut self, force: bool) -> Self {
        self.skip_up_to_date = !force;
        self
    }

    pub fn with_fail_fast(mut self, policy: Arc<dyn FailFast>) -> Self {
        self.fail_fast = policy;
        self
    }

    /// Handle for pausing and resuming from other threads.
    pub fn control(&self) -> QueueControl {
        self.control.clone()
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn StoreSink {
        self.store.as_ref()
    }

    /// Whether `path`, as it is on disk now, already carries the marker of
    /// the extractor that would handle it.
    pub fn is_up_to_date(&self, path: &Path) -> bool {
        let item = ExtractionItem::from_path(path);
        let mime = mime::sniff(path).unwrap_or_else(|| mime::OCTET_STREAM.to_string());
        self.store
            .is_up_to_date(item.uri(), &self.registry.marker_for(path, &mime))
    }

    /// Turn markers left by a crashed run into recorded failures.
    pub fn recover(&mut self) -> ExtractResult<usize> {
        let Self {
            registry,
            persistence,
            store,
            reporter,
            ..
        } = self;

        persistence.recover(|path| {
            let item = ExtractionItem::from_path(path);
            let mime = mime::sniff(path).unwrap_or_else(|| mime::OCTET_STREAM.to_string());

            reporter.report(
                item.uri(),
                "extraction did not finish in a previous run",
                Some(&mime),
            );
            let update = StoreUpdate::failed(item.uri(), registry.marker_for(path, &mime));
            if let Err(e) = store.apply(update) {
                tracing::error!("[extract] failed to mark {}: {e}", path.display());
            }
        })
    }

    /// Process items until `source` is exhausted or the queue is stopped.
    pub fn run(&mut self, source: &mut dyn ItemSource) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut stopwatch = Stopwatch::default();
        let mut in_flight: Vec<InFlight> = Vec::new();
        let mut exhausted = false;

        crate::log_event!(
            "extract",
            "started",
            "window {}, deadline {}s",
            self.max_in_flight,
            self.deadline.as_secs()
        );
        stopwatch.start();

        loop {
            let wakes = self.control.wake_count();

            while in_flight.len() < self.max_in_flight
                && !exhausted
                && !self.control.is_paused()
                && !self.control.is_stopped()
            {
                match source.pull_next() {
                    Pull::Item(item) => {
                        if let Some(started) = self.start(item, &mut summary) {
                            in_flight.push(started);
                        }
                    }
                    Pull::Exhausted => exhausted = true,
                    Pull::Paused => break,
                }
            }

            if in_flight.is_empty() {
                if exhausted || self.control.is_stopped() {
                    break;
                }

                crate::log_event!("extract", "paused");
                stopwatch.stop();
                self.control.wait(wakes);
                stopwatch.start();
                crate::log_event!("extract", "resumed");
                continue;
            }

            if let Err(reason) = self.wait_for_one(&mut in_flight, &mut summary) {
                self.fail_fast.terminate(&reason);
                summary.terminated = Some(reason);
                break;
            }
        }

        stopwatch.stop();
        summary.elapsed = stopwatch.elapsed();
        crate::log_event!("extract", "finished", "{summary}");
        summary
    }

    /// Validate `item`, mark it in flight and hand it to its extractor.
    ///
    /// Returns `None` when the item finished without running an extractor.
    fn start(&mut self, item: ExtractionItem, summary: &mut RunSummary) -> Option<InFlight> {
        let Some(path) = item.local_path().map(Path::to_path_buf) else {
            tracing::warn!("[extract] skipping {}: not a local file", item.uri());
            summary.skipped += 1;
            return None;
        };

        if item.cancel_token().is_cancelled() {
            crate::debug_event!("extract", "cancelled before start", "{}", path.display());
            summary.cancelled += 1;
            return None;
        }

        let mime_type = match item.mime().map(str::to_string).or_else(|| mime::sniff(&path)) {
            Some(mime_type) => mime_type,
            None => {
                tracing::warn!(
                    "[extract] skipping {}: cannot determine MIME type",
                    path.display()
                );
                summary.skipped += 1;
                return None;
            }
        };

        if self.skip_up_to_date
            && self
                .store
                .is_up_to_date(item.uri(), &self.registry.marker_for(&path, &mime_type))
        {
            summary.up_to_date += 1;
            return None;
        }

        if let Err(e) = self.persistence.record(&path) {
            tracing::error!("[extract] skipping {}: {e}", path.display());
            summary.skipped += 1;
            return None;
        }

        crate::debug_event!("extract", "dispatch", "{} ({mime_type})", path.display());

        match self.registry.dispatch(&path, &mime_type) {
            Ok(pending) => Some(InFlight {
                item,
                path,
                mime: mime_type,
                pending,
                started: Instant::now(),
            }),
            Err(e) => {
                let marker = self.registry.marker_for(&path, &mime_type);
                self.record_failure(&item, &path, &mime_type, marker, &e, summary);
                None
            }
        }
    }

    /// Wait until one in-flight item completes, or a cancellation or
    /// deadline calls for termination.
    fn wait_for_one(
        &mut self,
        in_flight: &mut Vec<InFlight>,
        summary: &mut RunSummary,
    ) -> Result<(), String> {
        loop {
            if let Some(index) = in_flight
                .iter()
                .position(|f| f.item.cancel_token().is_cancelled())
            {
                let cancelled = in_flight.remove(index);
                self.persistence.forget(&cancelled.path);
                summary.cancelled += 1;
                return Err(format!(
                    "extraction of {} cancelled while running",
                    cancelled.path.display()
                ));
            }

            let now = Instant::now();
            if let Some(late) = in_flight
                .iter()
                .find(|f| now.duration_since(f.started) >= self.deadline)
            {
                // The marker stays so the next start reports this file
                return Err(format!(
                    "extraction of {} by {} exceeded {}s",
                    late.path.display(),
                    late.pending.module(),
                    self.deadline.as_secs()
                ));
            }

            let until_deadline = in_flight
                .iter()
                .map(|f| (f.started + self.deadline).saturating_duration_since(now))
                .min()
                .unwrap_or(CANCEL_POLL);
            let timeout = until_deadline.min(CANCEL_POLL);

            let ready = {
                let mut select = Select::new();
                for f in in_flight.iter() {
                    select.recv(f.pending.receiver());
                }
                select.ready_timeout(timeout).ok()
            };

            let Some(index) = ready else {
                continue;
            };

            let result = match in_flight[index].pending.receiver().try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => Err(ExtractError::WorkerGone {
                    module: in_flight[index].pending.module().to_string(),
                }),
            };

            let done = in_flight.remove(index);
            self.finish(done, result, summary);
            return Ok(());
        }
    }

    fn finish(
        &mut self,
        done: InFlight,
        result: ExtractResult<ResourceGraph>,
        summary: &mut RunSummary,
    ) {
        let marker = done.pending.marker().to_string();

        match result {
            Ok(graph) => {
                let update = StoreUpdate::extracted(done.item.uri(), marker, graph);
                match self.store.apply(update) {
                    Ok(()) => {
                        crate::debug_event!(
                            "extract",
                            "extracted",
                            "{} in {:?}",
                            done.path.display(),
                            done.started.elapsed()
                        );
                        summary.extracted += 1;
                    }
                    Err(e) => {
                        tracing::error!("[extract] failed to store {}: {e}", done.path.display());
                        summary.failed += 1;
                    }
                }
                self.persistence.forget(&done.path);
            }
            Err(e) => {
                self.record_failure(&done.item, &done.path, &done.mime, marker, &e, summary);
            }
        }
    }

    fn record_failure(
        &mut self,
        item: &ExtractionItem,
        path: &Path,
        mime_type: &str,
        marker: String,
        error: &ExtractError,
        summary: &mut RunSummary,
    ) {
        tracing::warn!("[extract] {}: {error}", path.display());
        self.reporter
            .report(item.uri(), &error.to_string(), Some(mime_type));

        if let Err(e) = self.store.apply(StoreUpdate::failed(item.uri(), marker)) {
            tracing::error!("[extract] failed to mark {}: {e}", path.display());
        }
        self.persistence.forget(path);
        summary.failed += 1;
    }
}
