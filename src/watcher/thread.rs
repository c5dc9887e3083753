//! Dedicated watcher thread and the request handoff into it.
//!
//! The thread owns the [`WatchTable`], the [`EventReconciler`] and the
//! rename pairing state. Other threads reach it only by posting a
//! [`MonitorRequest`] and waiting on [`Handoff`] until every posted request
//! has been applied.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select, unbounded};
use notify::Event;
use parking_lot::{Condvar, Mutex};

use crate::config::MonitorConfig;

use super::backend::Backend;
use super::error::{WatchError, WatchResult};
use super::event::{Notification, RawEventTranslator};
use super::reconciler::EventReconciler;
use super::table::{NativeWatcher, WatchTable};

/// Longest the loop sleeps when nothing is scheduled.
const IDLE_PARK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOp {
    Add,
    Remove,
}

/// A batch of directories to start or stop watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequest {
    pub op: RequestOp,
    pub paths: Vec<PathBuf>,
}

impl MonitorRequest {
    pub fn add(paths: Vec<PathBuf>) -> Self {
        Self {
            op: RequestOp::Add,
            paths,
        }
    }

    pub fn remove(paths: Vec<PathBuf>) -> Self {
        Self {
            op: RequestOp::Remove,
            paths,
        }
    }
}

enum Command {
    Apply(MonitorRequest),
    Shutdown,
}

/// Synchronous request handoff: a command queue plus an in-flight counter
/// guarded by one mutex and signalled through a condition variable.
pub(crate) struct Handoff {
    commands: Sender<Command>,
    in_flight: Mutex<usize>,
    applied: Condvar,
    alive: AtomicBool,
}

impl Handoff {
    fn new(commands: Sender<Command>) -> Self {
        Self {
            commands,
            in_flight: Mutex::new(0),
            applied: Condvar::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Post `requests` in order and block until all of them are applied.
    pub(crate) fn submit(&self, requests: Vec<MonitorRequest>) -> WatchResult<()> {
        if requests.is_empty() {
            return Ok(());
        }

        {
            let mut in_flight = self.in_flight.lock();
            if !self.alive.load(Ordering::Acquire) {
                return Err(WatchError::ThreadGone);
            }
            *in_flight += requests.len();
        }

        let total = requests.len();
        for (posted, request) in requests.into_iter().enumerate() {
            if self.commands.send(Command::Apply(request)).is_err() {
                let mut in_flight = self.in_flight.lock();
                *in_flight = in_flight.saturating_sub(total - posted);
                return Err(WatchError::ThreadGone);
            }
        }

        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 && self.alive.load(Ordering::Acquire) {
            self.applied.wait(&mut in_flight);
        }

        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(WatchError::ThreadGone)
        }
    }

    fn complete_one(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.applied.notify_all();
        }
    }

    fn mark_dead(&self) {
        let mut in_flight = self.in_flight.lock();
        self.alive.store(false, Ordering::Release);
        *in_flight = 0;
        self.applied.notify_all();
    }
}

/// Releases waiting submitters however the thread exits.
struct AliveGuard(Arc<Handoff>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.mark_dead();
    }
}

/// Handle to the running watcher thread.
pub struct WatcherThread {
    handoff: Arc<Handoff>,
    backend: Backend,
    join: Option<JoinHandle<()>>,
}

impl WatcherThread {
    /// Start the thread, building the native watcher on it.
    ///
    /// `make_native` receives the sender its raw events must go to.
    /// Reconciled notifications are sent to `notifications`.
    pub fn spawn<F>(
        config: &MonitorConfig,
        make_native: F,
        notifications: Sender<Notification>,
    ) -> WatchResult<Self>
    where
        F: FnOnce(Sender<notify::Result<Event>>) -> WatchResult<Box<dyn NativeWatcher>>
            + Send
            + 'static,
    {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded::<WatchResult<Backend>>(1);

        let handoff = Arc::new(Handoff::new(command_tx));
        let guard = AliveGuard(Arc::clone(&handoff));
        let hint_timeout = config.hint_timeout();
        let pairing_window = config.move_pairing_window();

        let join = thread::Builder::new()
            .name("indexwatch-monitor".to_string())
            .spawn(move || {
                let handoff = Arc::clone(&guard.0);
                let _guard = guard;

                let native = match make_native(event_tx.clone()) {
                    Ok(native) => native,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let backend = native.backend();
                let _ = ready_tx.send(Ok(backend));

                let mut worker = Worker {
                    table: WatchTable::new(native),
                    reconciler: EventReconciler::new(backend, hint_timeout),
                    translator: RawEventTranslator::new(pairing_window),
                    events: event_rx,
                    commands: command_rx,
                    notifications,
                    handoff,
                    outbox: Vec::new(),
                    _events_tx: event_tx,
                };
                worker.run();
            })
            .map_err(WatchError::ThreadSpawn)?;

        let backend = match ready_rx.recv() {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(WatchError::InitFailed {
                    reason: "watcher thread exited during startup".to_string(),
                });
            }
        };

        crate::log_event!("monitor", "thread started", "{} backend", backend.name());

        Ok(Self {
            handoff,
            backend,
            join: Some(join),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn handoff(&self) -> Arc<Handoff> {
        Arc::clone(&self.handoff)
    }

    /// Stop the loop and wait for the thread to finish.
    pub fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handoff.commands.send(Command::Shutdown);
            if join.join().is_err() {
                tracing::error!("[monitor] watcher thread panicked");
            }
        }
    }
}

impl Drop for WatcherThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Wake {
    Backend(notify::Result<Event>),
    Command(Option<Command>),
    Timeout,
}

/// State living on the watcher thread.
struct Worker {
    table: WatchTable,
    reconciler: EventReconciler,
    translator: RawEventTranslator,
    events: Receiver<notify::Result<Event>>,
    commands: Receiver<Command>,
    notifications: Sender<Notification>,
    handoff: Arc<Handoff>,
    outbox: Vec<Notification>,
    /// Keeps the event channel connected even if the backend drops its end.
    _events_tx: Sender<notify::Result<Event>>,
}

impl Worker {
    fn run(&mut self) {
        let events = self.events.clone();
        let commands = self.commands.clone();

        loop {
            let mut busy = false;

            // Backend events always go ahead of watch requests
            while let Ok(event) = events.try_recv() {
                self.on_backend_event(event);
                busy = true;
            }
            self.deliver();

            match commands.try_recv() {
                Ok(Command::Apply(request)) => {
                    self.apply(request);
                    busy = true;
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if busy {
                continue;
            }

            // Idle: flush what was waiting for the queue to go quiet
            let now = Instant::now();
            self.on_idle(now);

            let timeout = self.next_wakeup(now);
            let wake = select! {
                recv(events) -> event => match event {
                    Ok(event) => Wake::Backend(event),
                    Err(_) => Wake::Timeout,
                },
                recv(commands) -> command => Wake::Command(command.ok()),
                default(timeout) => Wake::Timeout,
            };

            match wake {
                Wake::Backend(event) => {
                    self.on_backend_event(event);
                    self.deliver();
                }
                Wake::Command(Some(Command::Apply(request))) => self.apply(request),
                Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => break,
                Wake::Timeout => {}
            }
        }

        crate::debug_event!(
            "monitor",
            "thread stopped",
            "{} watches, {} pending events dropped",
            self.table.len(),
            self.reconciler.pending_len()
        );
    }

    fn on_backend_event(&mut self, event: notify::Result<Event>) {
        match event {
            Ok(event) => {
                let now = Instant::now();
                for raw in self.translator.translate(event, now) {
                    self.reconciler
                        .process(raw, now, &mut self.table, &mut self.outbox);
                }
            }
            Err(e) => tracing::warn!("[monitor] backend error: {e}"),
        }
    }

    fn on_idle(&mut self, now: Instant) {
        for raw in self.translator.flush_expired(now) {
            self.reconciler
                .process(raw, now, &mut self.table, &mut self.outbox);
        }
        self.reconciler.flush_due(now, &mut self.outbox);
        self.deliver();
    }

    fn apply(&mut self, request: MonitorRequest) {
        match request.op {
            RequestOp::Add => {
                let watched = request
                    .paths
                    .iter()
                    .filter(|path| self.table.add(path))
                    .count();
                crate::debug_event!(
                    "monitor",
                    "add request",
                    "{watched}/{} watched, {} total",
                    request.paths.len(),
                    self.table.len()
                );
            }
            RequestOp::Remove => {
                for path in &request.paths {
                    self.table.remove(path);
                }
                crate::debug_event!(
                    "monitor",
                    "remove request",
                    "{} paths, {} total",
                    request.paths.len(),
                    self.table.len()
                );
            }
        }
        self.handoff.complete_one();
    }

    fn deliver(&mut self) {
        for notification in self.outbox.drain(..) {
            crate::debug_event!("monitor", "notify", "{notification}");
            if self.notifications.send(notification).is_err() {
                crate::debug_event!("monitor", "no listener, notification dropped");
            }
        }
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        [self.reconciler.next_deadline(), self.translator.next_deadline()]
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(IDLE_PARK)
    }
}
