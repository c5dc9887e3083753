//! Directory change monitor.
//!
//! Raw backend events are reconciled on a dedicated thread into a small
//! set of [`Notification`]s before anyone sees them.
//!
//! # Architecture
//!
//! ```text
//! FileMonitor
//!   - WatchRegistry (desired set, ceiling)
//!         | MonitorRequest + handshake
//!   WatcherThread
//!     - NativeWatcher (notify)
//!     - RawEventTranslator (rename pairing)
//!     - EventReconciler (pending cache)
//!     - WatchTable (live handles)
//!         |
//!   Receiver<Notification>
//! ```

mod backend;
mod error;
mod event;
mod monitor;
mod pending;
mod reconciler;
mod registry;
mod table;
mod thread;

pub use backend::Backend;
pub use error::{WatchError, WatchResult};
pub use event::{Notification, RawEvent, RawEventKind, RawEventTranslator};
pub use monitor::{FileMonitor, FileMonitorBuilder};
pub use pending::{PendingCache, PendingEvent, PendingKind};
pub use reconciler::EventReconciler;
pub use registry::WatchRegistry;
pub use table::{NativeWatcher, NotifyWatcher, WatchTable};
pub use thread::{MonitorRequest, RequestOp, WatcherThread};
