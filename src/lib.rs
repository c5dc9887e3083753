pub mod cli;
pub mod config;
pub mod extract;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use extract::{
    ErrorReportStore, ExtractError, ExtractionItem, ExtractionQueue, ExtractorRegistry,
    PersistenceLog, RunSummary,
};
pub use watcher::{Backend, FileMonitor, Notification, WatchError};
