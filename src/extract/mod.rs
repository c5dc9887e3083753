//! Crash-resilient metadata extraction.
//!
//! ```text
//! ItemSource --pull--> ExtractionQueue --dispatch--> ExtractorRegistry
//!                        |    |                        (thread per module)
//!          PersistenceLog     +--> StoreSink / ErrorReporter
//! ```

mod error;
mod extractor;
mod item;
pub mod mime;
mod persistence;
mod queue;
mod report;
mod store;

pub use error::{ExtractError, ExtractResult};
pub use extractor::{
    Extractor, ExtractorRegistry, NO_EXTRACTOR, PendingExtraction, PropertyValue, ResourceGraph,
    TextExtractor, extraction_marker, extractor_identity,
};
pub use item::{CancelToken, CrawlSource, ExtractionItem, ItemSource, Pull};
pub use persistence::{PersistenceLog, path_hash};
pub use queue::{ExitProcess, ExtractionQueue, FailFast, QueueControl, RunSummary};
pub use report::{ErrorReport, ErrorReportStore, ErrorReporter};
pub use store::{JsonlStore, MemoryStore, StoreSink, StoreUpdate};
