//! Extract command: recover interrupted work, then crawl and extract.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::{CONFIG_DIR, Settings};
use crate::extract::{
    CrawlSource, ErrorReportStore, ExtractionQueue, ExtractorRegistry, JsonlStore,
    PersistenceLog, RunSummary,
};

/// Run extract command - returns the run summary for callers that want it.
pub fn run(settings: &Settings, dirs: &[PathBuf], force: bool) -> Result<RunSummary> {
    let config = &settings.extraction;

    let persistence = PersistenceLog::open(config.persistence_dir.clone())
        .context("crash recovery is unavailable, refusing to extract")?;
    let store = JsonlStore::open(&config.store_path)
        .with_context(|| format!("failed to open store {}", config.store_path.display()))?;
    let reports = ErrorReportStore::open(config.error_report_dir())
        .context("failed to open error reports")?;
    let registry = ExtractorRegistry::with_builtin().context("failed to start extractors")?;

    let mut queue = ExtractionQueue::new(
        config,
        registry,
        persistence,
        Box::new(store),
        Box::new(reports),
    )
    .force(force);

    let recovered = queue.recover().context("failed to read crash markers")?;
    if recovered > 0 {
        eprintln!("Recovered {recovered} files interrupted by a previous run");
    }

    let mut roots = Vec::with_capacity(dirs.len());
    for dir in dirs {
        roots.push(
            dir.canonicalize()
                .with_context(|| format!("cannot crawl {}", dir.display()))?,
        );
    }

    // The journal and settings live inside the tree being crawled
    let mut source = CrawlSource::new(roots).skip_if(|path| {
        path.components()
            .any(|c| c.as_os_str() == std::ffi::OsStr::new(CONFIG_DIR))
    });

    let summary = queue.run(&mut source);
    println!("{summary}");
    Ok(summary)
}
