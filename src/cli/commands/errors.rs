//! Errors command: show recorded extraction failures.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::extract::{ErrorReportStore, ExtractionItem};

/// Run errors command - list every failure, or the one for `path`.
pub fn run(settings: &Settings, path: Option<&Path>) -> Result<()> {
    let store = ErrorReportStore::open(settings.extraction.error_report_dir())
        .context("failed to open error reports")?;

    match path {
        Some(path) => {
            let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            let uri = ExtractionItem::from_path(&absolute).uri().to_string();

            match store.lookup(&uri).context("failed to read error report")? {
                Some(report) => {
                    println!("{}", report.uri);
                    println!("  when:    {}", report.reported_at.to_rfc3339());
                    println!("  message: {}", report.message);
                    if let Some(extra) = &report.extra {
                        println!("  extra:   {extra}");
                    }
                }
                None => println!("No extraction error recorded for {}", absolute.display()),
            }
        }
        None => {
            let reports = store.list().context("failed to list error reports")?;
            if reports.is_empty() {
                println!("No extraction errors recorded");
            }
            for report in reports {
                println!("{}\t{}", report.uri, report.message);
            }
        }
    }

    Ok(())
}
