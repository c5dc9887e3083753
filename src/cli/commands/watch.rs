//! Watch command: print change notifications and keep watches in sync.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::extract::{ErrorReportStore, ErrorReporter, ExtractionItem};
use crate::watcher::{FileMonitor, Notification};

const POLL: Duration = Duration::from_millis(250);

/// Run watch command - block printing notifications.
pub fn run(settings: &Settings, dirs: &[PathBuf], duration: Option<u64>) -> Result<()> {
    let mut monitor =
        FileMonitor::new(&settings.monitor).context("failed to start directory monitor")?;
    let reports = ErrorReportStore::open(settings.extraction.error_report_dir())
        .context("failed to open error reports")?;

    for dir in dirs {
        let root = dir
            .canonicalize()
            .with_context(|| format!("cannot watch {}", dir.display()))?;
        let added = watch_tree(&mut monitor, &root);
        eprintln!("Watching {added} directories under {}", root.display());
    }

    if monitor.ignored_count() > 0 {
        eprintln!(
            "Watch limit of {} reached, {} directories not monitored",
            monitor.limit(),
            monitor.ignored_count()
        );
    }

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let notifications = monitor.notifications().clone();

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        let Ok(notification) = notifications.recv_timeout(POLL) else {
            continue;
        };

        println!("{notification}");
        sync(&mut monitor, &reports, &notification);
    }

    Ok(())
}

/// Add `root` and every directory below it. Returns how many were accepted.
pub fn watch_tree(monitor: &mut FileMonitor, root: &Path) -> usize {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("[watch] {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| monitor.add(entry.path()))
        .count()
}

/// Keep the watched set in step with directory changes and drop error
/// reports of files that are gone.
pub fn sync(monitor: &mut FileMonitor, reports: &dyn ErrorReporter, notification: &Notification) {
    match notification {
        Notification::Created {
            path,
            is_directory: true,
        } => {
            watch_tree(monitor, path);
        }
        Notification::Deleted {
            path,
            is_directory: true,
        } => {
            monitor.remove_recursive(path, true);
        }
        Notification::Deleted {
            path,
            is_directory: false,
        } => {
            reports.delete_report(ExtractionItem::from_path(path).uri());
        }
        Notification::Moved {
            from,
            to,
            is_directory: true,
            ..
        } => {
            if !monitor.move_path(from, to) {
                watch_tree(monitor, to);
            }
        }
        Notification::Moved {
            from,
            is_directory: false,
            ..
        } => {
            reports.delete_report(ExtractionItem::from_path(from).uri());
        }
        _ => {}
    }
}
