//! Logging setup shared by the `watch`, `extract` and `errors` commands.
//!
//! Everything goes to stderr with a short wall-clock stamp, so stdout stays
//! free for command output. Levels come from the `[logging]` table:
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.modules]
//! "indexwatch::watcher::reconciler" = "debug"
//! ```
//!
//! A non-empty `RUST_LOG` replaces the table entirely.

use std::collections::BTreeMap;
use std::sync::Once;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Levels applied before the configured overrides. The notify backend and
/// the poller under it are chatty at debug and below.
const BUILTIN_TARGETS: &[(&str, &str)] = &[("notify", "warn"), ("mio", "warn")];

/// Level used when the configured directives do not parse.
const FALLBACK_LEVEL: &str = "warn";

struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Filter directives for `config`: the default level, then one
/// `target=level` per module in target order. Configured modules replace
/// the builtin entry for the same target.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut targets: BTreeMap<&str, &str> = BUILTIN_TARGETS.iter().copied().collect();
    for (target, level) in &config.modules {
        targets.insert(target.as_str(), level.as_str());
    }

    let mut directives = config.default.trim().to_string();
    for (target, level) in targets {
        if !directives.is_empty() {
            directives.push(',');
        }
        directives.push_str(target);
        directives.push('=');
        directives.push_str(level);
    }
    directives
}

fn env_override() -> Option<String> {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Install the global subscriber. Only the first call in a process counts.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let directives = env_override().unwrap_or_else(|| filter_directives(config));
        let (filter, rejected) = match EnvFilter::try_new(&directives) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new(FALLBACK_LEVEL), Some(e)),
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(WallClock)
            .with_target(true)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).init();

        if let Some(e) = rejected {
            tracing::warn!("[logging] ignoring filter `{directives}`: {e}");
        }
    });
}

/// [`init_with_config`] with the stock `[logging]` table.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Info-level event tagged with the component that raised it.
///
/// ```ignore
/// log_event!("monitor", "watching", "{}", path.display());
/// log_event!("extract", "finished");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Same as [`log_event!`] at debug level.
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(default: &str, modules: &[(&str, &str)]) -> LoggingConfig {
        LoggingConfig {
            default: default.to_string(),
            modules: modules
                .iter()
                .map(|(t, l)| (t.to_string(), l.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_builtin_targets_follow_default() {
        assert_eq!(
            filter_directives(&config("info", &[])),
            "info,mio=warn,notify=warn"
        );
    }

    #[test]
    fn test_configured_module_replaces_builtin() {
        let directives = filter_directives(&config(
            "warn",
            &[("notify", "debug"), ("indexwatch::watcher", "trace")],
        ));
        assert_eq!(
            directives,
            "warn,indexwatch::watcher=trace,mio=warn,notify=debug"
        );
    }

    #[test]
    fn test_blank_default_leaves_no_leading_comma() {
        assert_eq!(filter_directives(&config("  ", &[])), "mio=warn,notify=warn");
    }

    #[test]
    fn test_directives_parse() {
        let directives = filter_directives(&config(
            "info",
            &[("indexwatch::extract::queue", "debug")],
        ));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}
