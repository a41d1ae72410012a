//! Tracing initialisation for the worker process.
//!
//! The controller captures the worker's stderr, so output is a single
//! compact layer. The controller can retune verbosity at runtime through
//! the `LogLevel` setting, which lands in [`Telemetry::set_level`].

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Handle kept alive by the caller; allows runtime filter reloads.
#[derive(Clone)]
pub struct Telemetry {
    handle: reload::Handle<EnvFilter, Registry>,
}

pub fn init(verbosity: u8) -> Telemetry {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("EVHOST_LOG")
        .from_env_lossy();

    let (filter, handle) = reload::Layer::new(filter);

    // try_init: a subscriber may already be installed when several
    // fixtures run in one process; the reload handle still works.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init();

    Telemetry { handle }
}

impl Telemetry {
    /// Apply a controller-supplied log level ("error", "warn", "info",
    /// "debug", "trace"; case-insensitive).
    pub fn set_level(&self, raw: &str) {
        let Some(filter) = filter_from_name(raw) else {
            tracing::warn!(level = raw, "unrecognised log level; keeping current filter");
            return;
        };
        if let Err(err) = self.handle.reload(EnvFilter::new(filter)) {
            tracing::warn!(%err, "failed to reload log filter");
        }
    }
}

fn filter_from_name(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(filter_from_name("INFO"), Some("info"));
        assert_eq!(filter_from_name("Warning"), Some("warn"));
        assert_eq!(filter_from_name("bogus"), None);
    }
}
