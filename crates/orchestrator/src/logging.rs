//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Output format for [`init_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Install a human-readable subscriber filtered by `RUST_LOG` (default
/// `info`).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    init_with(LogFormat::Pretty);
}

/// Install a subscriber with the given output format.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_with(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
        }
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_target(false)
            .try_init()
            .is_ok(),
    }
}
