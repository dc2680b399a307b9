//! Tracing setup for binaries and tests.
//!
//! Library code only emits `tracing` events. Installing a subscriber is left
//! to the process entry point.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "CDE_LOG";

const DEFAULT_LEVEL: &str = "info";

/// Builds the filter: `CDE_LOG`, then `RUST_LOG`, then `level`, then `info`.
pub fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_LEVEL)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Installs a compact stderr subscriber. Returns `false` when a global
/// subscriber was already installed.
pub fn init_logging(level: Option<&str>) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .is_ok()
}
