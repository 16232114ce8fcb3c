//! Logging utilities for the service registry crates.

use tracing_subscriber::{EnvFilter, fmt, prelude::*, util::TryInitError};

/// Build an `EnvFilter` from RUST_LOG, falling back to `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a stdout subscriber with an explicit default level and output format.
///
/// Uses the RUST_LOG environment variable to control log levels. Fails if a
/// global subscriber is already set.
pub fn try_init(default_level: &str, json: bool) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));
    if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    }
}

/// Initialize tracing for tests. Safe to call more than once.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
