//! Logging utilities for the liveness crates.
//!
//! The daemon builds its subscriber in `liveness_server::telemetry`; this
//! module covers test binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a test-friendly subscriber. Safe to call from many tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter("debug"))
        .try_init();
}
