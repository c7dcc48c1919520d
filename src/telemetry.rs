//! Logging setup for binaries and tests embedding the governor.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "prompt_governor=info";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `prompt_governor=info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
