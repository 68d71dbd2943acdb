//! `tracing` subscriber setup for hosts that don't install their own.

use tracing_subscriber::EnvFilter;

/// Filter directives are read from this variable first, then `RUST_LOG`.
pub const LOG_ENV: &str = "FRAME_BRIDGE_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber. Returns `false` if one was already set,
/// by this call or by the host.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .is_ok()
}
