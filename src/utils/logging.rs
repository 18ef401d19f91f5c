//! Structured logging setup.
//!
//! The binding itself only emits `tracing` events; this helper wires up a
//! sensible subscriber for binaries and tests that do not bring their own.
//! Honors `RUST_LOG` and is safe to call more than once.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(Level::INFO);
}

/// Install a global fmt subscriber with an explicit default level, still
/// overridable through `RUST_LOG`.
pub fn init_with_level(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
