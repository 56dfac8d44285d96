//! Optional tracing subscriber setup for binaries and tests.
//!
//! Library consumers normally install their own subscriber; nothing here runs
//! unless explicitly invoked.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber honoring `GALDRDB_LOG` (falling back
/// to `RUST_LOG`, then the provided default directive). Safe to call more than
/// once; later calls are ignored.
pub fn init(default_directive: &str) {
    let filter = std::env::var("GALDRDB_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_directive.to_string());

    let _ = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
}
