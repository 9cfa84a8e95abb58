//! Logging initialization.
//!
//! The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! # Per-connection lifecycle
//! RUST_LOG=etude=debug etude --config etc/etude.toml
//!
//! # Warnings and errors only
//! RUST_LOG=warn etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with the `info` default.
///
/// Call once at startup; later calls leave the first subscriber in place.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with `level` as the fallback when `RUST_LOG` is unset.
///
/// # Common Levels
///
/// - `"trace"` - parser and readiness detail
/// - `"debug"` - accepts, closes, CGI exits
/// - `"info"` - startup and shutdown
/// - `"warn"` - capacity rejections
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
