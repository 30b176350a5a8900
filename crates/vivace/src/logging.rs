//! Logging initialization for vivace.
//!
//! Call [`init_logging`] once before building a [`crate::Server`]; the log
//! level is controlled through the `RUST_LOG` environment variable
//! (`RUST_LOG=vivace=debug` for reactor traces, `RUST_LOG=warn` in
//! production).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber with sensible defaults.
///
/// Defaults to `info` when `RUST_LOG` is unset. Calling this twice panics;
/// call it once at startup, before workers are spawned.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
