//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the application's job. These helpers cover the common cases. The log
//! level is controlled by `RUST_LOG` (`info` when unset).

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a formatted stdout subscriber with `RUST_LOG` filtering.
///
/// Call once at startup, before creating the reactor. Panics if a
/// subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_logging`] but with an explicit default level, e.g. `"debug"`.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
