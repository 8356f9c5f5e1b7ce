//! Observability infrastructure: structured logging through `tracing`.
//!
//! Builds run as short-lived processes or inside a worker, so the only sink
//! is a formatted stderr layer filtered by `RUST_LOG`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .try_init();

    if result.is_ok() {
        tracing::debug!(level = %default_level, "Observability initialized");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_is_idempotent() {
        super::init("debug");
        super::init("info");
        tracing::info!("still logging");
    }
}
