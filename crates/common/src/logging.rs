//! Tracing setup shared by the server binary and test tooling

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
///
/// `default_level` comes from the config file (or `--log-level`);
/// `RUST_LOG` overrides it when set. Worker-thread logs and async-side
/// logs go through the same fmt layer, so queue retries and supervisor
/// transitions interleave in submission order.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .init();

    Ok(())
}
