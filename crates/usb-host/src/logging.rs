//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::Error;

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence when set. Otherwise `default_level` applies
/// to the host and wire crates and everything else stays at `warn`, so
/// transfer traces don't drown in dependency noise.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "warn,usb_host={},usb_wire={}",
                default_level, default_level
            ))
        })
        .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
