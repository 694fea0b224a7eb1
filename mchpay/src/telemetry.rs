//! Tracing setup for the simulation server.
//!
//! Logs go to stdout through the `tracing-subscriber` fmt layer. The level defaults to `info`
//! and is overridden with the usual `RUST_LOG` directives, e.g.
//! `RUST_LOG=mchpay=debug,tower_http=debug` to see every inbound request and notification
//! state change.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
