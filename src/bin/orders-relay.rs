//! `orders-relay`: runs the relay against `DATABASE_URL` until SIGINT/SIGTERM.
//!
//! Environment:
//! - `DATABASE_URL` (required)
//! - `RELAY_CHANNEL` (default `order_changes`), `RELAY_TABLE` (default `orders`)
//! - `RELAY_DATA_DIR` (default `./relay-data`)
//! - `RELAY_LOG_SUBSCRIBER` id of the built-in logging subscriber (default `log`)
//! - `RUST_LOG` (default `info`)
//!
//! Exit codes: `0` clean stop, `1` configuration or startup error, `2` listener
//! unavailable, `3` shutdown grace exceeded.

use std::process::ExitCode;
use std::sync::Arc;

use orders_relay::{LogSubscriber, LogWriter, Relay, RelayConfig, RelayError, StartPosition};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.as_label(), "relay exited");
            match e {
                RelayError::Listener(_) => ExitCode::from(2),
                RelayError::Runtime(_) => ExitCode::from(3),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run() -> Result<(), RelayError> {
    let cfg = RelayConfig::from_env()?;
    let log_id = std::env::var("RELAY_LOG_SUBSCRIBER").unwrap_or_else(|_| "log".to_string());

    let relay = Relay::builder(cfg)
        .with_observer(Arc::new(LogWriter::new()))
        .build()?;
    relay
        .register(Arc::new(LogSubscriber::new(log_id)), StartPosition::Now)
        .await?;
    relay.run().await
}
