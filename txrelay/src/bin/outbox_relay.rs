//! The relay binary: polls the outbox table and publishes records to the
//! bus until SIGINT/SIGTERM.
//!
//! Configuration comes from `TXRELAY_*` environment variables; there are
//! no positional arguments. Exit codes: 0 clean shutdown, 1 startup
//! failure, 2 fatal runtime error.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use txrelay::{Relay, RelayConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let relay = match Relay::start(config).await {
        Ok(relay) => relay,
        Err(err) => {
            error!("startup failed: {err}");
            std::process::exit(1);
        }
    };
    info!("relay started");

    if let Err(err) = relay.run_until_shutdown().await {
        error!("fatal runtime error: {err}");
        std::process::exit(2);
    }
}
