//! # Courier Server
//!
//! Realtime room server backed by a durable command and event bus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory bus)
//! courier
//!
//! # Run with custom config
//! courier --config /path/to/courier.toml
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//!
//! # Use Redis Streams for the bus (build with `--features redis`)
//! COURIER_TRANSPORT__KIND=redis COURIER_TRANSPORT__REDIS_URL=redis://127.0.0.1 courier
//! ```

mod config;
mod handlers;
mod identity;
mod metrics;
mod presence;
mod topics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "courier_server=debug,courier_bus=debug,courier_core=debug,tower_http=debug"
                        .into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().skip_while(|arg| arg != "--config").nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        service = %config.service_name,
        instance = %config.instance_id,
        transport = ?config.transport.kind,
        "Starting Courier server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
