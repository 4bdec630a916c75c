//! # Scribe Server
//!
//! Real-time document collaboration server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! JWT_SECRET=change-me scribe
//!
//! # Run with a specific config file
//! SCRIBE_CONFIG=/path/to/scribe.toml scribe
//!
//! # Override single settings from the environment
//! SCRIBE_PORT=9000 SCRIBE_LIMITS__QUEUE_CAPACITY=512 scribe
//! ```

use anyhow::Result;
use scribe_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scribe=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting Scribe server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
