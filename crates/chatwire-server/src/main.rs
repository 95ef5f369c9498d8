//! # Chatwire Server
//!
//! Realtime hub for chat events, presence and call signaling.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chatwire
//!
//! # Config file (first found wins)
//! #   ./chatwire.toml, /etc/chatwire/chatwire.toml, ~/.config/chatwire/chatwire.toml
//!
//! # Environment overrides
//! CHATWIRE__PORT=9000 CHATWIRE__AUTH__ALLOW_ANONYMOUS=true chatwire
//! ```

mod config;
mod handlers;
mod metrics;
mod persist;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatwire=debug,chatwire_core=debug,chatwire_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Chatwire server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    handlers::run_server(config).await?;

    Ok(())
}
