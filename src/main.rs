//! Resonance Rail binary entry point.
//!
//! Loads configuration from the environment, validates it, initializes
//! tracing, and hands off to [`resonance_rail::server::run`] for the
//! remainder of the process lifetime.

use anyhow::Context;
use resonance_rail::{config::AppConfig, observability, server};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing();

    let config = AppConfig::from_env().context("failed to load configuration from environment")?;
    config.validate().context("invalid configuration")?;

    info!(port = config.server.port, data_dir = %config.storage.data_dir.display(), "starting resonance-rail");

    server::run(config).await.context("server exited with an error")?;

    info!("resonance-rail shut down gracefully");
    Ok(())
}
