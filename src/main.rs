pub mod accounts;
pub mod api;
pub mod config;
pub mod db;
pub mod error;

use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting admin backend...");

    let config = config::Config::load()?;
    api::server::start_server(config).await
}
