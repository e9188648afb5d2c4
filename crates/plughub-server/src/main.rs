//! PlugHub Server
//!
//! Plugin runtime and marketplace API.

use plughub_core::PluginSystemConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PluginSystemConfig::load()?;

    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    plughub_server::start_server(config).await
}
