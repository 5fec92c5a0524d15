//! Veilnet daemon binary.

use std::path::PathBuf;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use veilnet_daemon::{Router, RouterConfig};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,veilnet=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| RouterConfig::default().data_dir.join("veilnet.json"));
    let config = RouterConfig::load_from(&config_path)?;

    tracing::info!("starting veilnet router");
    let router = Router::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");
    router.shutdown().await;
    Ok(())
}
