use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use tandem_road::config::{Cli, RelayConfig};
use tandem_road::telemetry::Telemetry;
use tandem_road::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        intro_timeout_secs = config.intro_timeout.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        max_frame_bytes = config.max_frame_bytes,
        "starting tandem-road"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let state = AppState::new(config, Some(telemetry.metrics_handle()));
    tandem_road::serve(listener, state, shutdown_signal()).await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
