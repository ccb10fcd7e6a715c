use anyhow::Result;
use clap::Parser;
use tracing::info;

use device_hub::config::{Cli, ServerConfig};
use device_hub::server;
use device_hub::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let telemetry = Telemetry::init(config.log_format)?;

    info!(
        listen_addr = %config.listen_addr,
        port_range = ?config.port_range,
        platforms = ?config.platforms,
        mock = config.mock,
        "starting device-hub"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
