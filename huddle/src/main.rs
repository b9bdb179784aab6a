mod config;
mod logging;
mod server;

use anyhow::Result;
use tracing::info;

use server::HuddleServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = config::load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle server starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        rtc_ports = %format!("{}-{}", config.engine.rtc_min_port, config.engine.rtc_max_port),
        announced_ip = %config.transport_options().advertised_ip(),
        "Media engine configured"
    );

    // 3. Run until shutdown
    HuddleServer::new(config).start().await
}
