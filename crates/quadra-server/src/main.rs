use anyhow::{Context, Result};
use quadra_monitoring::MonitoringConfig;
use quadra_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Set up monitoring
    let monitoring_config = MonitoringConfig {
        service_name: "quadra-server".to_string(),
        log_filter: std::env::var("LOG_FILTER").unwrap_or_else(|_| "info,quadra=debug".to_string()),
        environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
    };

    quadra_monitoring::init(monitoring_config).context("Failed to initialize monitoring")?;

    // Load configuration from environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    // Run the server using the library's run function
    quadra_server::run(config).await.context("Server error")?;

    Ok(())
}
