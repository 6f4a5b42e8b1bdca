//! Logging setup for the Quadra platform.
//!
//! Installs a `tracing` subscriber with env-filter support. Every
//! binary calls [`init`] once at startup; library crates only emit
//! through the `tracing` macros and never install subscribers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Service name reported in startup logs
    pub service_name: String,

    /// Log level filter (e.g., "info,quadra=debug"), overridden by
    /// `RUST_LOG` when set
    pub log_filter: String,

    /// Environment (dev, staging, prod)
    pub environment: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "quadra".to_string(),
            log_filter: "info".to_string(),
            environment: "dev".to_string(),
        }
    }
}

/// Initialize the monitoring system.
///
/// Idempotent: a second call logs a warning and leaves the existing
/// subscriber in place.
pub fn init(config: MonitoringConfig) -> anyhow::Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        warn!("Monitoring already initialized; ignoring repeated init");
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        "Monitoring initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(MonitoringConfig::default()).unwrap();
        // Second init must not panic or error.
        init(MonitoringConfig::default()).unwrap();
    }
}
