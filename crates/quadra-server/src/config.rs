//! Configuration for the Quadra server
//!
//! This module contains the configuration types and loading functionality.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quadra_core::Season;

use crate::error::{ServerError, ServerResult};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// URL of the lock service (`memory://` or `redis://`)
    #[serde(default = "default_lock_url")]
    pub lock_url: String,

    /// Base URL of the upstream academic data API
    pub upstream_base_url: String,

    /// Secret key for board write access
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// Season synced when a trigger names none
    #[serde(default = "default_season")]
    pub default_season: String,

    /// Records per bulk upsert during reconciliation
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent workers per queue
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,

    /// Idle worker poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// TTL of sync locks in seconds
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,

    /// Cron expression for the recurring component sync, empty to disable
    #[serde(default = "default_sync_cron")]
    pub sync_cron: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_lock_url() -> String {
    "memory://local".to_string()
}

fn default_season() -> String {
    "2026:2".to_string()
}

fn default_batch_size() -> usize {
    150
}

fn default_workers_per_queue() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lock_ttl_seconds() -> u64 {
    600
}

fn default_sync_cron() -> String {
    // Daily at 03:00
    "0 0 3 * * *".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        // Start with defaults
        let mut config = Self::default();

        // Override from environment variables
        if let Ok(port) = env::var("SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            } else {
                warn!("Invalid SERVER_PORT value: {}", port);
            }
        }

        if let Ok(host) = env::var("SERVER_HOST") {
            config.bind_address = host;
        }

        if let Ok(lock_url) = env::var("LOCK_URL") {
            config.lock_url = lock_url;
        }

        if let Ok(upstream_base_url) = env::var("UPSTREAM_BASE_URL") {
            config.upstream_base_url = upstream_base_url;
        }

        if let Ok(admin_api_key) = env::var("ADMIN_API_KEY") {
            config.admin_api_key = Some(admin_api_key);
        }

        if let Ok(season) = env::var("DEFAULT_SEASON") {
            if Season::from_str(&season).is_ok() {
                config.default_season = season;
            } else {
                warn!("Invalid DEFAULT_SEASON value: {}", season);
            }
        }

        if let Ok(batch_size) = env::var("SYNC_BATCH_SIZE") {
            if let Ok(size) = batch_size.parse::<usize>() {
                config.batch_size = size;
            } else {
                warn!("Invalid SYNC_BATCH_SIZE value: {}", batch_size);
            }
        }

        if let Ok(workers) = env::var("WORKERS_PER_QUEUE") {
            if let Ok(workers) = workers.parse::<usize>() {
                config.workers_per_queue = workers;
            } else {
                warn!("Invalid WORKERS_PER_QUEUE value: {}", workers);
            }
        }

        if let Ok(poll) = env::var("WORKER_POLL_INTERVAL_MS") {
            if let Ok(ms) = poll.parse::<u64>() {
                config.poll_interval_ms = ms;
            } else {
                warn!("Invalid WORKER_POLL_INTERVAL_MS value: {}", poll);
            }
        }

        if let Ok(ttl) = env::var("LOCK_TTL_SECONDS") {
            if let Ok(seconds) = ttl.parse::<u64>() {
                config.lock_ttl_seconds = seconds;
            } else {
                warn!("Invalid LOCK_TTL_SECONDS value: {}", ttl);
            }
        }

        if let Ok(cron) = env::var("SYNC_CRON") {
            config.sync_cron = cron;
        }

        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }

        // Validate required fields
        if config.upstream_base_url.is_empty() {
            return Err(ServerError::ConfigError(
                "Upstream base URL is required".to_string(),
            ));
        }

        // Add warnings for missing optional fields
        if config.admin_api_key.is_none() {
            warn!("No ADMIN_API_KEY provided - board write endpoints will be unsecured!");
        }

        info!("Loaded server configuration");
        Ok(config)
    }

    /// The default season as a parsed value
    pub fn default_season(&self) -> ServerResult<Season> {
        Season::from_str(&self.default_season)
            .map_err(|e| ServerError::ConfigError(format!("Invalid default season: {}", e)))
    }

    /// Lock TTL as a duration
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    /// Worker poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            lock_url: default_lock_url(),
            upstream_base_url: String::new(),
            admin_api_key: None,
            default_season: default_season(),
            batch_size: default_batch_size(),
            workers_per_queue: default_workers_per_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
            sync_cron: default_sync_cron(),
            log_level: default_log_level(),
        }
    }
}
