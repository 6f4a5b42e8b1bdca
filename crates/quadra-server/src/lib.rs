//!
//! Quadra Server - HTTP surface and sync pipeline of the Quadra
//! platform
//!
//! This crate wires the job engine, the lock service, the batch
//! reconciler, and the upstream client into a running server: sync
//! trigger endpoints, the job introspection board, and the recurring
//! catalog sync.

use std::sync::Arc;
use std::time::Duration;

/// API module
pub mod api;

/// Server module
pub mod server;

/// Job handlers module
pub mod jobs;

/// Upstream client module
pub mod upstream;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

// Re-export key types
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::QuadraServer;
pub use upstream::{HttpUpstreamProvider, UpstreamProvider};

use quadra_core::{JobManager, JobRegistry, ManagerSettings};
use quadra_queue_inmemory::InMemoryQueueBackend;
use quadra_reconcile::memory::{InMemoryEntityStore, InMemoryHashCache};
use quadra_reconcile::{EntityStore, HashCache};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    // Create dependencies
    let lock = quadra_lock::create_lock_service(&config.lock_url).await?;
    let upstream: Arc<dyn UpstreamProvider> = Arc::new(
        HttpUpstreamProvider::new(config.upstream_base_url.clone())
            .map_err(|e| ServerError::ConfigError(format!("{}", e)))?,
    );

    let backend = Arc::new(InMemoryQueueBackend::new());

    let component_store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
    let enrollment_store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
    let component_hash_cache: Arc<dyn HashCache> = Arc::new(InMemoryHashCache::new());
    let enrollment_hash_cache: Arc<dyn HashCache> = Arc::new(InMemoryHashCache::new());

    // Bind handlers to job names
    let registry = jobs::build_registry(
        &config,
        lock.clone(),
        upstream.clone(),
        backend.clone(),
        component_store,
        enrollment_store,
        component_hash_cache,
        enrollment_hash_cache,
    )?;

    let settings = manager_settings(&config, &registry);
    let manager = Arc::new(JobManager::new(registry, backend, settings));

    // Create and run the server
    let server = QuadraServer::new(config, manager, lock, upstream);
    server.run().await
}

/// Headroom between the longest attempt timeout and the stall reaper
const STALL_MARGIN: Duration = Duration::from_secs(60);

/// Build manager settings from the config and the registered jobs.
///
/// The stall threshold must exceed every registered attempt timeout,
/// otherwise housekeeping requeues an attempt that is still running
/// and a second worker executes it concurrently.
fn manager_settings(config: &ServerConfig, registry: &JobRegistry) -> ManagerSettings {
    let defaults = ManagerSettings::default();
    let longest_attempt = registry
        .definitions()
        .map(|definition| definition.options.attempt_timeout)
        .max()
        .unwrap_or(defaults.stall_threshold);

    ManagerSettings {
        workers_per_queue: config.workers_per_queue,
        poll_interval: config.poll_interval(),
        stall_threshold: defaults.stall_threshold.max(longest_attempt + STALL_MARGIN),
        ..defaults
    }
}
