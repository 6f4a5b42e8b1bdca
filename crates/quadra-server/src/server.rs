//! Main Quadra Server implementation
//!
//! This module contains the QuadraServer implementation.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};

use quadra_core::{
    BoardSnapshot, FlowHandle, FlowSpec, JobId, JobInstance, JobManager, JobName, JobState,
    QueueName, Season,
};
use quadra_lock::LockService;
use quadra_reconcile::hash_value;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::jobs::{
    ComponentsSyncPayload, EnrollmentsSyncPayload, StudentSyncPayload, COMPONENTS_SYNC,
    ENROLLMENTS_STUDENT_SYNC, ENROLLMENTS_SYNC, SYNC_QUEUE,
};
use crate::upstream::UpstreamProvider;

/// How long a component sync preview stays confirmable
const PREVIEW_TTL: Duration = Duration::from_secs(10 * 60);

/// How many items a preview response includes as a sample
const PREVIEW_SAMPLE_SIZE: usize = 3;

/// A pending component sync preview, confirmable by its content hash
#[derive(Debug, Clone)]
struct PreviewEntry {
    season: Season,
    created_at: Instant,
}

/// Preview of a component sync: what the caller confirms to dispatch
#[derive(Debug, Clone, Serialize)]
pub struct ComponentsPreview {
    /// Content hash of the fetched catalog; echo it back to confirm
    pub hash: String,

    /// Number of components the sync would reconcile
    pub size: usize,

    /// First few items, for a human eyeballing the trigger
    pub sample: Vec<Value>,
}

/// Outcome of dispatching an enrollment sync flow
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentsDispatch {
    /// Parent job id of the flow
    pub parent_id: JobId,

    /// Per-student child job ids
    pub child_ids: Vec<JobId>,

    /// Number of students in the flow
    pub students: usize,
}

/// Main server implementation
pub struct QuadraServer {
    /// Configuration
    pub config: ServerConfig,

    /// Job engine
    manager: Arc<JobManager>,

    /// Distributed lock service (health checks only; handlers own
    /// their own handle)
    lock: Arc<dyn LockService>,

    /// Upstream academic data API
    upstream: Arc<dyn UpstreamProvider>,

    /// Pending component sync previews - hash -> entry
    preview_cache: DashMap<String, PreviewEntry>,
}

impl std::fmt::Debug for QuadraServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuadraServer")
            .field("config", &self.config)
            .field("preview_cache_size", &self.preview_cache.len())
            .finish()
    }
}

impl QuadraServer {
    /// Create a new QuadraServer
    pub fn new(
        config: ServerConfig,
        manager: Arc<JobManager>,
        lock: Arc<dyn LockService>,
        upstream: Arc<dyn UpstreamProvider>,
    ) -> Self {
        Self {
            config,
            manager,
            lock,
            upstream,
            preview_cache: DashMap::new(),
        }
    }

    /// Run the server: start the job engine, serve the API until
    /// ctrl-c, then stop the engine so in-flight attempts drain.
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting Quadra Server");

        let manager = self.manager.clone();
        manager.start().await?;

        let bind = format!("{}:{}", self.config.bind_address, self.config.port);
        let app = crate::api::build_router(Arc::new(self));

        let listener = TcpListener::bind(&bind).await?;
        let addr: SocketAddr = listener.local_addr()?;
        info!("Listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        manager.stop().await;
        info!("Quadra Server stopped");
        Ok(())
    }

    fn resolve_season(&self, season: Option<&str>) -> ServerResult<Season> {
        match season {
            Some(s) => Season::from_str(s)
                .map_err(|e| ServerError::ValidationError(format!("Invalid season: {}", e))),
            None => self.config.default_season(),
        }
    }

    /// Phase one of a component sync trigger: fetch the catalog, hash
    /// it, and return a confirmable preview. Nothing is dispatched yet.
    pub async fn preview_components(&self, season: Option<&str>) -> ServerResult<ComponentsPreview> {
        let season = self.resolve_season(season)?;

        let fetched = self
            .upstream
            .get_components(&season)
            .await
            .map_err(|e| ServerError::UpstreamError(format!("{}", e)))?;

        let mut items = Vec::with_capacity(fetched.items.len());
        for component in &fetched.items {
            items.push(serde_json::to_value(component)?);
        }
        let hash = hash_value(&json!({
            "season": season.to_string(),
            "components": items,
        }))
        .into_string();

        let sample = items.iter().take(PREVIEW_SAMPLE_SIZE).cloned().collect();

        self.prune_previews();
        self.preview_cache.insert(
            hash.clone(),
            PreviewEntry {
                season,
                created_at: Instant::now(),
            },
        );

        info!(
            season = %season,
            size = items.len(),
            skipped = fetched.skipped,
            "Component sync preview created"
        );

        Ok(ComponentsPreview {
            hash,
            size: items.len(),
            sample,
        })
    }

    /// Phase two: dispatch the sync a preview described. The hash must
    /// match a live preview; anything else means the caller is
    /// confirming stale data.
    pub async fn confirm_components(&self, hash: &str) -> ServerResult<JobId> {
        let entry = match self.preview_cache.remove(hash) {
            Some((_, entry)) if entry.created_at.elapsed() <= PREVIEW_TTL => entry,
            Some(_) => {
                return Err(ServerError::ValidationError(
                    "Preview expired, request a new one".to_string(),
                ))
            }
            None => {
                return Err(ServerError::ValidationError(
                    "Unknown preview hash, request a new preview".to_string(),
                ))
            }
        };

        let payload = serde_json::to_value(ComponentsSyncPayload {
            season: Some(entry.season.to_string()),
        })?;

        let job_id = self
            .manager
            .dispatch(&JobName::new(COMPONENTS_SYNC), payload)
            .await?;

        info!(season = %entry.season, job_id = %job_id, "Component sync dispatched");
        Ok(job_id)
    }

    /// Dispatch an enrollment sync flow: fetch enrollments from the
    /// provided upstream link once, then fan out one child per student
    /// with its enrollments embedded.
    pub async fn trigger_enrollments(
        &self,
        link: &str,
        season: Option<&str>,
    ) -> ServerResult<EnrollmentsDispatch> {
        let season = self.resolve_season(season)?;

        let fetched = self
            .upstream
            .get_enrollments(link)
            .await
            .map_err(|e| ServerError::UpstreamError(format!("{}", e)))?;

        if fetched.skipped > 0 {
            warn!(
                season = %season,
                skipped = fetched.skipped,
                "Upstream returned malformed enrollment entries"
            );
        }

        if fetched.items.is_empty() {
            return Err(ServerError::ValidationError(
                "No enrollments found at the provided link".to_string(),
            ));
        }

        let parent_payload = serde_json::to_value(EnrollmentsSyncPayload {
            season: season.to_string(),
            student_count: fetched.items.len(),
        })?;

        let mut spec = FlowSpec::new(
            JobName::new(ENROLLMENTS_SYNC),
            QueueName::new(SYNC_QUEUE),
            parent_payload,
        );

        // Deterministic child order for stable ids in responses
        let mut students: Vec<_> = fetched.items.into_iter().collect();
        students.sort_by(|a, b| a.0.cmp(&b.0));
        let student_count = students.len();

        for (student_id, components) in students {
            let child_payload = serde_json::to_value(StudentSyncPayload {
                season: season.to_string(),
                student_id,
                components,
            })?;
            spec = spec.with_child(JobName::new(ENROLLMENTS_STUDENT_SYNC), child_payload);
        }

        let handle: FlowHandle = self.manager.dispatch_flow(spec).await?;

        info!(
            season = %season,
            parent_id = %handle.parent_id,
            students = student_count,
            "Enrollment sync flow dispatched"
        );

        Ok(EnrollmentsDispatch {
            parent_id: handle.parent_id,
            child_ids: handle.child_ids,
            students: student_count,
        })
    }

    /// Per-queue job counts for the board
    pub async fn board(&self) -> ServerResult<BoardSnapshot> {
        Ok(self.manager.board().await?)
    }

    /// Jobs in a queue, optionally filtered by state
    pub async fn queue_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
    ) -> ServerResult<Vec<JobInstance>> {
        Ok(self
            .manager
            .backend()
            .jobs_in_state(&QueueName::new(queue), state)
            .await?)
    }

    /// Full detail of one job
    pub async fn job_detail(&self, id: &str) -> ServerResult<JobInstance> {
        self.manager
            .backend()
            .get_job(&JobId(id.to_string()))
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Job {}", id)))
    }

    /// Re-enqueue a failed job with a fresh attempt budget
    pub async fn retry_job(&self, id: &str) -> ServerResult<()> {
        Ok(self
            .manager
            .backend()
            .retry_job(&JobId(id.to_string()))
            .await?)
    }

    /// Remove a job record from the board
    pub async fn remove_job(&self, id: &str) -> ServerResult<()> {
        let removed = self
            .manager
            .backend()
            .remove_job(&JobId(id.to_string()))
            .await?;
        if !removed {
            return Err(ServerError::NotFound(format!("Job {}", id)));
        }
        Ok(())
    }

    /// Whether board write endpoints require a bearer token
    pub fn admin_auth_required(&self) -> bool {
        self.config.admin_api_key.is_some()
    }

    /// Validate an admin bearer token against the configured key
    pub fn validate_admin_token(&self, token: &str) -> bool {
        match &self.config.admin_api_key {
            Some(key) => token == key,
            None => true,
        }
    }

    /// Health summary: engine liveness and lock backend reachability
    pub async fn health(&self) -> Value {
        let lock_ok = match self.lock.health_check().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "Lock service health check failed");
                false
            }
        };

        json!({
            "status": if lock_ok { "ok" } else { "degraded" },
            "lock_service": if lock_ok { "ok" } else { "unreachable" },
        })
    }

    fn prune_previews(&self) {
        self.preview_cache
            .retain(|_, entry| entry.created_at.elapsed() <= PREVIEW_TTL);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
