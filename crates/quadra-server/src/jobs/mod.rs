//! Job handlers for the sync pipeline and their registry wiring.

use std::sync::Arc;
use std::time::Duration;

use quadra_core::{
    Backoff, JobOptions, JobRegistry, JobDefinition, QueueBackend, RetentionPolicy, Schedule,
};
use quadra_lock::LockService;
use quadra_reconcile::{BatchReconciler, EntityStore, HashCache};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::upstream::{UpstreamComponent, UpstreamProvider};

mod components;
mod enrollments;

pub use components::ComponentsSyncHandler;
pub use enrollments::{EnrollmentStudentSyncHandler, EnrollmentsSyncHandler};

/// Queue all sync jobs run on
pub const SYNC_QUEUE: &str = "sync";

/// Full catalog sync of course components for a season
pub const COMPONENTS_SYNC: &str = "components:sync";

/// Parent job of an enrollment sync flow
pub const ENROLLMENTS_SYNC: &str = "enrollments:sync";

/// Per-student child job of an enrollment sync flow
pub const ENROLLMENTS_STUDENT_SYNC: &str = "enrollments:sync:student";

/// Payload of a `components:sync` job. The scheduler dispatches an
/// empty payload, in which case the configured default season applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentsSyncPayload {
    /// Season to sync, "year:term"
    pub season: Option<String>,
}

/// Payload of an `enrollments:sync` parent job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentsSyncPayload {
    /// Season the flow covers
    pub season: String,

    /// Number of per-student children dispatched with this parent
    pub student_count: usize,
}

/// Payload of an `enrollments:sync:student` child job. Enrollments are
/// fetched once at trigger time and embedded here so children do not
/// re-hit the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSyncPayload {
    /// Season the enrollments belong to
    pub season: String,

    /// Student the enrollments belong to
    pub student_id: String,

    /// Components the student is enrolled in
    pub components: Vec<UpstreamComponent>,
}

pub(crate) fn sync_options() -> JobOptions {
    JobOptions {
        max_attempts: 3,
        backoff: Backoff::Exponential {
            base: Duration::from_secs(2),
        },
        remove_on_complete: RetentionPolicy::KeepLast(50),
        remove_on_fail: RetentionPolicy::Keep,
        attempt_timeout: Duration::from_secs(10 * 60),
    }
}

/// Build the registry of sync job definitions.
///
/// The components sync carries the configured cron schedule when one is
/// set; an empty `sync_cron` disables recurring runs and leaves only
/// on-demand dispatch through the API.
pub fn build_registry(
    config: &ServerConfig,
    lock: Arc<dyn LockService>,
    upstream: Arc<dyn UpstreamProvider>,
    backend: Arc<dyn QueueBackend>,
    component_store: Arc<dyn EntityStore>,
    enrollment_store: Arc<dyn EntityStore>,
    component_hash_cache: Arc<dyn HashCache>,
    enrollment_hash_cache: Arc<dyn HashCache>,
) -> ServerResult<JobRegistry> {
    let component_reconciler = BatchReconciler::with_batch_size(
        component_store.clone(),
        component_hash_cache,
        config.batch_size,
    );
    let enrollment_reconciler = BatchReconciler::with_batch_size(
        enrollment_store,
        enrollment_hash_cache,
        config.batch_size,
    );

    let components_handler = ComponentsSyncHandler::new(
        lock,
        upstream,
        component_reconciler,
        config.default_season()?,
        config.lock_ttl(),
    );

    let mut registry = JobRegistry::new();

    let mut components_def = JobDefinition::new(
        COMPONENTS_SYNC,
        SYNC_QUEUE,
        Arc::new(components_handler),
    )
    .with_options(sync_options());
    if !config.sync_cron.is_empty() {
        components_def = components_def.with_schedule(Schedule::Cron(config.sync_cron.clone()));
    }
    registry.register(components_def)?;

    registry.register(
        JobDefinition::new(
            ENROLLMENTS_SYNC,
            SYNC_QUEUE,
            Arc::new(EnrollmentsSyncHandler::new(backend)),
        )
        .with_options(sync_options()),
    )?;

    registry.register(
        JobDefinition::new(
            ENROLLMENTS_STUDENT_SYNC,
            SYNC_QUEUE,
            Arc::new(EnrollmentStudentSyncHandler::new(
                component_store,
                enrollment_reconciler,
            )),
        )
        .with_options(sync_options()),
    )?;

    Ok(registry)
}
