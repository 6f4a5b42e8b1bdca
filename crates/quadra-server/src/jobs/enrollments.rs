use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use quadra_core::{JobContext, JobError, JobHandler, JobName, JobState, QueueBackend, Season};
use quadra_reconcile::{BatchReconciler, EntityStore, ExternalRecord, NaturalKey};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::jobs::{
    ComponentsSyncPayload, EnrollmentsSyncPayload, StudentSyncPayload, COMPONENTS_SYNC,
    ENROLLMENTS_STUDENT_SYNC, ENROLLMENTS_SYNC,
};

/// Handler for the `enrollments:sync` parent job.
///
/// Runs only after every child reached a terminal state, so its work
/// is pure aggregation: summarize child outcomes into the flow result.
/// Failed children make the flow "partial", never failed; the students
/// that did sync stay synced.
pub struct EnrollmentsSyncHandler {
    backend: Arc<dyn QueueBackend>,
}

impl EnrollmentsSyncHandler {
    /// Create the handler over the backend the flow's children live in
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl JobHandler for EnrollmentsSyncHandler {
    fn name(&self) -> &str {
        ENROLLMENTS_SYNC
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let payload: EnrollmentsSyncPayload = ctx.payload_as()?;

        let children = self
            .backend
            .children_of(&ctx.job_id)
            .await
            .map_err(|e| JobError::retryable(format!("Failed to read child jobs: {}", e)))?;

        let succeeded = children
            .iter()
            .filter(|c| c.state == JobState::Completed)
            .count();
        let failed = children
            .iter()
            .filter(|c| c.state == JobState::Failed)
            .count();

        let status = if failed == 0 { "completed" } else { "partial" };
        if failed > 0 {
            warn!(
                season = %payload.season,
                failed,
                total = children.len(),
                "Enrollment flow finished with failed children"
            );
        } else {
            info!(
                season = %payload.season,
                students = children.len(),
                "Enrollment flow finished"
            );
        }

        Ok(json!({
            "status": status,
            "season": payload.season,
            "children": children.len(),
            "succeeded": succeeded,
            "failed": failed,
        }))
    }
}

/// Handler for the `enrollments:sync:student` child job.
///
/// Verifies every referenced component exists in the local catalog
/// before writing enrollments. An unknown component means the catalog
/// is stale: the handler dispatches a `components:sync` and returns a
/// retryable error so its own retry re-resolves once the catalog run
/// lands.
pub struct EnrollmentStudentSyncHandler {
    component_store: Arc<dyn EntityStore>,
    reconciler: BatchReconciler,
}

impl EnrollmentStudentSyncHandler {
    /// Create the handler with its collaborators
    pub fn new(component_store: Arc<dyn EntityStore>, reconciler: BatchReconciler) -> Self {
        Self {
            component_store,
            reconciler,
        }
    }
}

#[async_trait]
impl JobHandler for EnrollmentStudentSyncHandler {
    fn name(&self) -> &str {
        ENROLLMENTS_STUDENT_SYNC
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let payload: StudentSyncPayload = ctx.payload_as()?;
        let season = Season::from_str(&payload.season)
            .map_err(|e| JobError::fatal(format!("Invalid season in payload: {}", e)))?;

        let mut missing = Vec::new();
        for component in &payload.components {
            let key = NaturalKey::new(season, component.id.clone());
            match self.component_store.get(&key).await {
                Ok(Some(_)) => {}
                Ok(None) => missing.push(component.id.clone()),
                Err(e) => {
                    return Err(JobError::retryable(format!(
                        "Component lookup failed for {}: {}",
                        key, e
                    )))
                }
            }
        }

        if !missing.is_empty() {
            let sync_payload = serde_json::to_value(ComponentsSyncPayload {
                season: Some(payload.season.clone()),
            })
            .map_err(|e| JobError::fatal(format!("Payload not serializable: {}", e)))?;

            match ctx
                .dispatcher()
                .dispatch(&JobName::new(COMPONENTS_SYNC), sync_payload)
                .await
            {
                Ok(job_id) => info!(
                    student = %payload.student_id,
                    missing = missing.len(),
                    dispatched = %job_id,
                    "Unknown components, dispatched catalog sync"
                ),
                Err(e) => warn!(
                    student = %payload.student_id,
                    error = %e,
                    "Failed to dispatch catalog sync for unknown components"
                ),
            }

            return Err(JobError::retryable(format!(
                "{} unknown component(s) for student {}, catalog sync dispatched",
                missing.len(),
                payload.student_id
            )));
        }

        let mut records = Vec::with_capacity(payload.components.len());
        for component in &payload.components {
            let component_value = serde_json::to_value(component)
                .map_err(|e| JobError::fatal(format!("Component not serializable: {}", e)))?;
            records.push(ExternalRecord::new(
                NaturalKey::new(
                    season,
                    format!("{}:{}", payload.student_id, component.id),
                ),
                json!({
                    "student_id": payload.student_id,
                    "component_id": component.id,
                    "season": payload.season,
                    "component": component_value,
                }),
            ));
        }

        let report = self.reconciler.reconcile(records).await;
        if !report.is_clean() {
            return Err(JobError::retryable(format!(
                "enrollment sync for student {} left {} batch(es) and {} record(s) unwritten",
                payload.student_id,
                report.errors.len(),
                report.record_errors.len()
            )));
        }

        Ok(json!({
            "status": "completed",
            "student_id": payload.student_id,
            "season": payload.season,
            "enrollments": payload.components.len(),
            "modified": report.modified_count,
            "upserted": report.upserted_count,
            "skipped": report.skipped_count,
        }))
    }
}
