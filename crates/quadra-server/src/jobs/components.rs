use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quadra_core::{JobContext, JobError, JobHandler, Season};
use quadra_lock::LockService;
use quadra_reconcile::{BatchReconciler, ExternalRecord, NaturalKey};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::jobs::{ComponentsSyncPayload, COMPONENTS_SYNC};
use crate::upstream::UpstreamProvider;

/// Handler for `components:sync`: fetch the season's component catalog
/// from upstream and reconcile it into the entity store.
///
/// Runs under a distributed lock keyed by season so overlapping
/// triggers (cron plus on-demand) never sync the same catalog twice at
/// once. Losing the lock race is a successful no-op, not a failure.
pub struct ComponentsSyncHandler {
    lock: Arc<dyn LockService>,
    upstream: Arc<dyn UpstreamProvider>,
    reconciler: BatchReconciler,
    default_season: Season,
    lock_ttl: Duration,
}

impl ComponentsSyncHandler {
    /// Create the handler with its collaborators
    pub fn new(
        lock: Arc<dyn LockService>,
        upstream: Arc<dyn UpstreamProvider>,
        reconciler: BatchReconciler,
        default_season: Season,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            lock,
            upstream,
            reconciler,
            default_season,
            lock_ttl,
        }
    }

    async fn sync(&self, season: &Season) -> Result<Value, JobError> {
        let fetched = self
            .upstream
            .get_components(season)
            .await
            .map_err(|e| JobError::retryable(format!("Component fetch failed: {}", e)))?;

        if fetched.skipped > 0 {
            warn!(
                season = %season,
                skipped = fetched.skipped,
                "Upstream returned malformed component items"
            );
        }

        let mut records = Vec::with_capacity(fetched.items.len());
        for component in &fetched.items {
            let payload = serde_json::to_value(component)
                .map_err(|e| JobError::fatal(format!("Component not serializable: {}", e)))?;
            records.push(ExternalRecord::new(
                NaturalKey::new(*season, component.id.clone()),
                payload,
            ));
        }

        let report = self.reconciler.reconcile(records).await;
        info!(
            season = %season,
            processed = report.processed_count,
            modified = report.modified_count,
            upserted = report.upserted_count,
            skipped = report.skipped_count,
            "Component sync finished"
        );

        if !report.is_clean() {
            return Err(JobError::retryable(format!(
                "component sync for {} left {} batch(es) and {} record(s) unwritten",
                season,
                report.errors.len(),
                report.record_errors.len()
            )));
        }

        Ok(json!({
            "status": "completed",
            "season": season.to_string(),
            "processed": report.processed_count,
            "modified": report.modified_count,
            "upserted": report.upserted_count,
            "skipped": report.skipped_count,
            "upstream_skipped": fetched.skipped,
        }))
    }
}

#[async_trait]
impl JobHandler for ComponentsSyncHandler {
    fn name(&self) -> &str {
        COMPONENTS_SYNC
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let payload: ComponentsSyncPayload = ctx.payload_as()?;
        let season = match payload.season {
            Some(s) => Season::from_str(&s)
                .map_err(|e| JobError::fatal(format!("Invalid season in payload: {}", e)))?,
            None => self.default_season,
        };

        let lock_key = format!("sync:components:{}", season);
        let acquired = self
            .lock
            .acquire(&lock_key, self.lock_ttl)
            .await
            .map_err(|e| JobError::retryable(format!("Lock service unavailable: {}", e)))?;

        if !acquired {
            info!(season = %season, "Component sync already running, skipping");
            return Ok(json!({
                "status": "skipped",
                "reason": "sync already running",
                "season": season.to_string(),
            }));
        }

        let result = self.sync(&season).await;

        if let Err(e) = self.lock.release(&lock_key).await {
            warn!(key = %lock_key, error = %e, "Failed to release sync lock");
        }

        result
    }
}
