use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::domain::flow::{FlowHandle, FlowSpec};
use crate::domain::job::NewJob;
use crate::domain::queue::QueueBackend;
use crate::error::CoreError;
use crate::runtime::flow_tracker::FlowTracker;
use crate::runtime::registry::JobRegistry;
use crate::types::{JobId, JobName};

/// Cheap, cloneable enqueue handle.
///
/// Resolves names against the registry and persists through the
/// backend; also what handlers receive (via [`crate::JobContext`]) to
/// dispatch prerequisite work.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    backend: Arc<dyn QueueBackend>,
    tracker: Arc<FlowTracker>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry and backend
    pub fn new(
        registry: Arc<JobRegistry>,
        backend: Arc<dyn QueueBackend>,
        tracker: Arc<FlowTracker>,
    ) -> Self {
        Self {
            registry,
            backend,
            tracker,
        }
    }

    /// Enqueue a single job of a registered type. Unknown names are
    /// rejected.
    pub async fn dispatch(&self, name: &JobName, payload: Value) -> Result<JobId, CoreError> {
        let definition = self
            .registry
            .get(name)
            .ok_or_else(|| CoreError::UnknownJob(name.to_string()))?;

        let job = NewJob::new(definition.name.clone(), definition.queue.clone(), payload)
            .with_options(definition.options.clone());
        let job_id = self.backend.enqueue(job).await?;
        debug!(job = %name, job_id = %job_id, "Dispatched job");
        Ok(job_id)
    }

    /// Atomically enqueue a flow: one parent (barred on its children)
    /// plus the children. Parent and child names must all be
    /// registered.
    pub async fn dispatch_flow(&self, spec: FlowSpec) -> Result<FlowHandle, CoreError> {
        let parent_def = self
            .registry
            .get(&spec.name)
            .ok_or_else(|| CoreError::UnknownJob(spec.name.to_string()))?;

        let mut children = Vec::with_capacity(spec.children.len());
        for child in &spec.children {
            let child_def = self
                .registry
                .get(&child.name)
                .ok_or_else(|| CoreError::UnknownJob(child.name.to_string()))?;
            children.push(
                NewJob::new(
                    child_def.name.clone(),
                    child_def.queue.clone(),
                    child.payload.clone(),
                )
                .with_options(child_def.options.clone()),
            );
        }

        let parent = NewJob::new(
            parent_def.name.clone(),
            spec.queue.clone(),
            spec.parent_payload.clone(),
        )
        .with_options(parent_def.options.clone());

        let handle = self.backend.enqueue_flow(parent, children).await?;
        self.tracker
            .register(&handle.parent_id, handle.child_ids.len())
            .await?;

        debug!(
            flow = %spec.name,
            parent_id = %handle.parent_id,
            children = handle.child_ids.len(),
            "Dispatched flow"
        );
        Ok(handle)
    }

    /// The tracker this dispatcher registers flows with
    pub(crate) fn tracker(&self) -> &Arc<FlowTracker> {
        &self.tracker
    }

    /// The registry this dispatcher resolves names against
    pub(crate) fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// The backend this dispatcher persists through
    pub(crate) fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }
}
