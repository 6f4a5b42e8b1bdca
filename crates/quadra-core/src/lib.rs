//!
//! Quadra Core - job orchestration engine for the Quadra sync platform
//!
//! This crate defines the job/flow domain model, the queue backend
//! contract, the handler seam, and the runtime (registry, dispatch,
//! workers, recurring schedules, lifecycle). Persistence backends and
//! the concrete sync handlers live in sibling crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Domain layer - job and flow model, events, persistence contract
pub mod domain;

/// Runtime layer - registry, dispatch, workers, scheduling, lifecycle
pub mod runtime;

/// Core value objects
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::{CoreError, JobError};
pub use types::{
    Backoff, JobId, JobName, JobOptions, JobState, QueueName, RetentionPolicy, Schedule, Season,
};

pub use domain::events::JobEvent;
pub use domain::flow::{ChildSpec, FlowHandle, FlowSpec};
pub use domain::job::{JobInstance, NewJob};
pub use domain::queue::{QueueBackend, QueueCounts};

pub use runtime::dispatcher::Dispatcher;
pub use runtime::manager::{BoardSnapshot, JobManager, ManagerSettings, QueueBoard};
pub use runtime::registry::{JobDefinition, JobRegistry};

/// Per-attempt execution context handed to a handler.
///
/// Carries the payload and attempt bookkeeping plus a [`Dispatcher`]
/// handle. The dispatcher is there for the retry-driven dependency
/// pattern: a handler that finds a prerequisite missing may dispatch
/// the job that creates it and then return
/// [`JobError::Retryable`], relying on its own retry to re-resolve once
/// the dependency exists.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Id of the job being executed
    pub job_id: JobId,

    /// Job type name
    pub name: JobName,

    /// Handler input
    pub payload: Value,

    /// Current attempt (1-based)
    pub attempt: u32,

    /// Attempt limit for this job
    pub max_attempts: u32,

    dispatcher: Dispatcher,
}

impl JobContext {
    /// Build a context for one attempt of a claimed job
    pub fn new(job: &JobInstance, dispatcher: Dispatcher) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            dispatcher,
        }
    }

    /// Dispatch handle for enqueueing prerequisite work
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Deserialize the payload into a typed value. A malformed payload
    /// is a fatal failure: no retry will fix it.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::fatal(format!("Malformed payload for {}: {}", self.name, e)))
    }

    /// Whether this is the final attempt before the job fails for good
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job handler: the unit of work bound to a job name.
///
/// Handlers own their collaborators (lock service, reconciler,
/// upstream client) via constructor injection; the context carries only
/// per-attempt data. Handlers must be idempotent by natural key: a
/// stalled attempt is re-run from the start.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type name this handler is registered under
    fn name(&self) -> &str;

    /// Execute one attempt. A `Retryable` error schedules a backoff
    /// retry while attempts remain; a `Fatal` error fails the job
    /// immediately.
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    use runtime::flow_tracker::FlowTracker;

    // Minimal backend for exercising the context seam.
    #[derive(Debug, Default)]
    struct NullBackend;

    #[async_trait]
    impl QueueBackend for NullBackend {
        async fn enqueue(&self, _job: NewJob) -> Result<JobId, CoreError> {
            Ok(JobId::generate())
        }

        async fn enqueue_flow(
            &self,
            _parent: NewJob,
            children: Vec<NewJob>,
        ) -> Result<FlowHandle, CoreError> {
            Ok(FlowHandle {
                parent_id: JobId::generate(),
                child_ids: children.iter().map(|_| JobId::generate()).collect(),
            })
        }

        async fn claim(&self, _queue: &QueueName) -> Result<Option<JobInstance>, CoreError> {
            Ok(None)
        }

        async fn complete(&self, _id: &JobId, _result: Value) -> Result<(), CoreError> {
            Ok(())
        }

        async fn retry(
            &self,
            _id: &JobId,
            _delay: std::time::Duration,
            _error: String,
        ) -> Result<(), CoreError> {
            Ok(())
        }

        async fn fail(&self, _id: &JobId, _error: String) -> Result<(), CoreError> {
            Ok(())
        }

        async fn promote_parent(&self, _id: &JobId) -> Result<(), CoreError> {
            Ok(())
        }

        async fn promote_due(&self) -> Result<Vec<JobId>, CoreError> {
            Ok(Vec::new())
        }

        async fn reap_stalled(
            &self,
            _older_than: std::time::Duration,
        ) -> Result<Vec<JobId>, CoreError> {
            Ok(Vec::new())
        }

        async fn get_job(&self, _id: &JobId) -> Result<Option<JobInstance>, CoreError> {
            Ok(None)
        }

        async fn remove_job(&self, _id: &JobId) -> Result<bool, CoreError> {
            Ok(false)
        }

        async fn retry_job(&self, _id: &JobId) -> Result<(), CoreError> {
            Ok(())
        }

        async fn jobs_in_state(
            &self,
            _queue: &QueueName,
            _state: Option<JobState>,
        ) -> Result<Vec<JobInstance>, CoreError> {
            Ok(Vec::new())
        }

        async fn counts(&self, _queue: &QueueName) -> Result<QueueCounts, CoreError> {
            Ok(QueueCounts::default())
        }

        async fn queues(&self) -> Result<Vec<QueueName>, CoreError> {
            Ok(Vec::new())
        }

        async fn children_of(&self, _parent: &JobId) -> Result<Vec<JobInstance>, CoreError> {
            Ok(Vec::new())
        }
    }

    fn test_dispatcher() -> Dispatcher {
        let backend: Arc<dyn QueueBackend> = Arc::new(NullBackend);
        let registry = Arc::new(JobRegistry::new());
        let tracker = Arc::new(FlowTracker::new(backend.clone()));
        Dispatcher::new(registry, backend, tracker)
    }

    fn test_job(payload: Value) -> JobInstance {
        JobInstance {
            id: JobId::generate(),
            name: JobName::new("components:sync"),
            queue: QueueName::new("sync"),
            payload,
            attempt: 3,
            max_attempts: 3,
            state: JobState::Active,
            parent_id: None,
            created_at: Utc::now(),
            processed_at: Some(Utc::now()),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct SyncPayload {
        season: String,
    }

    #[tokio::test]
    async fn test_payload_as_typed() {
        let job = test_job(json!({"season": "2024:3"}));
        let ctx = JobContext::new(&job, test_dispatcher());

        let payload: SyncPayload = ctx.payload_as().unwrap();
        assert_eq!(payload.season, "2024:3");
        assert!(ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_fatal() {
        let job = test_job(json!({"wrong": true}));
        let ctx = JobContext::new(&job, test_dispatcher());

        let err = ctx.payload_as::<SyncPayload>().unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_name_rejected() {
        let dispatcher = test_dispatcher();
        let err = dispatcher
            .dispatch(&JobName::new("no-such-job"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownJob("no-such-job".to_string()));
    }
}
