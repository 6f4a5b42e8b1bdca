use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::domain::flow::FlowHandle;
use crate::domain::job::{JobInstance, NewJob};
use crate::error::CoreError;
use crate::types::{JobId, JobState, QueueName};

/// Per-queue job counts by state, for the introspection board
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Jobs ready to be claimed
    pub waiting: usize,
    /// Jobs waiting out a delay
    pub delayed: usize,
    /// Jobs currently executing
    pub active: usize,
    /// Flow parents barred on their children
    pub waiting_children: usize,
    /// Retained completed jobs
    pub completed: usize,
    /// Retained failed jobs
    pub failed: usize,
}

/// Persistence contract for job instances and flow linkage.
///
/// The backend is the single source of truth for job state. It must
/// make `claim` atomic: no two workers may ever hold the same attempt
/// of the same job. Everything above this trait treats persistence as
/// durable and crash-recoverable rather than re-implementing it.
#[async_trait]
pub trait QueueBackend: Send + Sync + Debug {
    /// Persist a single job. Delayed jobs start in `Delayed`,
    /// everything else in `Waiting`.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, CoreError>;

    /// Atomically persist a parent in `WaitingChildren` plus its
    /// children in `Waiting`, linked by `parent_id`.
    async fn enqueue_flow(
        &self,
        parent: NewJob,
        children: Vec<NewJob>,
    ) -> Result<FlowHandle, CoreError>;

    /// Claim the next ready job on a queue, moving it to `Active` and
    /// incrementing its attempt counter. Returns the claimed snapshot,
    /// exactly once per ready attempt.
    async fn claim(&self, queue: &QueueName) -> Result<Option<JobInstance>, CoreError>;

    /// Mark an active job completed, store its result, and apply the
    /// completion retention policy.
    async fn complete(&self, id: &JobId, result: Value) -> Result<(), CoreError>;

    /// Return an active job to `Delayed` for another attempt after the
    /// backoff delay.
    async fn retry(&self, id: &JobId, delay: Duration, error: String) -> Result<(), CoreError>;

    /// Mark an active job failed, store the error, and apply the
    /// failure retention policy.
    async fn fail(&self, id: &JobId, error: String) -> Result<(), CoreError>;

    /// Promote a flow parent from `WaitingChildren` to `Waiting` once
    /// its completion barrier is down.
    async fn promote_parent(&self, id: &JobId) -> Result<(), CoreError>;

    /// Promote `Delayed` jobs whose delay has elapsed back to
    /// `Waiting`. Returns the promoted ids.
    async fn promote_due(&self) -> Result<Vec<JobId>, CoreError>;

    /// Return `Active` jobs claimed longer than `older_than` ago to
    /// `Waiting` as a fresh attempt. Handlers must therefore be safe to
    /// re-run from the start.
    async fn reap_stalled(&self, older_than: Duration) -> Result<Vec<JobId>, CoreError>;

    /// Fetch a job snapshot by id
    async fn get_job(&self, id: &JobId) -> Result<Option<JobInstance>, CoreError>;

    /// Remove a job record outright (board action). Returns whether a
    /// record was removed.
    async fn remove_job(&self, id: &JobId) -> Result<bool, CoreError>;

    /// Requeue a failed job as a fresh attempt (board action)
    async fn retry_job(&self, id: &JobId) -> Result<(), CoreError>;

    /// List jobs on a queue, optionally filtered by state
    async fn jobs_in_state(
        &self,
        queue: &QueueName,
        state: Option<JobState>,
    ) -> Result<Vec<JobInstance>, CoreError>;

    /// Counts by state for one queue
    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, CoreError>;

    /// All queues the backend has seen jobs for
    async fn queues(&self) -> Result<Vec<QueueName>, CoreError>;

    /// Children linked to a parent job
    async fn children_of(&self, parent: &JobId) -> Result<Vec<JobInstance>, CoreError>;
}
