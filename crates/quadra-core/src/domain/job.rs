use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{JobId, JobName, JobOptions, JobState, QueueName};

/// Aggregate: a single job on a queue.
///
/// The queue backend owns the authoritative copy; the manager and the
/// worker runtime only ever hold snapshots of it. All state transitions
/// go through the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    /// Unique identifier
    pub id: JobId,

    /// Registered job type name
    pub name: JobName,

    /// Queue the job is processed on
    pub queue: QueueName,

    /// Handler input
    pub payload: Value,

    /// Current attempt number (0 until first claim, then 1-based)
    pub attempt: u32,

    /// Attempt limit copied from the definition at enqueue time
    pub max_attempts: u32,

    /// Current state
    pub state: JobState,

    /// Parent job when this job is a flow child
    pub parent_id: Option<JobId>,

    /// When the job was enqueued
    pub created_at: DateTime<Utc>,

    /// When the most recent attempt was claimed
    pub processed_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,

    /// Handler result once completed
    pub result: Option<Value>,

    /// Last failure message, kept across retries for inspection
    pub error: Option<String>,
}

/// Enqueue request handed to the queue backend.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Registered job type name
    pub name: JobName,

    /// Target queue
    pub queue: QueueName,

    /// Handler input
    pub payload: Value,

    /// Execution options copied from the definition
    pub options: JobOptions,

    /// When set, the job starts in `Delayed` and is promoted after
    /// this much time
    pub delay: Option<Duration>,
}

impl NewJob {
    /// Build an enqueue request with default options and no delay
    pub fn new(name: JobName, queue: QueueName, payload: Value) -> Self {
        Self {
            name,
            queue,
            payload,
            options: JobOptions::default(),
            delay: None,
        }
    }

    /// Replace the execution options
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Delay the first claim
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}
