use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{JobId, JobName, QueueName};

/// Lifecycle event emitted by the worker runtime after a backend state
/// transition.
///
/// A closed enum rather than boxed trait objects: the set of job
/// lifecycle transitions is fixed, and a `Clone`-able value is what
/// `tokio::sync::broadcast` subscribers need.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Handler returned success; job is terminal
    Completed {
        /// Job that completed
        job_id: JobId,
        /// Job type name
        name: JobName,
        /// Queue the job ran on
        queue: QueueName,
        /// Parent job when this was a flow child
        parent_id: Option<JobId>,
        /// When the transition happened
        timestamp: DateTime<Utc>,
    },

    /// Handler failed retryably with attempts remaining; job requeued
    Retrying {
        /// Job being retried
        job_id: JobId,
        /// Job type name
        name: JobName,
        /// Queue the job ran on
        queue: QueueName,
        /// Attempt that just failed (1-based)
        attempt: u32,
        /// Backoff delay before the next attempt
        delay: Duration,
        /// Failure message
        error: String,
        /// When the transition happened
        timestamp: DateTime<Utc>,
    },

    /// Attempts exhausted or fatal failure; job is terminal
    Failed {
        /// Job that failed
        job_id: JobId,
        /// Job type name
        name: JobName,
        /// Queue the job ran on
        queue: QueueName,
        /// Parent job when this was a flow child
        parent_id: Option<JobId>,
        /// Failure message
        error: String,
        /// When the transition happened
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Event type as a dotted string, for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Completed { .. } => "job.completed",
            JobEvent::Retrying { .. } => "job.retrying",
            JobEvent::Failed { .. } => "job.failed",
        }
    }

    /// Job this event is about
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Completed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Failed { job_id, .. } => job_id,
        }
    }

    /// Whether the job reached a terminal state with this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }

    /// Parent link for flow bookkeeping, when the job was a child
    pub fn parent_id(&self) -> Option<&JobId> {
        match self {
            JobEvent::Completed { parent_id, .. } | JobEvent::Failed { parent_id, .. } => {
                parent_id.as_ref()
            }
            JobEvent::Retrying { .. } => None,
        }
    }
}
