//! In-memory implementation of the Quadra queue backend.
//!
//! Holds every job under a single `RwLock`, which makes the claim path
//! trivially atomic: one writer moves a job from `Waiting` to `Active`,
//! so no two workers can ever hold the same attempt. Suitable for tests
//! and single-process deployments; a durable backend implements the
//! same [`QueueBackend`] contract.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use quadra_core::{
    CoreError, FlowHandle, JobId, JobInstance, JobState, NewJob, QueueBackend, QueueCounts,
    QueueName, RetentionPolicy,
};

#[cfg(test)]
mod tests;

/// One stored job record plus backend-only bookkeeping
#[derive(Debug, Clone)]
struct StoredJob {
    job: JobInstance,
    remove_on_complete: RetentionPolicy,
    remove_on_fail: RetentionPolicy,
    /// When a `Delayed` job becomes ready
    ready_at: Option<Instant>,
    /// When the current `Active` attempt was claimed
    claimed_at: Option<Instant>,
    /// Monotonic insertion order, for FIFO claims
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, new_job: NewJob, parent_id: Option<JobId>, barred: bool) -> JobId {
        let id = JobId::generate();
        let now = Utc::now();

        let state = if barred {
            JobState::WaitingChildren
        } else if new_job.delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let stored = StoredJob {
            job: JobInstance {
                id: id.clone(),
                name: new_job.name,
                queue: new_job.queue,
                payload: new_job.payload,
                attempt: 0,
                max_attempts: new_job.options.max_attempts,
                state,
                parent_id,
                created_at: now,
                processed_at: None,
                finished_at: None,
                result: None,
                error: None,
            },
            remove_on_complete: new_job.options.remove_on_complete,
            remove_on_fail: new_job.options.remove_on_fail,
            ready_at: new_job.delay.map(|d| Instant::now() + d),
            claimed_at: None,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.jobs.insert(id.clone(), stored);
        id
    }

    fn apply_retention(&mut self, id: &JobId) {
        let Some(stored) = self.jobs.get(id) else {
            return;
        };
        let policy = match stored.job.state {
            JobState::Completed => stored.remove_on_complete,
            JobState::Failed => stored.remove_on_fail,
            _ => return,
        };

        match policy {
            RetentionPolicy::Keep => {}
            RetentionPolicy::Remove => {
                self.jobs.remove(id);
            }
            RetentionPolicy::KeepLast(keep) => {
                let state = stored.job.state;
                let queue = stored.job.queue.clone();
                let name = stored.job.name.clone();

                let mut peers: Vec<(u64, JobId)> = self
                    .jobs
                    .values()
                    .filter(|s| {
                        s.job.state == state && s.job.queue == queue && s.job.name == name
                    })
                    .map(|s| (s.seq, s.job.id.clone()))
                    .collect();
                peers.sort_by_key(|(seq, _)| *seq);

                while peers.len() > keep {
                    let (_, oldest) = peers.remove(0);
                    self.jobs.remove(&oldest);
                }
            }
        }
    }
}

/// In-memory queue backend
#[derive(Debug, Default)]
pub struct InMemoryQueueBackend {
    inner: RwLock<Inner>,
}

impl InMemoryQueueBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored job records (test/introspection helper)
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    /// Whether no job records are stored
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, CoreError> {
        let mut inner = self.inner.write().await;
        let id = inner.insert(job, None, false);
        debug!(job_id = %id, "Enqueued job");
        Ok(id)
    }

    async fn enqueue_flow(
        &self,
        parent: NewJob,
        children: Vec<NewJob>,
    ) -> Result<FlowHandle, CoreError> {
        // One write lock so the parent and its children appear together.
        let mut inner = self.inner.write().await;
        let parent_id = inner.insert(parent, None, true);

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            child_ids.push(inner.insert(child, Some(parent_id.clone()), false));
        }

        debug!(parent_id = %parent_id, children = child_ids.len(), "Enqueued flow");
        Ok(FlowHandle {
            parent_id,
            child_ids,
        })
    }

    async fn claim(&self, queue: &QueueName) -> Result<Option<JobInstance>, CoreError> {
        let mut inner = self.inner.write().await;

        let next = inner
            .jobs
            .values()
            .filter(|s| s.job.queue == *queue && s.job.state == JobState::Waiting)
            .min_by_key(|s| s.seq)
            .map(|s| s.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let stored = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;
        stored.job.state = JobState::Active;
        stored.job.attempt += 1;
        stored.job.processed_at = Some(Utc::now());
        stored.claimed_at = Some(Instant::now());
        Ok(Some(stored.job.clone()))
    }

    async fn complete(&self, id: &JobId, result: Value) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;

        if stored.job.state != JobState::Active {
            return Err(CoreError::InvalidTransition {
                job_id: id.to_string(),
                reason: format!("cannot complete from {}", stored.job.state),
            });
        }
        stored.job.state = JobState::Completed;
        stored.job.finished_at = Some(Utc::now());
        stored.job.result = Some(result);
        stored.claimed_at = None;

        inner.apply_retention(id);
        Ok(())
    }

    async fn retry(&self, id: &JobId, delay: Duration, error: String) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;

        if stored.job.state != JobState::Active {
            return Err(CoreError::InvalidTransition {
                job_id: id.to_string(),
                reason: format!("cannot retry from {}", stored.job.state),
            });
        }
        stored.job.state = JobState::Delayed;
        stored.job.error = Some(error);
        stored.ready_at = Some(Instant::now() + delay);
        stored.claimed_at = None;
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: String) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;

        if stored.job.state != JobState::Active {
            return Err(CoreError::InvalidTransition {
                job_id: id.to_string(),
                reason: format!("cannot fail from {}", stored.job.state),
            });
        }
        stored.job.state = JobState::Failed;
        stored.job.finished_at = Some(Utc::now());
        stored.job.error = Some(error);
        stored.claimed_at = None;

        inner.apply_retention(id);
        Ok(())
    }

    async fn promote_parent(&self, id: &JobId) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;

        // Idempotent: a parent already past the barrier stays put.
        if stored.job.state == JobState::WaitingChildren {
            stored.job.state = JobState::Waiting;
            debug!(job_id = %id, "Flow parent promoted");
        }
        Ok(())
    }

    async fn promote_due(&self) -> Result<Vec<JobId>, CoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let mut promoted = Vec::new();
        for stored in inner.jobs.values_mut() {
            if stored.job.state == JobState::Delayed
                && stored.ready_at.map(|at| at <= now).unwrap_or(true)
            {
                stored.job.state = JobState::Waiting;
                stored.ready_at = None;
                promoted.push(stored.job.id.clone());
            }
        }
        Ok(promoted)
    }

    async fn reap_stalled(&self, older_than: Duration) -> Result<Vec<JobId>, CoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        let mut reaped = Vec::new();
        for stored in inner.jobs.values_mut() {
            let stalled = stored.job.state == JobState::Active
                && stored
                    .claimed_at
                    .map(|at| now.duration_since(at) > older_than)
                    .unwrap_or(false);
            if stalled {
                stored.job.state = JobState::Waiting;
                stored.claimed_at = None;
                reaped.push(stored.job.id.clone());
            }
        }
        Ok(reaped)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobInstance>, CoreError> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(id).map(|s| s.job.clone()))
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool, CoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.jobs.remove(id).is_some())
    }

    async fn retry_job(&self, id: &JobId) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::JobNotFound(id.to_string()))?;

        if stored.job.state != JobState::Failed {
            return Err(CoreError::InvalidTransition {
                job_id: id.to_string(),
                reason: format!("can only retry failed jobs, not {}", stored.job.state),
            });
        }
        stored.job.state = JobState::Waiting;
        stored.job.attempt = 0;
        stored.job.finished_at = None;
        stored.job.error = None;
        Ok(())
    }

    async fn jobs_in_state(
        &self,
        queue: &QueueName,
        state: Option<JobState>,
    ) -> Result<Vec<JobInstance>, CoreError> {
        let inner = self.inner.read().await;

        let mut matching: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.queue == *queue && state.map(|wanted| s.job.state == wanted).unwrap_or(true)
            })
            .collect();
        matching.sort_by_key(|s| s.seq);

        Ok(matching.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, CoreError> {
        let inner = self.inner.read().await;

        let mut counts = QueueCounts::default();
        for stored in inner.jobs.values().filter(|s| s.job.queue == *queue) {
            match stored.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::WaitingChildren => counts.waiting_children += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn queues(&self) -> Result<Vec<QueueName>, CoreError> {
        let inner = self.inner.read().await;

        let mut queues: Vec<QueueName> = Vec::new();
        for stored in inner.jobs.values() {
            if !queues.contains(&stored.job.queue) {
                queues.push(stored.job.queue.clone());
            }
        }
        Ok(queues)
    }

    async fn children_of(&self, parent: &JobId) -> Result<Vec<JobInstance>, CoreError> {
        let inner = self.inner.read().await;

        let mut children: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|s| s.job.parent_id.as_ref() == Some(parent))
            .collect();
        children.sort_by_key(|s| s.seq);

        Ok(children.into_iter().map(|s| s.job.clone()).collect())
    }
}
