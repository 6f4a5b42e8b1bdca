use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::domain::events::JobEvent;
use crate::domain::job::JobInstance;
use crate::error::{CoreError, JobError};
use crate::runtime::dispatcher::Dispatcher;
use crate::types::QueueName;
use crate::JobContext;

/// Per-queue execution loop.
///
/// Claims ready jobs from the backend, runs the registered handler
/// under the attempt timeout, classifies the outcome, and reports the
/// transition back to the backend before emitting a lifecycle event.
/// Several workers may poll the same queue; the backend's atomic claim
/// keeps each attempt with exactly one of them.
pub(crate) struct Worker {
    queue: QueueName,
    dispatcher: Dispatcher,
    events: broadcast::Sender<JobEvent>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(crate) fn new(
        queue: QueueName,
        dispatcher: Dispatcher,
        events: broadcast::Sender<JobEvent>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            events,
            poll_interval,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(queue = %self.queue, "Worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.dispatcher.backend().claim(&self.queue).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.execute(job).await {
                        error!(queue = %self.queue, error = %e, "Job execution bookkeeping failed");
                    }
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Claim failed, backing off");
                    self.idle().await;
                }
            }
        }
        info!(queue = %self.queue, "Worker stopped");
    }

    /// Sleep one poll interval, or wake early on shutdown
    async fn idle(&mut self) {
        tokio::select! {
            _ = time::sleep(self.poll_interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn execute(&self, job: JobInstance) -> Result<(), CoreError> {
        let Some(definition) = self.dispatcher.registry().get(&job.name) else {
            // A claimed job with no definition can only come from a
            // backend shared with a differently-configured process.
            warn!(job = %job.name, job_id = %job.id, "Claimed job has no registered handler");
            return self
                .settle_failure(
                    &job,
                    &JobError::fatal(format!("No handler registered for {}", job.name)),
                )
                .await;
        };

        debug!(job = %job.name, job_id = %job.id, attempt = job.attempt, "Executing job");
        let ctx = JobContext::new(&job, self.dispatcher.clone());

        let outcome = time::timeout(
            definition.options.attempt_timeout,
            definition.handler.execute(ctx),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => self.settle_success(&job, result).await,
            Ok(Err(job_error)) => self.settle_failure(&job, &job_error).await,
            Err(_) => {
                let timeout_error = JobError::retryable(format!(
                    "Attempt timed out after {:?}",
                    definition.options.attempt_timeout
                ));
                self.settle_failure(&job, &timeout_error).await
            }
        }
    }

    async fn settle_success(
        &self,
        job: &JobInstance,
        result: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.dispatcher.backend().complete(&job.id, result).await?;
        debug!(job = %job.name, job_id = %job.id, "Job completed");

        if let Some(parent_id) = &job.parent_id {
            self.dispatcher.tracker().child_terminal(parent_id).await?;
        }
        self.emit(JobEvent::Completed {
            job_id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            parent_id: job.parent_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn settle_failure(&self, job: &JobInstance, error: &JobError) -> Result<(), CoreError> {
        let retryable = !error.is_fatal() && job.attempt < job.max_attempts;

        if retryable {
            let delay = self.retry_delay(job);
            self.dispatcher
                .backend()
                .retry(&job.id, delay, error.to_string())
                .await?;
            warn!(
                job = %job.name,
                job_id = %job.id,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                ?delay,
                error = %error,
                "Job attempt failed, retrying"
            );
            self.emit(JobEvent::Retrying {
                job_id: job.id.clone(),
                name: job.name.clone(),
                queue: job.queue.clone(),
                attempt: job.attempt,
                delay,
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        } else {
            self.dispatcher
                .backend()
                .fail(&job.id, error.to_string())
                .await?;
            error!(
                job = %job.name,
                job_id = %job.id,
                attempt = job.attempt,
                error = %error,
                "Job failed"
            );

            if let Some(parent_id) = &job.parent_id {
                self.dispatcher.tracker().child_terminal(parent_id).await?;
            }
            self.emit(JobEvent::Failed {
                job_id: job.id.clone(),
                name: job.name.clone(),
                queue: job.queue.clone(),
                parent_id: job.parent_id.clone(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    fn retry_delay(&self, job: &JobInstance) -> Duration {
        self.dispatcher
            .registry()
            .get(&job.name)
            .map(|d| d.options.backoff.delay_for(job.attempt))
            .unwrap_or(Duration::from_secs(1))
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine; the board polls the backend directly.
        let _ = self.events.send(event);
    }
}
