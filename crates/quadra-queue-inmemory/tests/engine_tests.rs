//! Full-engine tests: registry, manager, workers, and flows running
//! against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use quadra_core::{
    Backoff, FlowSpec, JobContext, JobError, JobHandler, JobId, JobManager, JobName, JobOptions,
    JobState, JobRegistry, JobDefinition, ManagerSettings, QueueBackend, QueueName,
};
use quadra_queue_inmemory::InMemoryQueueBackend;

/// Handler that always succeeds and counts its executions.
#[derive(Debug, Default)]
struct CountingHandler {
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(&self, _ctx: JobContext) -> Result<Value, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true}))
    }
}

/// Handler that fails with retryable errors for the first
/// `failures` attempts, then succeeds.
#[derive(Debug)]
struct FlakyHandler {
    name: String,
    failures: u32,
    runs: AtomicUsize,
}

impl FlakyHandler {
    fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            failures,
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt <= self.failures {
            Err(JobError::retryable(format!(
                "transient failure on attempt {}",
                ctx.attempt
            )))
        } else {
            Ok(json!({"attempt": ctx.attempt}))
        }
    }
}

fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        workers_per_queue: 2,
        poll_interval: Duration::from_millis(10),
        housekeeping_interval: Duration::from_millis(20),
        ..ManagerSettings::default()
    }
}

fn fast_retry_options(max_attempts: u32) -> JobOptions {
    JobOptions {
        max_attempts,
        backoff: Backoff::Fixed(Duration::from_millis(10)),
        ..JobOptions::default()
    }
}

/// Poll until the job reaches `wanted` or the deadline passes.
async fn wait_for_state(
    backend: &Arc<InMemoryQueueBackend>,
    id: &JobId,
    wanted: JobState,
) -> quadra_core::JobInstance {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = backend.get_job(id).await.unwrap() {
            if job.state == wanted {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never reached {}",
            id,
            wanted
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_dispatched_job_runs_exactly_once() {
    let handler = Arc::new(CountingHandler::default());
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("counting", "work", handler.clone()))
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(
        registry,
        backend.clone(),
        ManagerSettings {
            workers_per_queue: 4,
            ..fast_settings()
        },
    );
    manager.start().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(
            manager
                .dispatch(&JobName::new("counting"), json!({"i": i}))
                .await
                .unwrap(),
        );
    }

    for id in &ids {
        wait_for_state(&backend, id, JobState::Completed).await;
    }
    manager.stop().await;

    assert_eq!(handler.runs.load(Ordering::SeqCst), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retryable_failure_retries_then_completes() {
    let handler = Arc::new(FlakyHandler::new("flaky", 2));
    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("flaky", "work", handler.clone())
                .with_options(fast_retry_options(5)),
        )
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    let mut events = manager.subscribe();
    manager.start().await.unwrap();

    let id = manager
        .dispatch(&JobName::new("flaky"), json!({}))
        .await
        .unwrap();

    let done = wait_for_state(&backend, &id, JobState::Completed).await;
    manager.stop().await;

    assert_eq!(done.attempt, 3);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 3);

    let mut retrying = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event.event_type() {
            "job.retrying" => retrying += 1,
            "job.completed" => completed += 1,
            _ => {}
        }
    }
    assert_eq!(retrying, 2);
    assert_eq!(completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_retries_fail_the_job() {
    let handler = Arc::new(FlakyHandler::new("doomed", u32::MAX));
    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("doomed", "work", handler.clone())
                .with_options(fast_retry_options(2)),
        )
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    manager.start().await.unwrap();

    let id = manager
        .dispatch(&JobName::new("doomed"), json!({}))
        .await
        .unwrap();

    let failed = wait_for_state(&backend, &id, JobState::Failed).await;
    manager.stop().await;

    assert_eq!(failed.attempt, 2);
    assert!(failed.error.is_some());
    assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_error_fails_without_retry() {
    #[derive(Debug)]
    struct FatalHandler;

    #[async_trait]
    impl JobHandler for FatalHandler {
        fn name(&self) -> &str {
            "fatal"
        }

        async fn execute(&self, _ctx: JobContext) -> Result<Value, JobError> {
            Err(JobError::fatal("unrecoverable".to_string()))
        }
    }

    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("fatal", "work", Arc::new(FatalHandler))
                .with_options(fast_retry_options(5)),
        )
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    manager.start().await.unwrap();

    let id = manager
        .dispatch(&JobName::new("fatal"), json!({}))
        .await
        .unwrap();

    let failed = wait_for_state(&backend, &id, JobState::Failed).await;
    manager.stop().await;

    assert_eq!(failed.attempt, 1, "fatal errors burn no further attempts");
}

/// A flow parent must run after all children reach a terminal state,
/// even when one child exhausts its retries and fails.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flow_completes_despite_failed_child() {
    let parent_handler = Arc::new(CountingHandler::default());
    let good_child = Arc::new(FlakyHandler::new("child-ok", 0));
    let bad_child = Arc::new(FlakyHandler::new("child-bad", u32::MAX));

    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("counting", "work", parent_handler.clone()))
        .unwrap();
    registry
        .register(JobDefinition::new("child-ok", "work", good_child))
        .unwrap();
    registry
        .register(
            JobDefinition::new("child-bad", "work", bad_child)
                .with_options(fast_retry_options(2)),
        )
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    manager.start().await.unwrap();

    let spec = FlowSpec::new(
        JobName::new("counting"),
        QueueName::new("work"),
        json!({"kind": "parent"}),
    )
    .with_child(JobName::new("child-ok"), json!({"n": 1}))
    .with_child(JobName::new("child-bad"), json!({"n": 2}))
    .with_child(JobName::new("child-ok"), json!({"n": 3}));
    let handle = manager.dispatch_flow(spec).await.unwrap();

    let parent = wait_for_state(&backend, &handle.parent_id, JobState::Completed).await;
    manager.stop().await;

    assert_eq!(parent.state, JobState::Completed);

    let children = backend.children_of(&handle.parent_id).await.unwrap();
    assert_eq!(children.len(), 3);
    let failed: Vec<_> = children
        .iter()
        .filter(|c| c.state == JobState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, JobName::new("child-bad"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flow_with_no_children_runs_immediately() {
    let handler = Arc::new(CountingHandler::default());
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("counting", "work", handler))
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    manager.start().await.unwrap();

    let spec = FlowSpec::new(JobName::new("counting"), QueueName::new("work"), json!({}));
    let handle = manager.dispatch_flow(spec).await.unwrap();

    wait_for_state(&backend, &handle.parent_id, JobState::Completed).await;
    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_leaves_pending_jobs_waiting() {
    let handler = Arc::new(CountingHandler::default());
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("counting", "work", handler))
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());

    // Never started: dispatch still works, nothing executes.
    let id = manager
        .dispatch(&JobName::new("counting"), json!({}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = backend.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
}

#[tokio::test]
async fn test_dispatch_unknown_job_is_rejected() {
    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(JobRegistry::new(), backend.clone(), fast_settings());

    let err = manager
        .dispatch(&JobName::new("nobody"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, quadra_core::CoreError::UnknownJob(_)));
    assert!(backend.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_board_reflects_terminal_states() {
    let handler = Arc::new(CountingHandler::default());
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("counting", "work", handler))
        .unwrap();

    let backend = Arc::new(InMemoryQueueBackend::new());
    let manager = JobManager::new(registry, backend.clone(), fast_settings());
    manager.start().await.unwrap();

    let id = manager
        .dispatch(&JobName::new("counting"), json!({}))
        .await
        .unwrap();
    wait_for_state(&backend, &id, JobState::Completed).await;
    manager.stop().await;

    let board = manager.board().await.unwrap();
    let work = board
        .queues
        .iter()
        .find(|q| q.queue == QueueName::new("work"))
        .expect("work queue on the board");
    assert_eq!(work.counts.completed, 1);
    assert_eq!(work.counts.waiting, 0);
}
