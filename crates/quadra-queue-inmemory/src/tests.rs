use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use quadra_core::{
    CoreError, JobName, JobOptions, JobState, NewJob, QueueBackend, QueueName, RetentionPolicy,
};

use super::InMemoryQueueBackend;

fn sync_queue() -> QueueName {
    QueueName::new("sync")
}

fn job(name: &str) -> NewJob {
    NewJob::new(JobName::new(name), sync_queue(), json!({"n": name}))
}

#[tokio::test]
async fn test_claim_is_fifo() {
    let backend = InMemoryQueueBackend::new();
    let first = backend.enqueue(job("a")).await.unwrap();
    let second = backend.enqueue(job("b")).await.unwrap();

    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.state, JobState::Active);
    assert_eq!(claimed.attempt, 1);

    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(claimed.id, second);

    assert!(backend.claim(&sync_queue()).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner_each() {
    let backend = Arc::new(InMemoryQueueBackend::new());
    for i in 0..10 {
        backend.enqueue(job(&format!("job-{}", i))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = backend.claim(&sync_queue()).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<_> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    let before = all.len();
    all.dedup();

    assert_eq!(before, 10, "every job claimed");
    assert_eq!(all.len(), 10, "no job claimed twice");
}

#[tokio::test]
async fn test_delayed_job_not_claimable_until_promoted() {
    let backend = InMemoryQueueBackend::new();
    let id = backend
        .enqueue(job("later").with_delay(Duration::from_millis(5)))
        .await
        .unwrap();

    assert!(backend.claim(&sync_queue()).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let promoted = backend.promote_due().await.unwrap();
    assert_eq!(promoted, vec![id.clone()]);

    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[tokio::test]
async fn test_retry_returns_job_through_delayed() {
    let backend = InMemoryQueueBackend::new();
    let id = backend.enqueue(job("flaky")).await.unwrap();

    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    backend
        .retry(&claimed.id, Duration::ZERO, "upstream timeout".to_string())
        .await
        .unwrap();

    let stored = backend.get_job(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.error.as_deref(), Some("upstream timeout"));

    backend.promote_due().await.unwrap();
    let reclaimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempt, 2);
}

#[tokio::test]
async fn test_complete_requires_active() {
    let backend = InMemoryQueueBackend::new();
    let id = backend.enqueue(job("a")).await.unwrap();

    let err = backend.complete(&id, json!({})).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_retention_remove_on_complete() {
    let backend = InMemoryQueueBackend::new();
    let options = JobOptions {
        remove_on_complete: RetentionPolicy::Remove,
        ..JobOptions::default()
    };
    let id = backend
        .enqueue(job("ephemeral").with_options(options))
        .await
        .unwrap();

    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    backend.complete(&claimed.id, json!("done")).await.unwrap();

    assert!(backend.get_job(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retention_keep_last_prunes_oldest() {
    let backend = InMemoryQueueBackend::new();
    let options = JobOptions {
        remove_on_complete: RetentionPolicy::KeepLast(2),
        ..JobOptions::default()
    };

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = backend
            .enqueue(job("recurring").with_options(options.clone()))
            .await
            .unwrap();
        let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
        backend.complete(&claimed.id, json!(null)).await.unwrap();
        ids.push(id);
    }

    assert!(backend.get_job(&ids[0]).await.unwrap().is_none());
    assert!(backend.get_job(&ids[1]).await.unwrap().is_some());
    assert!(backend.get_job(&ids[2]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_flow_parent_barred_until_promoted() {
    let backend = InMemoryQueueBackend::new();
    let handle = backend
        .enqueue_flow(job("parent"), vec![job("child-1"), job("child-2")])
        .await
        .unwrap();

    let parent = backend.get_job(&handle.parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state, JobState::WaitingChildren);

    // Children are claimable; the parent never is while barred.
    let mut claimed_names = Vec::new();
    while let Some(job) = backend.claim(&sync_queue()).await.unwrap() {
        assert_ne!(job.id, handle.parent_id);
        claimed_names.push(job.name.to_string());
    }
    assert_eq!(claimed_names.len(), 2);

    let children = backend.children_of(&handle.parent_id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|c| c.parent_id.as_ref() == Some(&handle.parent_id)));

    backend.promote_parent(&handle.parent_id).await.unwrap();
    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(claimed.id, handle.parent_id);
}

#[tokio::test]
async fn test_promote_parent_is_idempotent() {
    let backend = InMemoryQueueBackend::new();
    let handle = backend.enqueue_flow(job("parent"), vec![]).await.unwrap();

    backend.promote_parent(&handle.parent_id).await.unwrap();
    backend.promote_parent(&handle.parent_id).await.unwrap();

    let parent = backend.get_job(&handle.parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state, JobState::Waiting);
}

#[tokio::test]
async fn test_reap_stalled_requeues_old_active_jobs() {
    let backend = InMemoryQueueBackend::new();
    let id = backend.enqueue(job("stuck")).await.unwrap();
    backend.claim(&sync_queue()).await.unwrap().unwrap();

    // Not stalled yet under a generous threshold.
    assert!(backend
        .reap_stalled(Duration::from_secs(60))
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let reaped = backend.reap_stalled(Duration::ZERO).await.unwrap();
    assert_eq!(reaped, vec![id.clone()]);

    // Requeued as a fresh attempt.
    let reclaimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.attempt, 2);
}

#[tokio::test]
async fn test_counts_by_state() {
    let backend = InMemoryQueueBackend::new();
    backend.enqueue(job("w1")).await.unwrap();
    backend.enqueue(job("w2")).await.unwrap();
    backend
        .enqueue(job("d1").with_delay(Duration::from_secs(60)))
        .await
        .unwrap();
    let claimed_id = {
        backend.enqueue(job("a1")).await.unwrap();
        // First claim takes w1 (FIFO); claim until a1 is active.
        let mut last = None;
        for _ in 0..3 {
            last = backend.claim(&sync_queue()).await.unwrap();
        }
        last.unwrap().id
    };
    backend.fail(&claimed_id, "broken".to_string()).await.unwrap();

    let counts = backend.counts(&sync_queue()).await.unwrap();
    assert_eq!(counts.active, 2);
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn test_board_retry_resets_failed_job() {
    let backend = InMemoryQueueBackend::new();
    let id = backend.enqueue(job("failed")).await.unwrap();
    let claimed = backend.claim(&sync_queue()).await.unwrap().unwrap();
    backend.fail(&claimed.id, "fatal".to_string()).await.unwrap();

    // Only failed jobs can be retried from the board.
    let err = backend.retry_job(&id).await.err();
    assert!(err.is_none());

    let stored = backend.get_job(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.attempt, 0);
    assert!(stored.error.is_none());

    let err = backend.retry_job(&id).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_jobs_in_state_filters_and_orders() {
    let backend = InMemoryQueueBackend::new();
    backend.enqueue(job("one")).await.unwrap();
    backend.enqueue(job("two")).await.unwrap();
    backend
        .enqueue(job("later").with_delay(Duration::from_secs(60)))
        .await
        .unwrap();

    let waiting = backend
        .jobs_in_state(&sync_queue(), Some(JobState::Waiting))
        .await
        .unwrap();
    assert_eq!(waiting.len(), 2);
    assert_eq!(waiting[0].name, JobName::new("one"));
    assert_eq!(waiting[1].name, JobName::new("two"));

    let all = backend.jobs_in_state(&sync_queue(), None).await.unwrap();
    assert_eq!(all.len(), 3);
}
