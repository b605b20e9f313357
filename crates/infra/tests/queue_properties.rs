use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::json;
use tokio::sync::Barrier;

use scanflow_core::{TenantId, WorkStatus};
use scanflow_infra::jobs::{
    ClaimOrder, FailOutcome, InMemoryJobStore, JobQueue, JobStore, QueueError, RetryPolicy,
};

fn queue(tenant: TenantId) -> JobQueue<Arc<InMemoryJobStore>> {
    JobQueue::new(InMemoryJobStore::arc(), tenant, RetryPolicy::default())
}

fn close_to(actual: chrono::DateTime<Utc>, expected: chrono::DateTime<Utc>) -> bool {
    (actual - expected).abs() < TimeDelta::milliseconds(500)
}

#[tokio::test]
async fn highest_priority_is_claimed_first() {
    let q = queue(TenantId::new());
    q.enqueue("scan", json!({"n": 10}), 10, None).await.unwrap();
    let urgent = q.enqueue("scan", json!({"n": 90}), 90, None).await.unwrap();
    q.enqueue("scan", json!({"n": 50}), 50, None).await.unwrap();

    let job = q.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(job.id, urgent);
    assert_eq!(job.status, WorkStatus::Running);
    assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
    assert!(job.started_at.is_some());
}

#[tokio::test]
async fn future_jobs_wait_for_their_time() {
    let q = queue(TenantId::new());
    q.enqueue("scan", json!({}), 99, Some(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    let now_job = q.enqueue("scan", json!({}), 1, None).await.unwrap();

    assert_eq!(q.dequeue("w").await.unwrap().map(|j| j.id), Some(now_job));
    assert!(q.dequeue("w").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_pending_job_is_claimed_once() {
    const CALLERS: usize = 16;

    let q = queue(TenantId::new());
    let id = q.enqueue("scan", json!({}), 50, None).await.unwrap();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|i| {
            let q = q.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                q.dequeue(&format!("worker-{i}")).await.unwrap()
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap() {
            claimed.push(job);
        }
    }
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);
}

#[tokio::test]
async fn retries_back_off_then_dead_letter() {
    let tenant = TenantId::new();
    let q = queue(tenant);
    let id = q.enqueue("scan", json!({}), 50, None).await.unwrap();
    let later = || Utc::now() + TimeDelta::hours(2);

    q.dequeue("w").await.unwrap().unwrap();
    let before = Utc::now();
    let first = q.fail(id, "timeout", true).await.unwrap();
    let FailOutcome::Retrying { retry_count, scheduled_for } = first else {
        panic!("expected retry, got {first:?}");
    };
    assert_eq!(retry_count, 1);
    assert!(close_to(scheduled_for, before + TimeDelta::seconds(2)));
    let job = q.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Pending);
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());
    assert_eq!(job.error.as_deref(), Some("timeout"));

    q.store()
        .claim(tenant, "w", ClaimOrder::CreatedFirst, later())
        .await
        .unwrap()
        .unwrap();
    let before = Utc::now();
    let second = q.fail(id, "timeout", true).await.unwrap();
    let FailOutcome::Retrying { retry_count, scheduled_for: second_at } = second else {
        panic!("expected retry, got {second:?}");
    };
    assert_eq!(retry_count, 2);
    assert!(close_to(second_at, before + TimeDelta::seconds(4)));
    assert!(second_at > scheduled_for);

    q.store()
        .claim(tenant, "w", ClaimOrder::CreatedFirst, later())
        .await
        .unwrap()
        .unwrap();
    let third = q.fail(id, "timeout", true).await.unwrap();
    assert_eq!(third, FailOutcome::DeadLettered { retry_count: 3 });

    let job = q.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert!(job.completed_at.is_some());
    assert_eq!(q.get_failed_count(Some("scan")).await.unwrap(), 1);
}

#[tokio::test]
async fn failing_a_dead_letter_changes_nothing() {
    let q = queue(TenantId::new());
    let id = q.enqueue("scan", json!({}), 50, None).await.unwrap();
    q.dequeue("w").await.unwrap();
    q.fail(id, "bad input", false).await.unwrap();
    let dead = q.get(id).await.unwrap().unwrap();

    let again = q.fail(id, "bad input", false).await;
    assert!(matches!(again, Err(QueueError::InvalidTransition { .. })));
    assert_eq!(q.get(id).await.unwrap().unwrap(), dead);
}

#[tokio::test]
async fn cancelling_a_completed_job_is_refused() {
    let q = queue(TenantId::new());
    let id = q.enqueue("scan", json!({}), 50, None).await.unwrap();
    q.dequeue("w").await.unwrap();
    q.complete(id, Some(json!({"files": 3}))).await.unwrap();
    let done = q.get(id).await.unwrap().unwrap();

    assert!(!q.cancel(id).await.unwrap());
    assert_eq!(q.get(id).await.unwrap().unwrap(), done);
}

#[tokio::test]
async fn requeue_and_purge_dead_letters() {
    let q = queue(TenantId::new());
    let a = q.enqueue("scan", json!({}), 50, None).await.unwrap();
    let b = q.enqueue("export", json!({}), 50, None).await.unwrap();
    for _ in 0..2 {
        let job = q.dequeue("w").await.unwrap().unwrap();
        q.fail(job.id, "boom", false).await.unwrap();
    }

    let page = q.get_failed_jobs(None, 10, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.failed_by_type.get("scan"), Some(&1));

    assert!(q.requeue_failed(a, true).await.unwrap());
    assert!(!q.requeue_failed(a, true).await.unwrap());
    let job = q.get(a).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.error.is_none());

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(q.purge_failed(Some("export"), Duration::ZERO).await.unwrap(), 1);
    assert!(q.get(b).await.unwrap().is_none());
    assert_eq!(q.get_failed_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn other_tenants_jobs_look_missing() {
    let store = InMemoryJobStore::arc();
    let owner = JobQueue::new(store.clone(), TenantId::new(), RetryPolicy::default());
    let stranger = owner.for_tenant(TenantId::new());

    let id = owner.enqueue("scan", json!({}), 50, None).await.unwrap();
    assert!(stranger.get(id).await.unwrap().is_none());
    assert!(!stranger.cancel(id).await.unwrap());
    assert!(stranger.dequeue("w").await.unwrap().is_none());

    owner.dequeue("w").await.unwrap();
    owner.fail(id, "boom", false).await.unwrap();
    assert!(!stranger.requeue_failed(id, true).await.unwrap());
    assert_eq!(stranger.get_failed_count(None).await.unwrap(), 0);
    assert!(matches!(
        stranger.complete(id, None).await,
        Err(QueueError::NotFound(_))
    ));
    assert_eq!(owner.get(id).await.unwrap().unwrap().status, WorkStatus::Failed);
}
