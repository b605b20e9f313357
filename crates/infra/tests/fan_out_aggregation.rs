use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Barrier;

use scanflow_core::{PartitionId, ScanJobId, TargetId, TenantId, WorkStatus};
use scanflow_observability::LogConfig;
use scanflow_infra::config::{ExecutorConfig, PartitionConfig};
use scanflow_infra::jobs::{InMemoryJobStore, JobQueue, RetryPolicy, TaskExecutor};
use scanflow_infra::scan::{
    AggregationOutcome, CompletionHook, DetectionPipeline, FileDescriptor, FileFindings, HookError,
    InMemoryInventory, InMemoryScanStore, InventoryProvider, PartitionCoordinator,
    PartitionProgress, PartitionSpec, PartitionTaskHandler, PipelineError, ProviderError,
    RiskTier, SCAN_PARTITION_TASK, ScanJob, ScanOrchestrator, ScanService, ScanStore,
};

#[derive(Default)]
struct CountingHook {
    runs: AtomicUsize,
}

#[async_trait]
impl CompletionHook for CountingHook {
    fn name(&self) -> &str {
        "catalog-flush"
    }

    async fn run(&self, _job_id: ScanJobId, _tenant_id: TenantId) -> Result<(), HookError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One entity per `@` in the path.
struct AtCounter;

#[async_trait]
impl DetectionPipeline for AtCounter {
    async fn process(&self, file: &FileDescriptor) -> Result<FileFindings, PipelineError> {
        let n = file.path.matches('@').count() as u64;
        Ok(FileFindings {
            total_entities: n,
            risk_tier: Some(if n > 0 { RiskTier::Medium } else { RiskTier::Minimal }),
        })
    }
}

/// Inventory whose listing always fails under one prefix.
struct BrokenPrefix {
    inner: InMemoryInventory,
    broken: &'static str,
}

#[async_trait]
impl InventoryProvider for BrokenPrefix {
    async fn next_batch(
        &self,
        spec: &PartitionSpec,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FileDescriptor>, ProviderError> {
        if spec.prefix == self.broken {
            return Err(ProviderError::Unavailable(format!("{} is offline", spec.prefix)));
        }
        self.inner.next_batch(spec, after, limit).await
    }
}

async fn fanned_out(
    coordinator: &PartitionCoordinator<InMemoryScanStore>,
    n: u32,
) -> (TenantId, ScanJobId, Vec<PartitionId>) {
    let tenant = TenantId::new();
    let job_id = coordinator
        .store()
        .create_job(ScanJob::new(tenant, TargetId::new()))
        .await
        .unwrap();
    let ids = coordinator
        .fan_out(tenant, job_id, n, |i, _| {
            PartitionSpec::whole(format!("p{i}/")).to_value()
        })
        .await
        .unwrap();
    (tenant, job_id, ids)
}

async fn finish(store: &InMemoryScanStore, tenant: TenantId, id: PartitionId, status: WorkStatus) {
    let now = Utc::now();
    store.start_partition(tenant, id, now).await.unwrap();
    let progress = PartitionProgress {
        files_scanned: 5,
        files_with_pii: 2,
        total_entities: 7,
        ..PartitionProgress::default()
    };
    store
        .finish_partition(tenant, id, status, &progress, None, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn three_of_four_complete_then_one_fails() {
    let hook = Arc::new(CountingHook::default());
    let coordinator = PartitionCoordinator::new(InMemoryScanStore::new()).with_hook(hook.clone());
    let store = coordinator.store().clone();
    let (tenant, job_id, ids) = fanned_out(&coordinator, 4).await;

    for i in [0, 1, 3] {
        finish(&store, tenant, ids[i], WorkStatus::Completed).await;
    }
    store.start_partition(tenant, ids[2], Utc::now()).await.unwrap();

    assert_eq!(
        coordinator.check_and_aggregate(tenant, job_id).await.unwrap(),
        AggregationOutcome::Deferred { remaining: 1 }
    );
    let job = store.get_job(tenant, job_id).await.unwrap().unwrap();
    assert!(matches!(job.status, WorkStatus::Pending | WorkStatus::Running));

    store
        .finish_partition(
            tenant,
            ids[2],
            WorkStatus::Failed,
            &PartitionProgress::default(),
            Some("listing failed"),
            Utc::now(),
        )
        .await
        .unwrap();
    coordinator.check_and_aggregate(tenant, job_id).await.unwrap();

    let job = store.get_job(tenant, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Completed);
    assert_eq!(job.error.as_deref(), Some("1/4 partitions failed"));
    assert_eq!(job.partitions_completed, 3);
    assert_eq!(job.partitions_failed, 1);
    assert_eq!(job.files_scanned, 15);
    assert_eq!(hook.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_partition_failing_fails_the_scan() {
    let coordinator = PartitionCoordinator::new(InMemoryScanStore::new());
    let store = coordinator.store().clone();
    let (tenant, job_id, ids) = fanned_out(&coordinator, 4).await;

    for id in ids {
        finish(&store, tenant, id, WorkStatus::Failed).await;
    }
    coordinator.check_and_aggregate(tenant, job_id).await.unwrap();

    let job = store.get_job(tenant, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("All 4 partitions failed"));
    assert_eq!(job.files_scanned, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_aggregators_run_hooks_once() {
    const RACERS: usize = 8;

    let hook = Arc::new(CountingHook::default());
    let coordinator = Arc::new(
        PartitionCoordinator::new(InMemoryScanStore::new()).with_hook(hook.clone()),
    );
    let store = coordinator.store().clone();
    let (tenant, job_id, ids) = fanned_out(&coordinator, 4).await;
    for id in ids {
        finish(&store, tenant, id, WorkStatus::Completed).await;
    }

    let barrier = Arc::new(Barrier::new(RACERS));
    let racers: Vec<_> = (0..RACERS)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                coordinator.check_and_aggregate(tenant, job_id).await.unwrap()
            })
        })
        .collect();

    let mut aggregated = 0;
    for racer in racers {
        match racer.await.unwrap() {
            AggregationOutcome::Aggregated(_) => aggregated += 1,
            AggregationOutcome::LockBusy | AggregationOutcome::AlreadyAggregated => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(aggregated, 1);
    assert_eq!(hook.runs.load(Ordering::SeqCst), 1);

    let job = store.get_job(tenant, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, WorkStatus::Completed);
    assert_eq!(job.files_scanned, 20);
}

struct Harness {
    service: ScanService<InMemoryScanStore, Arc<InMemoryJobStore>>,
    executor: TaskExecutor<Arc<InMemoryJobStore>>,
    hook: Arc<CountingHook>,
}

fn harness(inventory: Arc<dyn InventoryProvider>, policy: RetryPolicy) -> Harness {
    scanflow_observability::init(&LogConfig {
        level: "scanflow_infra=warn".to_string(),
        json: false,
    });
    let tenant = TenantId::new();
    let hook = Arc::new(CountingHook::default());
    let coordinator = Arc::new(
        PartitionCoordinator::new(InMemoryScanStore::new()).with_hook(hook.clone()),
    );
    let queue = JobQueue::new(InMemoryJobStore::arc(), tenant, policy.clone());

    let config = PartitionConfig {
        checkpoint_every: 3,
        page_size: 4,
        ..PartitionConfig::default()
    };
    let orchestrator = Arc::new(ScanOrchestrator::new(
        coordinator.clone(),
        inventory,
        Arc::new(AtCounter),
        config,
    ));

    let mut executor = TaskExecutor::new(queue.clone());
    executor.register(
        SCAN_PARTITION_TASK,
        Arc::new(PartitionTaskHandler::new(orchestrator, policy)),
    );

    Harness {
        service: ScanService::new(coordinator, queue),
        executor,
        hook,
    }
}

fn inventory() -> InMemoryInventory {
    let mut files = Vec::new();
    for prefix in ["p0/", "p1/", "p2/", "p3/"] {
        for i in 0..10 {
            let at = if i % 2 == 0 { "@" } else { "" };
            files.push(FileDescriptor::new(format!("{prefix}{i:02}{at}"), 100));
        }
    }
    InMemoryInventory::with_files(files)
}

fn specs() -> Vec<serde_json::Value> {
    (0..4)
        .map(|i| PartitionSpec::whole(format!("p{i}/")).to_value())
        .collect()
}

async fn wait_for_aggregation(
    service: &ScanService<InMemoryScanStore, Arc<InMemoryJobStore>>,
    job_id: ScanJobId,
) -> ScanJob {
    for _ in 0..500 {
        let view = service.scan_status(job_id).await.unwrap().unwrap();
        if view.job.is_aggregated() {
            return view.job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scan {job_id} was never aggregated");
}

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        name: "test-worker".to_string(),
        concurrency: 4,
        poll_interval: Duration::from_millis(5),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_scan_and_aggregate_end_to_end() {
    let Harness {
        service,
        executor,
        hook,
    } = harness(Arc::new(inventory()), RetryPolicy::default());

    let job_id = service.start_scan(TargetId::new(), specs()).await.unwrap();
    let handle = executor.spawn(&executor_config());

    let job = wait_for_aggregation(&service, job_id).await;
    let stats = handle.shutdown().await;

    assert_eq!(job.status, WorkStatus::Completed);
    assert!(job.error.is_none());
    assert_eq!(job.files_scanned, 40);
    assert_eq!(job.files_with_pii, 20);
    assert_eq!(job.total_entities, 20);
    assert_eq!(job.partitions_completed, 4);
    assert_eq!(hook.runs.load(Ordering::SeqCst), 1);

    assert_eq!(stats.jobs_succeeded, 4);
    let queue_stats = service.queue().get_queue_stats().await.unwrap();
    assert_eq!(queue_stats.completed, 4);
    assert_eq!(queue_stats.pending + queue_stats.running, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broken_partition_exhausts_its_retries_and_scan_completes_partially() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        default_max_retries: 2,
        ..RetryPolicy::default()
    };
    let inventory = BrokenPrefix {
        inner: inventory(),
        broken: "p2/",
    };
    let Harness {
        service,
        executor,
        hook,
    } = harness(Arc::new(inventory), policy);

    let job_id = service.start_scan(TargetId::new(), specs()).await.unwrap();
    let handle = executor.spawn(&executor_config());

    let job = wait_for_aggregation(&service, job_id).await;
    handle.shutdown().await;

    assert_eq!(job.status, WorkStatus::Completed);
    assert_eq!(job.error.as_deref(), Some("1/4 partitions failed"));
    assert_eq!(job.partitions_completed, 3);
    assert_eq!(job.partitions_failed, 1);
    assert_eq!(job.files_scanned, 30);
    assert_eq!(hook.runs.load(Ordering::SeqCst), 1);

    let dead = service
        .queue()
        .get_failed_jobs(Some(SCAN_PARTITION_TASK), 10, 0)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 2);
    assert!(dead[0].error.as_deref().unwrap_or("").contains("p2/ is offline"));

    let view = service.scan_status(job_id).await.unwrap().unwrap();
    let broken = view
        .partitions
        .iter()
        .find(|p| p.partition_index == 2)
        .unwrap();
    assert_eq!(broken.status, WorkStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_scan_finishes_as_cancelled() {
    let Harness {
        service,
        executor,
        hook,
    } = harness(Arc::new(inventory()), RetryPolicy::default());

    let job_id = service.start_scan(TargetId::new(), specs()).await.unwrap();
    assert!(service.cancel_scan(job_id).await.unwrap());

    let handle = executor.spawn(&executor_config());
    let job = wait_for_aggregation(&service, job_id).await;
    handle.shutdown().await;

    assert_eq!(job.status, WorkStatus::Cancelled);
    assert_eq!(job.files_scanned, 0);
    assert_eq!(hook.runs.load(Ordering::SeqCst), 0);

    let view = service.scan_status(job_id).await.unwrap().unwrap();
    assert!(view.partitions.iter().all(|p| p.status == WorkStatus::Cancelled));
}
