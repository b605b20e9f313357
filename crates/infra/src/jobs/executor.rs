//! Worker pool that drains a [`JobQueue`] through registered task handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::store::{JobStore, QueueError};
use super::types::{FailOutcome, Job, JobId};
use crate::config::ExecutorConfig;

/// What a handler reports back for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Complete the job with an optional result blob.
    Success(Option<serde_json::Value>),
    /// Fail the job; the queue retries it while the budget lasts.
    Retry(String),
    /// Fail the job without retry (dead-letter).
    Fatal(String),
}

/// Executes jobs of one or more task types.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> TaskOutcome;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    async fn handle(&self, job: &Job) -> TaskOutcome {
        (self.0)(job.clone()).await
    }
}

/// How a claimed job left the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed(JobId),
    Retrying { job_id: JobId, retry_count: u32 },
    DeadLettered { job_id: JobId, retry_count: u32 },
    /// The job changed state under the handler (e.g. cancelled); its outcome was dropped.
    Discarded(JobId),
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
}

struct Inner<S> {
    queue: JobQueue<S>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    stats: Mutex<ExecutorStats>,
}

impl<S> Inner<S> {
    fn stats(&self) -> std::sync::MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exact match, then `prefix.*`, then `*`.
    fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(h) = self.handlers.get(task_type) {
            return Some(h.clone());
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                task_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone())
            .or_else(|| self.handlers.get("*").cloned())
    }
}

/// Polls a tenant's queue and runs claimed jobs through their handlers.
pub struct TaskExecutor<S> {
    inner: Arc<Inner<S>>,
}

impl<S> TaskExecutor<S>
where
    S: JobStore + 'static,
{
    pub fn new(queue: JobQueue<S>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                handlers: HashMap::new(),
                stats: Mutex::new(ExecutorStats::default()),
            }),
        }
    }

    fn inner_mut(&mut self) -> Option<&mut Inner<S>> {
        Arc::get_mut(&mut self.inner)
    }

    /// Register a handler for a task type pattern (`"scan_partition"`,
    /// `"export.*"` or `"*"`). Has no effect once the executor is spawned.
    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let pattern = pattern.into();
        match self.inner_mut() {
            Some(inner) => {
                inner.handlers.insert(pattern, handler);
            }
            None => warn!(pattern = %pattern, "handler registered after spawn was ignored"),
        }
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register(pattern, Arc::new(FnHandler(f)));
    }

    pub fn queue(&self) -> &JobQueue<S> {
        &self.inner.queue
    }

    pub fn stats(&self) -> ExecutorStats {
        self.inner.stats().clone()
    }

    /// Claim and execute at most one job.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobDisposition>, QueueError> {
        run_once(&self.inner, worker_id).await
    }

    /// Start `config.concurrency` polling workers on the current tokio runtime.
    pub fn spawn(self, config: &ExecutorConfig) -> ExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = config.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|i| {
                let inner = self.inner.clone();
                let worker_id = format!("{}-{}", config.name, i);
                let poll_interval = config.poll_interval;
                let shutdown = shutdown_rx.clone();
                tokio::spawn(worker_loop(inner, worker_id, poll_interval, shutdown))
            })
            .collect();

        info!(executor = %config.name, concurrency, "task executor started");

        let inner = self.inner;
        ExecutorHandle {
            name: config.name.clone(),
            shutdown: shutdown_tx,
            workers,
            stats: Box::new(move || inner.stats().clone()),
        }
    }
}

/// Handle to control a running executor.
pub struct ExecutorHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Box<dyn Fn() -> ExecutorStats + Send + Sync>,
}

impl ExecutorHandle {
    /// Signal every worker to stop, wait for in-flight jobs to finish and
    /// return the final statistics.
    pub async fn shutdown(self) -> ExecutorStats {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(executor = %self.name, error = %e, "worker task ended abnormally");
            }
        }
        info!(executor = %self.name, "task executor stopped");
        (self.stats)()
    }

    pub fn stats(&self) -> ExecutorStats {
        (self.stats)()
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

async fn worker_loop<S: JobStore + 'static>(
    inner: Arc<Inner<S>>,
    worker_id: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id = %worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_once(&inner, &worker_id).await {
            // Keep draining while work is available.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(worker_id = %worker_id, error = %e, "failed to poll job queue"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker_id = %worker_id, "worker stopped");
}

async fn run_once<S: JobStore + 'static>(
    inner: &Arc<Inner<S>>,
    worker_id: &str,
) -> Result<Option<JobDisposition>, QueueError> {
    let Some(job) = inner.queue.dequeue(worker_id).await? else {
        return Ok(None);
    };
    debug!(worker_id, job_id = %job.id, task_type = %job.task_type, "claimed job");

    inner.stats().current_running += 1;
    let outcome = execute(inner, &job).await;
    let disposition = settle(&inner.queue, &job, outcome).await;

    let mut stats = inner.stats();
    stats.current_running = stats.current_running.saturating_sub(1);
    stats.jobs_processed += 1;
    match disposition {
        Ok(JobDisposition::Completed(_)) => stats.jobs_succeeded += 1,
        Ok(JobDisposition::Retrying { .. }) => stats.jobs_retried += 1,
        Ok(JobDisposition::DeadLettered { .. }) => stats.jobs_dead_lettered += 1,
        Ok(JobDisposition::Discarded(_)) | Err(_) => {}
    }
    drop(stats);

    disposition.map(Some)
}

/// Run the handler on its own task so a panic fails the job instead of the worker.
async fn execute<S>(inner: &Inner<S>, job: &Job) -> TaskOutcome {
    let Some(handler) = inner.handler_for(&job.task_type) else {
        warn!(job_id = %job.id, task_type = %job.task_type, "no handler for task type");
        return TaskOutcome::Fatal(format!("no handler for task type: {}", job.task_type));
    };

    let owned = job.clone();
    match tokio::spawn(async move { handler.handle(&owned).await }).await {
        Ok(outcome) => outcome,
        Err(e) => TaskOutcome::Retry(format!("handler panicked: {e}")),
    }
}

async fn settle<S: JobStore>(
    queue: &JobQueue<S>,
    job: &Job,
    outcome: TaskOutcome,
) -> Result<JobDisposition, QueueError> {
    let result = match outcome {
        TaskOutcome::Success(result) => queue
            .complete(job.id, result)
            .await
            .map(|()| JobDisposition::Completed(job.id)),
        TaskOutcome::Retry(error) => queue.fail(job.id, &error, true).await.map(|o| disposition(job.id, o)),
        TaskOutcome::Fatal(error) => queue.fail(job.id, &error, false).await.map(|o| disposition(job.id, o)),
    };

    match result {
        Err(QueueError::InvalidTransition { from, .. }) => {
            debug!(job_id = %job.id, status = %from, "job changed state while running; outcome dropped");
            Ok(JobDisposition::Discarded(job.id))
        }
        other => other,
    }
}

fn disposition(job_id: JobId, outcome: FailOutcome) -> JobDisposition {
    match outcome {
        FailOutcome::Retrying { retry_count, .. } => JobDisposition::Retrying {
            job_id,
            retry_count,
        },
        FailOutcome::DeadLettered { retry_count } => JobDisposition::DeadLettered {
            job_id,
            retry_count,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::DEFAULT_PRIORITY;
    use scanflow_core::{TenantId, WorkStatus};
    use serde_json::json;

    fn executor() -> TaskExecutor<Arc<InMemoryJobStore>> {
        TaskExecutor::new(JobQueue::new(
            InMemoryJobStore::arc(),
            TenantId::new(),
            RetryPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn success_completes_job() {
        let mut executor = executor();
        executor.register_fn("export", |job: Job| async move {
            TaskOutcome::Success(Some(json!({ "echo": job.payload })))
        });
        let id = executor
            .queue()
            .enqueue("export", json!(7), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        let disposition = executor.run_once("w-0").await.unwrap();
        assert_eq!(disposition, Some(JobDisposition::Completed(id)));

        let job = executor.queue().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkStatus::Completed);
        assert_eq!(job.result, Some(json!({ "echo": 7 })));
        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let executor = executor();
        let id = executor
            .queue()
            .enqueue("unknown", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        let disposition = executor.run_once("w-0").await.unwrap();
        assert_eq!(
            disposition,
            Some(JobDisposition::DeadLettered {
                job_id: id,
                retry_count: 0
            })
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_retried() {
        struct Panics;

        #[async_trait]
        impl TaskHandler for Panics {
            async fn handle(&self, _job: &Job) -> TaskOutcome {
                panic!("handler bug")
            }
        }

        let mut executor = executor();
        executor.register("boom", Arc::new(Panics));
        let id = executor
            .queue()
            .enqueue("boom", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        let disposition = executor.run_once("w-0").await.unwrap();
        assert_eq!(
            disposition,
            Some(JobDisposition::Retrying {
                job_id: id,
                retry_count: 1
            })
        );
        let job = executor.queue().get(id).await.unwrap().unwrap();
        assert!(job.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn prefix_pattern_matches_dotted_types() {
        let mut executor = executor();
        executor.register_fn("export.*", |_job: Job| async move {
            TaskOutcome::Fatal("export disabled".into())
        });
        executor.register_fn("*", |_job: Job| async move { TaskOutcome::Success(None) });

        let csv = executor
            .queue()
            .enqueue("export.csv", json!({}), 90, None)
            .await
            .unwrap();
        let exporter = executor
            .queue()
            .enqueue("exporter", json!({}), 10, None)
            .await
            .unwrap();

        assert_eq!(
            executor.run_once("w-0").await.unwrap(),
            Some(JobDisposition::DeadLettered {
                job_id: csv,
                retry_count: 0
            })
        );
        assert_eq!(
            executor.run_once("w-0").await.unwrap(),
            Some(JobDisposition::Completed(exporter))
        );
    }

    #[tokio::test]
    async fn cancelled_while_running_is_discarded() {
        let mut executor = executor();
        let queue = executor.queue().clone();
        executor.register_fn("slow", move |job: Job| {
            let queue = queue.clone();
            async move {
                queue.cancel(job.id).await.unwrap();
                TaskOutcome::Success(None)
            }
        });
        let id = executor
            .queue()
            .enqueue("slow", json!({}), DEFAULT_PRIORITY, None)
            .await
            .unwrap();

        assert_eq!(
            executor.run_once("w-0").await.unwrap(),
            Some(JobDisposition::Discarded(id))
        );
        let job = executor.queue().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, WorkStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spawned_workers_drain_queue() {
        let mut executor = executor();
        executor.register_fn("noop", |_job: Job| async move { TaskOutcome::Success(None) });
        for _ in 0..20 {
            executor
                .queue()
                .enqueue("noop", json!({}), DEFAULT_PRIORITY, None)
                .await
                .unwrap();
        }
        let queue = executor.queue().clone();

        let config = ExecutorConfig {
            name: "test".into(),
            concurrency: 4,
            poll_interval: Duration::from_millis(5),
        };
        let handle = executor.spawn(&config);

        for _ in 0..200 {
            if queue.get_queue_stats().await.unwrap().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await;

        assert_eq!(queue.get_queue_stats().await.unwrap().completed, 20);
        assert_eq!(stats.jobs_succeeded, 20);
        assert_eq!(stats.current_running, 0);
    }
}
