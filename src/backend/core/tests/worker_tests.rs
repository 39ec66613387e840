//! Integration tests for the worker: continuation re-enqueueing, the retry path,
//! dead-lettering and graceful shutdown.

use async_trait::async_trait;
use iteration_core::config::IterationConfig;
use iteration_core::cursor::Cursor;
use iteration_core::enumerator::{BoxEnumerator, EnumeratorBuilder};
use iteration_core::error::{ErrorCode, Result};
use iteration_core::jobs::{
    BackoffStrategy, IterationContext, IterationJob, IterationWorker, JobError,
    JobQueue, JobStatus, RetryPolicy, StepOutcome, StepResult,
};
use iteration_core::throttle::ThrottleRegistry;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Jobs
// ============================================================================

/// Walks `0..count`, checkpointing every `chunk` steps.
struct Chunked {
    count: u64,
    chunk: u64,
    processed: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl IterationJob for Chunked {
    type Item = u64;

    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<u64>>> {
        EnumeratorBuilder::new().times(self.count, cursor).map(Some)
    }

    async fn each_iteration(&self, item: u64, _ctx: &IterationContext<'_>) -> StepResult {
        self.processed.lock().push(item);
        Ok(StepOutcome::Continue)
    }

    fn throttle_conditions(&self) -> ThrottleRegistry {
        let chunk = self.chunk;
        ThrottleRegistry::new().throttle_on("chunk", Duration::ZERO, move |state| {
            state.iterations_this_run >= chunk
        })
    }
}

/// Fails on item 2 for its first `failures` attempts.
struct Flaky {
    failures: u32,
    fatal: bool,
    seen_failures: AtomicU32,
    processed: Arc<Mutex<Vec<u64>>>,
}

impl Flaky {
    fn new(failures: u32, processed: Arc<Mutex<Vec<u64>>>) -> Self {
        Self {
            failures,
            fatal: false,
            seen_failures: AtomicU32::new(0),
            processed,
        }
    }
}

#[async_trait]
impl IterationJob for Flaky {
    type Item = u64;

    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<u64>>> {
        EnumeratorBuilder::new().times(4, cursor).map(Some)
    }

    async fn each_iteration(&self, item: u64, _ctx: &IterationContext<'_>) -> StepResult {
        if item == 2 && self.seen_failures.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(if self.fatal {
                JobError::fatal("ledger rejected the entry")
            } else {
                JobError::retryable("ledger unavailable")
            });
        }
        self.processed.lock().push(item);
        Ok(StepOutcome::Continue)
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::with_retries(2).with_backoff(BackoffStrategy::fixed(0)))
    }
}

/// Sleeps on every step so a shutdown lands mid-run.
struct Slow {
    processed: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl IterationJob for Slow {
    type Item = u64;

    fn name(&self) -> &'static str {
        "slow"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<u64>>> {
        EnumeratorBuilder::new().times(1_000, cursor).map(Some)
    }

    async fn each_iteration(&self, item: u64, _ctx: &IterationContext<'_>) -> StepResult {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.processed.lock().push(item);
        Ok(StepOutcome::Continue)
    }
}

fn worker() -> IterationWorker {
    let mut config = IterationConfig::default();
    config.worker.poll_interval_ms = 10;
    config.worker.shutdown_timeout_secs = 5;
    IterationWorker::new(Arc::new(JobQueue::in_memory()), Arc::new(config))
}

async fn drain(worker: &IterationWorker) -> Vec<JobStatus> {
    let mut statuses = Vec::new();
    while let Some(status) = worker.run_once().await.unwrap() {
        statuses.push(status);
    }
    statuses
}

// ============================================================================
// Continuations
// ============================================================================

#[tokio::test]
async fn test_continuations_run_until_completion() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    worker
        .register(Chunked {
            count: 5,
            chunk: 2,
            processed: processed.clone(),
        })
        .unwrap();

    worker.enqueue("chunked", vec![json!("tenant-3")]).await.unwrap();
    let statuses = drain(&worker).await;

    assert_eq!(
        statuses,
        vec![JobStatus::Reenqueued, JobStatus::Reenqueued, JobStatus::Completed]
    );
    assert_eq!(*processed.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(worker.stats().reenqueued(), 2);
    assert_eq!(worker.stats().completed(), 1);
    assert!(worker.queue().is_empty().await.unwrap());
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    let chunked = |processed: &Arc<Mutex<Vec<u64>>>| Chunked {
        count: 1,
        chunk: 1,
        processed: processed.clone(),
    };

    assert_ok!(worker.register(chunked(&processed)));
    let error = assert_err!(worker.register(chunked(&processed)));
    assert_eq!(error.code(), ErrorCode::InvalidConfiguration);
    assert_eq!(worker.registry().names(), vec!["chunked"]);

    let id = assert_ok!(tokio_test::block_on(worker.enqueue("chunked", vec![])));
    let queued = tokio_test::block_on(worker.queue().dequeue()).unwrap().unwrap();
    assert_eq!(queued.metadata.id, id);
}

// ============================================================================
// Retry Path
// ============================================================================

#[tokio::test]
async fn test_retryable_failure_resumes_at_failed_item() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    worker.register(Flaky::new(1, processed.clone())).unwrap();

    worker.enqueue("flaky", vec![json!({"ledger": "eu"})]).await.unwrap();
    let statuses = drain(&worker).await;

    assert_eq!(statuses, vec![JobStatus::Failed, JobStatus::Completed]);
    assert_eq!(*processed.lock(), vec![0, 1, 2, 3]);
    assert_eq!(worker.stats().retried(), 1);
    assert_eq!(worker.stats().dead(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_are_dead_lettered() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    worker.register(Flaky::new(u32::MAX, processed.clone())).unwrap();

    worker.enqueue("flaky", vec![]).await.unwrap();
    let statuses = drain(&worker).await;

    assert_eq!(
        statuses,
        vec![JobStatus::Failed, JobStatus::Failed, JobStatus::Dead]
    );
    assert_eq!(*processed.lock(), vec![0, 1]);

    let dead = worker.queue().drain_dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].metadata.attempts, 2);
    assert_eq!(dead[0].metadata.last_error.as_deref(), Some("ledger unavailable"));

    // The dead job still carries the checkpoint from before the failing item.
    let (_, state) = dead[0].payload.clone().split().unwrap();
    assert_eq!(state.cursor_position, Some(Cursor::index(1)));
}

#[tokio::test]
async fn test_fatal_failure_is_dead_lettered_immediately() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    let mut job = Flaky::new(1, processed.clone());
    job.fatal = true;
    worker.register(job).unwrap();

    worker.enqueue("flaky", vec![]).await.unwrap();
    let statuses = drain(&worker).await;

    assert_eq!(statuses, vec![JobStatus::Dead]);
    assert_eq!(worker.stats().retried(), 0);
    assert_eq!(worker.queue().stats().await.unwrap().dead_letter, 1);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_checkpoints_running_job() {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let mut worker = worker();
    worker
        .register(Slow {
            processed: processed.clone(),
        })
        .unwrap();
    worker.enqueue("slow", vec![json!("backfill")]).await.unwrap();

    let worker = Arc::new(worker);
    let handle = worker.clone().start();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.stop().await;

    assert!(worker.is_shutting_down());
    assert!(worker.stats().reenqueued() >= 1);

    let seen = processed.lock().len() as u64;
    assert!(seen > 0 && seen < 1_000, "processed {} items", seen);

    let continuation = worker.queue().dequeue().await.unwrap().unwrap();
    let (arguments, state) = continuation.payload.split().unwrap();
    assert_eq!(arguments, vec![json!("backfill")]);
    assert!(state.times_interrupted >= 1);
    assert_eq!(state.cursor_position, Some(Cursor::index(seen - 1)));
}

#[tokio::test]
async fn test_idle_worker_stops_promptly() {
    let handle = Arc::new(worker()).start();
    tokio::time::timeout(Duration::from_secs(1), handle.stop())
        .await
        .expect("worker did not stop");
}
