//! Job worker: dequeues iteration jobs, runs one invocation each and schedules what follows.
//!
//! After an invocation the worker either
//! - re-enqueues the continuation of a checkpointed job after its backoff,
//! - retries a failed invocation from its last checkpoint, per the job's [`RetryPolicy`], or
//! - moves a job whose retries are exhausted to the dead letter queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::job::{IterationJob, JobError, JobId, JobPriority, JobStatus};
use super::queue::{JobQueue, QueuedJob};
use super::retry::RetryPolicy;
use super::runner::{IterationRunner, RunOutcome};
use super::state::JobPayload;
use crate::config::IterationConfig;
use crate::error::{ErrorCode, IterationError, Result};
use crate::telemetry::metrics::IterationMetrics;
use crate::throttle::InterruptionAdapter;

/// Configuration for the job worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrent invocations
    pub concurrency: usize,
    /// Poll interval for checking the queue (milliseconds)
    pub poll_interval_ms: u64,
    /// How long shutdown waits for running invocations to checkpoint (seconds)
    pub shutdown_timeout_secs: u64,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
            name: "iteration-worker".to_string(),
        }
    }
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Invocations run
    pub processed: Arc<AtomicU64>,
    /// Jobs that finished iterating
    pub completed: Arc<AtomicU64>,
    /// Continuations re-enqueued after a checkpoint
    pub reenqueued: Arc<AtomicU64>,
    /// Failed invocations scheduled for retry
    pub retried: Arc<AtomicU64>,
    /// Jobs moved to the dead letter queue
    pub dead: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn reenqueued(&self) -> u64 {
        self.reenqueued.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead(&self) -> u64 {
        self.dead.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A runner with its job type erased, so runners of different jobs share a registry.
#[async_trait]
pub trait PerformJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> JobPriority;

    fn retry_policy(&self) -> Option<RetryPolicy>;

    async fn perform(&self, job_id: JobId, payload: JobPayload) -> Result<RunOutcome>;
}

#[async_trait]
impl<J: IterationJob> PerformJob for IterationRunner<J> {
    fn name(&self) -> &'static str {
        self.job().name()
    }

    fn priority(&self) -> JobPriority {
        self.job().priority()
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.job().retry_policy()
    }

    async fn perform(&self, job_id: JobId, payload: JobPayload) -> Result<RunOutcome> {
        IterationRunner::perform(self, job_id, payload).await
    }
}

/// Runners keyed by job name.
#[derive(Default, Clone)]
pub struct JobRegistry {
    runners: HashMap<&'static str, Arc<dyn PerformJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner; a second runner under the same name is rejected.
    pub fn register(&mut self, runner: Arc<dyn PerformJob>) -> Result<()> {
        let name = runner.name();
        if self.runners.contains_key(name) {
            return Err(IterationError::configuration(
                ErrorCode::InvalidConfiguration,
                format!("a job named {} is already registered", name),
            ));
        }
        self.runners.insert(name, runner);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PerformJob>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runners.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    stats: WorkerStats,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// Running jobs observe the signal between steps and checkpoint.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for the worker loop to stop.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Worker that runs iteration jobs from a queue.
pub struct IterationWorker {
    config: WorkerConfig,
    iteration: Arc<IterationConfig>,
    queue: Arc<JobQueue>,
    registry: JobRegistry,
    stats: WorkerStats,
    shutdown: Arc<watch::Sender<bool>>,
}

impl IterationWorker {
    pub fn new(queue: Arc<JobQueue>, iteration: Arc<IterationConfig>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: iteration.worker.clone(),
            iteration,
            queue,
            registry: JobRegistry::new(),
            stats: WorkerStats::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Register a job type. Its runner observes this worker's shutdown signal.
    pub fn register<J: IterationJob>(&mut self, job: J) -> Result<()> {
        let interruption: Arc<dyn InterruptionAdapter> = Arc::new(self.shutdown.subscribe());
        let runner = IterationRunner::new(job, self.iteration.clone())?.with_interruption(interruption);
        self.registry.register(Arc::new(runner))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Enqueue a fresh job of a registered type.
    pub async fn enqueue(&self, job_type: &str, arguments: Vec<Value>) -> Result<JobId> {
        let runner = self.registry.get(job_type).ok_or_else(|| unknown_job(job_type))?;
        let job = QueuedJob::new(runner.name(), JobPayload::new(arguments)).with_priority(runner.priority());
        let id = job.metadata.id;
        self.queue.enqueue(job).await?;
        debug!(job = runner.name(), job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Signal running and future invocations to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Take one due job from the queue and run a single invocation of it.
    pub async fn run_once(&self) -> Result<Option<JobStatus>> {
        match self.queue.dequeue().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one invocation of `job` and hand the result back to the queue.
    pub async fn process(&self, mut job: QueuedJob) -> Result<JobStatus> {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let Some(runner) = self.registry.get(&job.metadata.job_type) else {
            let error = unknown_job(&job.metadata.job_type);
            error.log();
            return Ok(self.dead_letter(job, &error.to_string()).await);
        };

        job.metadata.mark_running();
        IterationMetrics::job_started();
        let result = runner.perform(job.metadata.id, job.payload.clone()).await;
        IterationMetrics::job_finished();

        match result {
            Ok(outcome) => match outcome.reenqueue {
                Some(continuation) => {
                    job.metadata.mark_reenqueued();
                    let next = QueuedJob::with_metadata(job.metadata, continuation.payload)
                        .delayed(continuation.delay);
                    self.queue.enqueue(next).await?;
                    self.stats.reenqueued.fetch_add(1, Ordering::Relaxed);
                    Ok(JobStatus::Reenqueued)
                }
                None => {
                    job.metadata.mark_completed();
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(JobStatus::Completed)
                }
            },
            Err(error) => self.handle_failure(job, runner.as_ref(), error).await,
        }
    }

    async fn handle_failure(
        &self,
        mut job: QueuedJob,
        runner: &dyn PerformJob,
        error: IterationError,
    ) -> Result<JobStatus> {
        error.log();

        let job_error = match error.job_error() {
            Some(job_error) => job_error.clone(),
            None if error.is_retryable() => JobError::retryable(error.to_string()),
            None => JobError::fatal(error.to_string()),
        };
        let policy = runner
            .retry_policy()
            .unwrap_or_else(|| self.iteration.retry.clone());

        let attempt = job.metadata.attempts;
        if !policy.should_retry(attempt, &job_error) {
            return Ok(self.dead_letter(job, &job_error.message).await);
        }

        let delay = policy.next_retry_delay(attempt);
        job.metadata.mark_failed(&job_error.message);
        // Without a retry payload the last checkpoint is the payload the job arrived with.
        let payload = error.retry_payload().unwrap_or(job.payload);
        let retry = QueuedJob::with_metadata(job.metadata, payload).delayed(delay);

        info!(
            job = %retry.metadata.job_type,
            job_id = %retry.metadata.id,
            attempt = retry.metadata.attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying failed invocation"
        );
        IterationMetrics::record_retry(&retry.metadata.job_type, retry.metadata.attempts);
        self.queue.enqueue(retry).await?;
        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        Ok(JobStatus::Failed)
    }

    async fn dead_letter(&self, mut job: QueuedJob, reason: &str) -> JobStatus {
        warn!(
            job = %job.metadata.job_type,
            job_id = %job.metadata.id,
            attempts = job.metadata.attempts,
            reason = %reason,
            "Moving job to the dead letter queue"
        );
        job.metadata.mark_dead(reason);
        IterationMetrics::record_dead_letter(&job.metadata.job_type);
        self.queue.dead_letter(job).await;
        self.stats.dead.fetch_add(1, Ordering::Relaxed);
        JobStatus::Dead
    }

    /// Start polling the queue, returning a handle for control.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run_loop());

        WorkerHandle {
            shutdown,
            stats,
            task,
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let config = self.config.clone();
        let concurrency = config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let mut shutdown_rx = self.shutdown.subscribe();

        info!(
            worker = %config.name,
            concurrency,
            jobs = ?self.registry.names(),
            "Job worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!(worker = %config.name, "Worker shutting down");
                break;
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                continue;
            };

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = worker.process(job).await {
                            e.log();
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    e.log();
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }

        // Running invocations see the shutdown flag at their next step and checkpoint.
        let drain = semaphore.acquire_many(concurrency as u32);
        let timeout = Duration::from_secs(config.shutdown_timeout_secs);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(worker = %config.name, "Shutdown timed out with invocations still running");
        }

        info!(worker = %config.name, "Worker stopped");
    }
}

fn unknown_job(job_type: &str) -> IterationError {
    IterationError::configuration(
        ErrorCode::InvalidConfiguration,
        format!("no job registered under the name {}", job_type),
    )
}
