//! Job queue with delayed delivery and dead letter handling.
//!
//! Continuations of interrupted jobs are enqueued with a delay (the throttle backoff); a
//! job only becomes visible to `dequeue` once its `run_at` time has passed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::job::{JobMetadata, JobPriority};
use super::state::JobPayload;
use crate::error::{ErrorCode, IterationError, Result};

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queue size (0 = unlimited)
    pub max_size: usize,
    /// Whether to keep jobs that exhausted their retries
    pub enable_dead_letter: bool,
    /// Maximum items in the dead letter queue
    pub dead_letter_max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10000,
            enable_dead_letter: true,
            dead_letter_max_size: 1000,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queued Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// Job metadata
    pub metadata: JobMetadata,
    /// Positional arguments, possibly carrying the execution state
    pub payload: JobPayload,
    /// When the job was enqueued
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
}

impl QueuedJob {
    /// A job due immediately.
    pub fn new(job_type: impl Into<String>, payload: JobPayload) -> Self {
        Self::with_metadata(JobMetadata::new(job_type), payload)
    }

    pub fn with_metadata(metadata: JobMetadata, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            metadata,
            payload,
            enqueued_at: now,
            run_at: now,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Delay delivery by `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.run_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs due now
    pub ready: usize,
    /// Jobs waiting for their `run_at` time
    pub delayed: usize,
    /// Jobs in the dead letter queue
    pub dead_letter: usize,
}

/// Jobs that exhausted their retries.
#[derive(Debug)]
pub struct DeadLetterQueue {
    jobs: VecDeque<QueuedJob>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, job: QueuedJob) {
        if self.max_size == 0 {
            return;
        }
        if self.jobs.len() >= self.max_size {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn drain(&mut self) -> Vec<QueuedJob> {
        self.jobs.drain(..).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage behind a [`JobQueue`].
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a job until it is due.
    async fn enqueue(&self, job: QueuedJob) -> Result<()>;

    /// Take the next due job, if any.
    async fn dequeue(&self) -> Result<Option<QueuedJob>>;

    /// Get queue statistics.
    async fn stats(&self) -> Result<QueueStats>;

    /// Number of stored jobs, due or not.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// In-memory queue backend for tests and single-process use.
///
/// Due jobs are taken highest priority first, then earliest `run_at`.
pub struct InMemoryQueueBackend {
    jobs: RwLock<Vec<QueuedJob>>,
    max_size: usize,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::with_max_size(0)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
            max_size,
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if self.max_size > 0 && jobs.len() >= self.max_size {
            return Err(IterationError::new(
                ErrorCode::QueueFull,
                format!("queue is full ({} jobs)", self.max_size),
            ));
        }
        jobs.push(job);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_due(now))
            .max_by(|(_, a), (_, b)| {
                a.metadata
                    .priority
                    .cmp(&b.metadata.priority)
                    .then_with(|| b.run_at.cmp(&a.run_at))
                    .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
            })
            .map(|(index, _)| index);
        Ok(next.map(|index| jobs.remove(index)))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        let ready = jobs.iter().filter(|job| job.is_due(now)).count();
        Ok(QueueStats {
            ready,
            delayed: jobs.len() - ready,
            dead_letter: 0,
        })
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.read().await.len())
    }
}

/// Redis-backed queue: a sorted set scored by `run_at` in milliseconds.
///
/// Priority is not honoured; due jobs are taken in `run_at` order.
pub struct RedisQueueBackend {
    client: redis::Client,
    queue_key: String,
}

impl RedisQueueBackend {
    /// Create a new Redis queue backend.
    ///
    /// # Arguments
    /// * `client` - A Redis client
    /// * `queue_key` - The sorted set key to use (e.g. `"iteration:jobs:default"`)
    pub fn new(client: redis::Client, queue_key: impl Into<String>) -> Self {
        Self {
            client,
            queue_key: queue_key.into(),
        }
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                IterationError::with_internal(
                    ErrorCode::QueueConnectionFailed,
                    "Failed to get Redis connection for job queue",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.get_conn().await?;
        redis::cmd("ZADD")
            .arg(&self.queue_key)
            .arg(job.run_at.timestamp_millis())
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await?;

        debug!(queue = %self.queue_key, job_id = %job.metadata.id, run_at = %job.run_at, "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedJob>> {
        let mut conn = self.get_conn().await?;
        let now = Utc::now().timestamp_millis();

        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.queue_key)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some(member) = candidates.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may have claimed it between the range and the removal.
        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.queue_key)
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Ok(None);
        }

        let job: QueuedJob = serde_json::from_str(&member)?;
        debug!(queue = %self.queue_key, job_id = %job.metadata.id, "Job dequeued");
        Ok(Some(job))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.get_conn().await?;
        let now = Utc::now().timestamp_millis();
        let ready: usize = redis::cmd("ZCOUNT")
            .arg(&self.queue_key)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;
        let total: usize = redis::cmd("ZCARD")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            ready,
            delayed: total.saturating_sub(ready),
            dead_letter: 0,
        })
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("ZCARD")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?;
        Ok(length)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// The job queue the execution loop re-enqueues continuations into.
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    dead_letter: RwLock<DeadLetterQueue>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let dlq = DeadLetterQueue::new(config.dead_letter_max_size);
        Self {
            backend,
            dead_letter: RwLock::new(dlq),
            config,
        }
    }

    /// Create a new in-memory job queue.
    pub fn in_memory() -> Self {
        let config = QueueConfig::default();
        Self::new(
            Arc::new(InMemoryQueueBackend::with_max_size(config.max_size)),
            config,
        )
    }

    pub async fn enqueue(&self, job: QueuedJob) -> Result<()> {
        self.backend.enqueue(job).await
    }

    pub async fn dequeue(&self) -> Result<Option<QueuedJob>> {
        self.backend.dequeue().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty().await
    }

    /// Move a job to the dead letter queue.
    pub async fn dead_letter(&self, job: QueuedJob) {
        if self.config.enable_dead_letter {
            self.dead_letter.write().await.push(job);
        }
    }

    /// Remove and return every dead-lettered job.
    pub async fn drain_dead_letters(&self) -> Vec<QueuedJob> {
        self.dead_letter.write().await.drain()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = self.backend.stats().await?;
        stats.dead_letter = self.dead_letter.read().await.len();
        Ok(stats)
    }
}
