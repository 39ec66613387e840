//! Iteration job definitions.
//!
//! This module provides the abstractions user code implements:
//!
//! - **IterationJob**: builds an enumerator and processes one item per step
//! - **StepOutcome**: the control signal a step returns
//! - **IterationContext**: read-only view of the job passed to every callback
//! - **JobError**: failure raised by step logic or hooks
//! - **JobMetadata**: queue bookkeeping attached to every enqueued job

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::state::ExecutionState;
use crate::cursor::Cursor;
use crate::enumerator::BoxEnumerator;
use crate::error::{ErrorCode, IterationError, Result};
use crate::throttle::ThrottleRegistry;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier of an enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status & Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue-level status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Being executed by a worker
    Running,
    /// Checkpointed and waiting for its continuation
    Reenqueued,
    /// Failed and scheduled for a retry
    Failed,
    /// Finished iterating
    Completed,
    /// Failed after all retry attempts
    Dead,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Reenqueued => "reenqueued",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Priority level for jobs.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Processed when nothing else is due
    Low = 0,
    /// Default for most jobs
    #[default]
    Normal = 1,
    /// Processed before normal jobs
    High = 2,
    /// Processed first
    Critical = 3,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error raised by step logic or lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether a retry of the invocation may succeed
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<IterationError> for JobError {
    fn from(error: IterationError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Step Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// What the execution loop does after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The item was processed; advance the cursor and keep going.
    Continue,
    /// Stop iterating and finish the job, running `on_complete`.
    Complete,
    /// Stop iterating and finish the job without running `on_complete`.
    CompleteSkipHook,
    /// Stop and re-enqueue the job after the given delay, without advancing the cursor.
    RetryAfter(Duration),
}

/// Result of a step.
pub type StepResult = std::result::Result<StepOutcome, JobError>;

/// Result of a lifecycle hook.
pub type HookResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Iteration Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only view of the running job.
#[derive(Debug, Clone, Copy)]
pub struct IterationContext<'a> {
    pub job_id: JobId,
    pub job_name: &'a str,
    pub arguments: &'a [Value],
    pub state: &'a ExecutionState,
}

impl<'a> IterationContext<'a> {
    /// Deserialize the positional argument at `index`.
    pub fn argument<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.arguments.get(index).ok_or_else(|| {
            IterationError::new(
                ErrorCode::DeserializationError,
                format!("job {} has no argument at position {}", self.job_name, index),
            )
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.state.cursor()
    }
}

/// A pending step handed to [`IterationJob::around_iteration`].
pub struct IterationStep<'a> {
    step: BoxFuture<'a, StepResult>,
    invoked: &'a AtomicBool,
}

impl<'a> IterationStep<'a> {
    pub(crate) fn new(step: BoxFuture<'a, StepResult>, invoked: &'a AtomicBool) -> Self {
        Self { step, invoked }
    }

    /// Run the wrapped step.
    pub async fn run(self) -> StepResult {
        self.invoked.store(true, Ordering::SeqCst);
        self.step.await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Iteration Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A background job that iterates over an enumerator, one step per item.
///
/// Steps should finish quickly (well under 30 seconds): interruption is only observed
/// between steps. Steps must tolerate being re-run, since an item whose step succeeded may
/// be delivered again if the process dies before the cursor is persisted.
#[async_trait]
pub trait IterationJob: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Unique name of this job type, used to route queued jobs.
    fn name(&self) -> &'static str;

    /// Build the enumerator, resuming after `cursor`.
    ///
    /// Returning `None` finishes the job immediately.
    async fn build_enumerator(
        &self,
        ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<Self::Item>>>;

    /// Process one item.
    async fn each_iteration(&self, item: Self::Item, ctx: &IterationContext<'_>) -> StepResult;

    /// Wrap every step, e.g. to open a transaction. Must call [`IterationStep::run`].
    async fn around_iteration(&self, step: IterationStep<'_>, _ctx: &IterationContext<'_>) -> StepResult {
        step.run().await
    }

    /// Called before the first step of the job's very first invocation.
    async fn on_start(&self, _ctx: &IterationContext<'_>) -> HookResult {
        Ok(())
    }

    /// Called before the first step of every later invocation.
    async fn on_resume(&self, _ctx: &IterationContext<'_>) -> HookResult {
        Ok(())
    }

    /// Called whenever an invocation stops iterating without an error.
    async fn on_shutdown(&self, _ctx: &IterationContext<'_>) -> HookResult {
        Ok(())
    }

    /// Called once, when the job finishes iterating.
    async fn on_complete(&self, _ctx: &IterationContext<'_>) -> HookResult {
        Ok(())
    }

    /// Conditions checked after every step.
    fn throttle_conditions(&self) -> ThrottleRegistry {
        ThrottleRegistry::new()
    }

    /// Per-type runtime limit; may only lower the configured global limit.
    fn max_job_runtime(&self) -> Option<Duration> {
        None
    }

    /// Retry policy applied when a step fails. `None` uses the configured default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue bookkeeping for an enqueued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Unique job identifier, kept across continuations
    pub id: JobId,
    /// Job type name
    pub job_type: String,
    /// Current status
    pub status: JobStatus,
    /// Priority level
    pub priority: JobPriority,
    /// Failed attempts since the last successful checkpoint
    pub attempts: u32,
    /// When the job was first enqueued
    pub created_at: DateTime<Utc>,
    /// Last error message (if failed)
    pub last_error: Option<String>,
}

impl JobMetadata {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            priority: JobPriority::default(),
            attempts: 0,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    /// A checkpoint resets the failure count.
    pub fn mark_reenqueued(&mut self) {
        self.status = JobStatus::Reenqueued;
        self.attempts = 0;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
    }

    pub fn mark_dead(&mut self, error: &str) {
        self.status = JobStatus::Dead;
        self.last_error = Some(error.to_string());
    }
}
