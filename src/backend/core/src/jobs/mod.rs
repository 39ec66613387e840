//! Iteration jobs and the machinery that runs them.
//!
//! This module provides:
//!
//! - **Job Definitions**: the [`IterationJob`] trait, step outcomes and lifecycle hooks
//! - **Execution State**: progress carried in the job's own payload between invocations
//! - **Runner**: the interruptible execution loop, one invocation at a time
//! - **Queue**: delayed delivery of continuations and retries, with a dead letter queue
//! - **Worker**: dispatch by job name, retries with backoff and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  dequeue  ┌───────────┐  perform  ┌─────────────────┐  next  ┌────────────┐
//! │ JobQueue  │──────────▶│  Worker   │──────────▶│ IterationRunner │───────▶│ Enumerator │
//! │ (delayed) │◀──────────│ (retries) │◀──────────│ (throttles)     │◀───────│ (cursor)   │
//! └───────────┘ reenqueue └───────────┘ RunOutcome└─────────────────┘  item  └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use iteration_core::jobs::{IterationJob, IterationContext, StepOutcome, StepResult};
//!
//! struct Backfill { builder: EnumeratorBuilder, accounts: Arc<InMemoryTable> }
//!
//! #[async_trait]
//! impl IterationJob for Backfill {
//!     type Item = TableRow;
//!
//!     fn name(&self) -> &'static str { "backfill" }
//!
//!     async fn build_enumerator(&self, _ctx: &IterationContext<'_>, cursor: Option<Cursor>)
//!         -> Result<Option<BoxEnumerator<TableRow>>>
//!     {
//!         self.builder.records(self.accounts.relation(), TabularOptions::default(), cursor).map(Some)
//!     }
//!
//!     async fn each_iteration(&self, row: TableRow, _ctx: &IterationContext<'_>) -> StepResult {
//!         // Do work...
//!         Ok(StepOutcome::Continue)
//!     }
//! }
//!
//! let mut worker = IterationWorker::new(queue, config);
//! worker.register(backfill)?;
//! worker.enqueue("backfill", vec![]).await?;
//! let handle = Arc::new(worker).start();
//! ```

pub mod job;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod state;
pub mod worker;

pub use job::{
    HookResult, IterationContext, IterationJob, IterationStep, JobError, JobId, JobMetadata,
    JobPriority, JobStatus, StepOutcome, StepResult,
};
pub use queue::{
    DeadLetterQueue, InMemoryQueueBackend, JobQueue, QueueBackend, QueueConfig, QueueStats,
    QueuedJob, RedisQueueBackend,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runner::{IterationRunner, Reenqueue, RunOutcome, RunState, RETRY_AFTER_REASON};
pub use state::{ExecutionState, JobPayload, STATE_MARKER};
pub use worker::{IterationWorker, JobRegistry, PerformJob, WorkerConfig, WorkerHandle, WorkerStats};
