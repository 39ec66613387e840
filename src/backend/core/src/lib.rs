#![allow(clippy::result_large_err)]
//! # Iteration Core
//!
//! Resumable, interruptible iteration over large data sets inside background jobs.
//!
//! ## Architecture
//!
//! - **Cursor**: durable, serialisable resume positions (scalars, tuples, nested slots)
//! - **Enumerator**: resumable sources over arrays, keyset-paginated tables, CSV files and
//!   nested compositions of those
//! - **Throttle**: conditions checked between steps that force a checkpoint with a backoff
//! - **Jobs**: the interruptible execution loop, the job queue seam and the worker with its
//!   retry path
//! - **Telemetry**: structured logging setup and metric names
//!
//! A job processes one item per step. Between steps the runner checks its throttle
//! conditions (runtime limit, shutdown, user conditions); when one fires the job's state is
//! appended to its arguments and the continuation is re-enqueued, resuming after the last
//! processed item.

pub mod config;
pub mod cursor;
pub mod enumerator;
pub mod error;
pub mod jobs;
pub mod telemetry;
pub mod throttle;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, IterationError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::IterationConfig;
    pub use crate::cursor::{Cursor, CursorValue};
    pub use crate::enumerator::tabular::{
        InMemoryTable, PgExecutor, Predicate, QueryExecutor, Relation, SortDirection, TableRow,
    };
    pub use crate::enumerator::{
        BoxEnumerator, CsvSource, Enumerator, EnumeratorBuilder, LevelBuilder, TabularOptions,
    };
    pub use crate::error::{ErrorCode, ErrorContext, IterationError, Result};
    pub use crate::jobs::{
        ExecutionState, HookResult, IterationContext, IterationJob, IterationRunner,
        IterationStep, IterationWorker, JobError, JobId, JobPayload, JobQueue, QueuedJob,
        RetryPolicy, RunOutcome, RunState, StepOutcome, StepResult,
    };
    pub use crate::throttle::{
        Backoff, InterruptionAdapter, ThrottleCondition, ThrottleRegistry,
    };
}
