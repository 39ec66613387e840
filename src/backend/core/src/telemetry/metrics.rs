//! Metric names and recording helpers for the iteration engine.
//!
//! The crate only records through the `metrics` facade; installing a recorder or exporter is
//! left to the hosting process.
//!
//! # Example
//!
//! ```rust,no_run
//! use iteration_core::telemetry::metrics::{describe_metrics, IterationMetrics};
//!
//! describe_metrics();
//! IterationMetrics::record_step("backfill_accounts");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Steps that returned successfully.
pub const STEPS_TOTAL: &str = "iteration_steps_total";

/// Invocations that checkpointed and re-enqueued, by reason.
pub const INTERRUPTIONS_TOTAL: &str = "iteration_interruptions_total";

/// Jobs that finished iterating.
pub const COMPLETIONS_TOTAL: &str = "iteration_completions_total";

/// Errors raised, by code and category.
pub const ERRORS_TOTAL: &str = "iteration_errors_total";

/// Wall time of single invocations.
pub const RUN_SECONDS: &str = "iteration_run_seconds";

/// Failed invocations scheduled for a retry.
pub const RETRIES_TOTAL: &str = "iteration_retries_total";

/// Jobs moved to the dead letter queue.
pub const DEAD_LETTERS_TOTAL: &str = "iteration_dead_letters_total";

/// Invocations currently running on a worker.
pub const ACTIVE_JOBS: &str = "iteration_active_jobs";

/// Register descriptions for every metric the crate records.
///
/// Safe to call more than once.
pub fn describe_metrics() {
    describe_counter!(STEPS_TOTAL, "Total number of successful iteration steps");
    describe_counter!(
        INTERRUPTIONS_TOTAL,
        "Total number of checkpoints taken, by interruption reason"
    );
    describe_counter!(COMPLETIONS_TOTAL, "Total number of jobs that finished iterating");
    describe_counter!(ERRORS_TOTAL, "Total number of errors by code and category");
    describe_histogram!(
        RUN_SECONDS,
        metrics::Unit::Seconds,
        "Duration of single job invocations"
    );
    describe_counter!(RETRIES_TOTAL, "Total number of failed invocations scheduled for retry");
    describe_counter!(DEAD_LETTERS_TOTAL, "Total number of jobs moved to the dead letter queue");
    describe_gauge!(ACTIVE_JOBS, "Number of invocations currently running");
}

/// Recording helpers shared by the execution loop and the worker.
pub struct IterationMetrics;

impl IterationMetrics {
    pub fn record_step(job: &'static str) {
        counter!(STEPS_TOTAL, "job" => job).increment(1);
    }

    pub fn record_interruption(job: &'static str, reason: &str) {
        counter!(INTERRUPTIONS_TOTAL, "job" => job, "reason" => reason.to_string()).increment(1);
    }

    pub fn record_completion(job: &'static str) {
        counter!(COMPLETIONS_TOTAL, "job" => job).increment(1);
    }

    pub fn record_run(job: &'static str, elapsed: Duration) {
        histogram!(RUN_SECONDS, "job" => job).record(elapsed.as_secs_f64());
    }

    pub fn record_retry(job: &str, attempt: u32) {
        counter!(RETRIES_TOTAL, "job" => job.to_string()).increment(1);
        tracing::debug!(job = %job, attempt, "Retry metrics recorded");
    }

    pub fn record_dead_letter(job: &str) {
        counter!(DEAD_LETTERS_TOTAL, "job" => job.to_string()).increment(1);
    }

    pub fn job_started() {
        gauge!(ACTIVE_JOBS).increment(1.0);
    }

    pub fn job_finished() {
        gauge!(ACTIVE_JOBS).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_a_no_op() {
        describe_metrics();
        describe_metrics();
        IterationMetrics::record_step("demo");
        IterationMetrics::record_interruption("demo", "shutdown");
        IterationMetrics::record_run("demo", Duration::from_millis(5));
        IterationMetrics::job_started();
        IterationMetrics::job_finished();
    }

    #[test]
    fn test_metric_names_share_a_prefix() {
        for name in [
            STEPS_TOTAL,
            INTERRUPTIONS_TOTAL,
            COMPLETIONS_TOTAL,
            ERRORS_TOTAL,
            RUN_SECONDS,
            RETRIES_TOTAL,
            DEAD_LETTERS_TOTAL,
            ACTIVE_JOBS,
        ] {
            assert!(name.starts_with("iteration_"));
        }
    }
}
