//! Integration tests for the interruptible execution loop.
//!
//! Tests cover:
//! - Uninterrupted and forced-interruption runs over a paginated table
//! - Lifecycle hook dispatch across invocations
//! - Step control signals (complete, abort, retry after)
//! - Re-delivery after a failing step
//! - Throttle precedence and backoff resolution
//! - Informational logs for empty sources

use async_trait::async_trait;
use iteration_core::config::IterationConfig;
use iteration_core::cursor::Cursor;
use iteration_core::enumerator::tabular::{InMemoryTable, TableRow};
use iteration_core::enumerator::{BoxEnumerator, EnumeratorBuilder, TabularOptions};
use iteration_core::error::{ErrorCode, Result};
use iteration_core::jobs::{
    ExecutionState, HookResult, IterationContext, IterationJob, IterationRunner, JobError, JobId,
    JobPayload, RunState, StepOutcome, StepResult, STATE_MARKER,
};
use iteration_core::throttle::{ThrottleRegistry, MAX_RUNTIME_REASON, SHUTDOWN_REASON};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Log Capture
// ============================================================================

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

/// Route this thread's events into a buffer; tokio tests run on a current-thread runtime.
fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

// ============================================================================
// Batch Job over a Table
// ============================================================================

fn numbered_table(rows: i64) -> Arc<InMemoryTable> {
    let table = Arc::new(InMemoryTable::new("accounts"));
    for id in 1..=rows {
        table.insert_json(json!({"id": id, "plan": "free"})).unwrap();
    }
    table
}

struct BatchJob {
    builder: EnumeratorBuilder,
    table: Arc<InMemoryTable>,
    interrupt_after_each_batch: bool,
    hooks: Mutex<Vec<&'static str>>,
    batches: Mutex<Vec<Vec<i64>>>,
    cursors_seen: Mutex<Vec<Option<Cursor>>>,
    resumed_with: Mutex<Vec<(u32, u32)>>,
}

impl BatchJob {
    fn new(table: Arc<InMemoryTable>, interrupt_after_each_batch: bool) -> Self {
        Self {
            builder: EnumeratorBuilder::with_executor(table.clone()),
            table,
            interrupt_after_each_batch,
            hooks: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            cursors_seen: Mutex::new(Vec::new()),
            resumed_with: Mutex::new(Vec::new()),
        }
    }

    fn hook_count(&self, hook: &str) -> usize {
        self.hooks.lock().iter().filter(|h| **h == hook).count()
    }

    fn record_entry(&self, hook: &'static str, ctx: &IterationContext<'_>) {
        self.hooks.lock().push(hook);
        self.resumed_with
            .lock()
            .push((ctx.state.executions, ctx.state.times_interrupted));
    }
}

#[async_trait]
impl IterationJob for BatchJob {
    type Item = Vec<TableRow>;

    fn name(&self) -> &'static str {
        "upgrade_plans"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<Vec<TableRow>>>> {
        self.builder
            .batches(self.table.relation(), TabularOptions::new().batch_size(3), cursor)
            .map(Some)
    }

    async fn each_iteration(&self, batch: Vec<TableRow>, ctx: &IterationContext<'_>) -> StepResult {
        assert_eq!(ctx.arguments, &[json!("pro"), json!({"dry_run": false})]);
        self.cursors_seen.lock().push(ctx.cursor().cloned());
        self.batches.lock().push(
            batch
                .iter()
                .map(|row| row.get("id").and_then(Value::as_i64).unwrap_or_default())
                .collect(),
        );
        Ok(StepOutcome::Continue)
    }

    async fn on_start(&self, ctx: &IterationContext<'_>) -> HookResult {
        self.record_entry("start", ctx);
        Ok(())
    }

    async fn on_resume(&self, ctx: &IterationContext<'_>) -> HookResult {
        self.record_entry("resume", ctx);
        Ok(())
    }

    async fn on_shutdown(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("shutdown");
        Ok(())
    }

    async fn on_complete(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("complete");
        Ok(())
    }

    fn throttle_conditions(&self) -> ThrottleRegistry {
        let interrupt = self.interrupt_after_each_batch;
        ThrottleRegistry::new().throttle_on("after_each_batch", Duration::ZERO, move |_| interrupt)
    }
}

fn arguments() -> Vec<Value> {
    vec![json!("pro"), json!({"dry_run": false})]
}

fn config() -> Arc<IterationConfig> {
    Arc::new(IterationConfig::default())
}

#[tokio::test]
async fn test_uninterrupted_batches() {
    let runner = IterationRunner::new(BatchJob::new(numbered_table(10), false), config()).unwrap();
    let outcome = runner
        .perform(JobId::new(), JobPayload::new(arguments()))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert!(outcome.reenqueue.is_none());

    let job = runner.job();
    let sizes: Vec<usize> = job.batches.lock().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(
        *job.cursors_seen.lock(),
        vec![
            None,
            Some(Cursor::from(3i64)),
            Some(Cursor::from(6i64)),
            Some(Cursor::from(9i64))
        ]
    );

    assert_eq!(job.hook_count("start"), 1);
    assert_eq!(job.hook_count("resume"), 0);
    assert_eq!(job.hook_count("complete"), 1);
    // on_shutdown marks every exit from Running, the completing one included.
    assert_eq!(job.hook_count("shutdown"), 1);
    assert_eq!(*job.hooks.lock(), vec!["start", "shutdown", "complete"]);
}

#[tokio::test]
async fn test_interruption_after_every_batch() {
    let runner = IterationRunner::new(BatchJob::new(numbered_table(10), true), config()).unwrap();
    let id = JobId::new();

    let mut payload = JobPayload::new(arguments());
    let mut outcomes = Vec::new();
    loop {
        let outcome = runner.perform(id, payload.clone()).await.unwrap();
        let continuation = outcome.reenqueue.clone();
        outcomes.push(outcome);
        match continuation {
            Some(continuation) => {
                assert_eq!(continuation.reason, "after_each_batch");
                assert_eq!(continuation.delay, Duration::ZERO);
                payload = continuation.payload;
            }
            None => break,
        }
    }

    // The throttle also fires after the final batch, so the fifth invocation
    // finds the source exhausted and completes without a step.
    assert_eq!(outcomes.len(), 5);
    let states: Vec<RunState> = outcomes.iter().map(|o| o.state).collect();
    assert_eq!(
        states,
        vec![
            RunState::Reenqueued,
            RunState::Reenqueued,
            RunState::Reenqueued,
            RunState::Reenqueued,
            RunState::Completed
        ]
    );
    assert_eq!(
        outcomes[0].execution.cursor_position,
        Some(Cursor::from(3i64))
    );
    assert_eq!(
        outcomes[3].execution.cursor_position,
        Some(Cursor::from(10i64))
    );
    assert_eq!(outcomes[4].execution.iterations_this_run, 0);

    let job = runner.job();
    let sizes: Vec<usize> = job.batches.lock().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);
    let ids: Vec<i64> = job.batches.lock().iter().flatten().copied().collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    // (executions, times_interrupted) as each invocation saw it
    assert_eq!(
        *job.resumed_with.lock(),
        vec![(1, 0), (2, 1), (3, 2), (4, 3), (5, 4)]
    );
    assert_eq!(job.hook_count("start"), 1);
    assert_eq!(job.hook_count("resume"), 4);
    assert_eq!(job.hook_count("complete"), 1);
    assert_eq!(job.hook_count("shutdown"), 5);

    let last = &outcomes[4].execution;
    assert_eq!(last.executions, 5);
    assert_eq!(last.times_interrupted, 4);
    assert!(last.total_time >= 0.0);
}

#[tokio::test]
async fn test_checkpoint_payload_shape() {
    let runner = IterationRunner::new(BatchJob::new(numbered_table(4), true), config()).unwrap();
    let outcome = runner
        .perform(JobId::new(), JobPayload::new(arguments()))
        .await
        .unwrap();

    let payload = outcome.reenqueue.unwrap().payload;
    let values = payload.values();
    assert_eq!(values.len(), 3);
    assert_eq!(&values[..2], &arguments()[..]);

    let state = &values[2][STATE_MARKER];
    assert_eq!(state["executions"], json!(1));
    assert_eq!(state["cursorPosition"], json!(3));
    assert_eq!(state["timesInterrupted"], json!(1));
    assert!(state["totalTime"].as_f64().unwrap() >= 0.0);
}

// ============================================================================
// Empty Sources
// ============================================================================

#[tokio::test]
async fn test_empty_source_completes_immediately() {
    let (logs, _guard) = capture_logs();
    let runner = IterationRunner::new(BatchJob::new(numbered_table(0), true), config()).unwrap();
    let outcome = runner
        .perform(JobId::new(), JobPayload::new(arguments()))
        .await
        .unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert!(outcome.reenqueue.is_none());
    assert_eq!(runner.job().hook_count("complete"), 1);

    let logs = logs.contents();
    assert!(logs.contains("Enumerator found nothing to iterate"), "{}", logs);
    assert!(logs.contains("Completed iterating"), "{}", logs);
}

struct NothingToDo {
    hooks: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl IterationJob for NothingToDo {
    type Item = u64;

    fn name(&self) -> &'static str {
        "nothing_to_do"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        _cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<u64>>> {
        Ok(None)
    }

    async fn each_iteration(&self, _item: u64, _ctx: &IterationContext<'_>) -> StepResult {
        self.hooks.lock().push("step");
        Ok(StepOutcome::Continue)
    }

    async fn on_start(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("start");
        Ok(())
    }

    async fn on_complete(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("complete");
        Ok(())
    }
}

#[tokio::test]
async fn test_builder_returning_nothing_skips_the_job() {
    let (logs, _guard) = capture_logs();
    let runner = IterationRunner::new(
        NothingToDo {
            hooks: Mutex::new(Vec::new()),
        },
        config(),
    )
    .unwrap();

    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(
        outcome.transitions,
        vec![RunState::NotStarted, RunState::Completed]
    );
    assert!(runner.job().hooks.lock().is_empty());
    assert!(logs
        .contents()
        .contains("build_enumerator returned nothing, skipping the job"));
}

// ============================================================================
// Control Signals, Failures and Throttles
// ============================================================================

/// Iterates `0..count`, reacting to per-item instructions.
#[derive(Default)]
struct Scripted {
    count: u64,
    signals: HashMap<u64, StepOutcome>,
    fail_once_at: Option<u64>,
    attempts: Mutex<HashMap<u64, u32>>,
    processed: Mutex<Vec<u64>>,
    hooks: Mutex<Vec<&'static str>>,
    registry: ThrottleRegistry,
    step_delay: Option<Duration>,
    runtime_limit: Option<Duration>,
}

#[async_trait]
impl IterationJob for Scripted {
    type Item = u64;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn build_enumerator(
        &self,
        _ctx: &IterationContext<'_>,
        cursor: Option<Cursor>,
    ) -> Result<Option<BoxEnumerator<u64>>> {
        EnumeratorBuilder::new().times(self.count, cursor).map(Some)
    }

    async fn each_iteration(&self, item: u64, _ctx: &IterationContext<'_>) -> StepResult {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(item).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if let Some(delay) = self.step_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_once_at == Some(item) && attempt == 1 {
            return Err(JobError::retryable(format!("item {} failed", item)));
        }
        self.processed.lock().push(item);
        Ok(self.signals.get(&item).copied().unwrap_or(StepOutcome::Continue))
    }

    async fn on_shutdown(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("shutdown");
        Ok(())
    }

    async fn on_complete(&self, _ctx: &IterationContext<'_>) -> HookResult {
        self.hooks.lock().push("complete");
        Ok(())
    }

    fn throttle_conditions(&self) -> ThrottleRegistry {
        self.registry.inherit()
    }

    fn max_job_runtime(&self) -> Option<Duration> {
        self.runtime_limit
    }
}

#[tokio::test]
async fn test_failed_step_is_redelivered_from_last_cursor() {
    let job = Scripted {
        count: 8,
        fail_once_at: Some(4),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();
    let id = JobId::new();

    let error = runner
        .perform(id, JobPayload::new(vec![json!("batch-7")]))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::StepFailed);
    assert!(error.is_retryable());
    assert_eq!(error.job_error().unwrap().message, "item 4 failed");

    let retry = error.retry_payload().unwrap();
    let (arguments, state) = retry.clone().split().unwrap();
    assert_eq!(arguments, vec![json!("batch-7")]);
    assert_eq!(state.cursor_position, Some(Cursor::index(3)));
    assert_eq!(state.executions, 1);
    assert_eq!(state.times_interrupted, 0);

    let outcome = runner.perform(id, retry).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.execution.executions, 2);

    let job = runner.job();
    assert_eq!(*job.processed.lock(), (0..8).collect::<Vec<_>>());
    assert_eq!(job.attempts.lock()[&4], 2);
    assert_eq!(job.attempts.lock()[&5], 1);
    // The failing invocation left Running through an error, so only the retry fired hooks.
    assert_eq!(*job.hooks.lock(), vec!["shutdown", "complete"]);
}

#[tokio::test]
async fn test_complete_signal_runs_on_complete() {
    let job = Scripted {
        count: 10,
        signals: HashMap::from([(2, StepOutcome::Complete)]),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();
    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(*runner.job().processed.lock(), vec![0, 1, 2]);
    assert_eq!(*runner.job().hooks.lock(), vec!["shutdown", "complete"]);
}

#[tokio::test]
async fn test_skip_hook_signal_aborts_without_on_complete() {
    let job = Scripted {
        count: 10,
        signals: HashMap::from([(1, StepOutcome::CompleteSkipHook)]),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();
    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();

    assert_eq!(outcome.state, RunState::Aborted);
    assert!(outcome.reenqueue.is_none());
    assert_eq!(*runner.job().hooks.lock(), vec!["shutdown"]);
}

#[tokio::test]
async fn test_retry_after_signal_reenqueues_without_advancing() {
    let job = Scripted {
        count: 5,
        signals: HashMap::from([(2, StepOutcome::RetryAfter(Duration::from_secs(90)))]),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();
    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();

    assert_eq!(outcome.state, RunState::Reenqueued);
    let continuation = outcome.reenqueue.unwrap();
    assert_eq!(continuation.delay, Duration::from_secs(90));
    assert_eq!(continuation.reason, "retry_after");

    let (_, state) = continuation.payload.split().unwrap();
    assert_eq!(state.cursor_position, Some(Cursor::index(1)));
    assert_eq!(state.times_interrupted, 1);
}

#[tokio::test]
async fn test_first_matching_throttle_sets_backoff() {
    let registry = ThrottleRegistry::new()
        .throttle_on("never", Duration::from_secs(1), |_| false)
        .throttle_on("replica_lag", Duration::from_secs(30), |state: &ExecutionState| {
            state.iterations_this_run >= 2
        })
        .throttle_on("queue_depth", Duration::from_secs(5), |state: &ExecutionState| {
            state.iterations_this_run >= 2
        });

    let job = Scripted {
        count: 10,
        registry,
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();

    let first = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();
    let continuation = first.reenqueue.unwrap();
    assert_eq!(continuation.reason, "replica_lag");
    assert_eq!(continuation.delay, Duration::from_secs(30));
    assert_eq!(*runner.job().processed.lock(), vec![0, 1]);

    let second = runner.perform(JobId::new(), continuation.payload).await.unwrap();
    assert_eq!(second.reenqueue.unwrap().reason, "replica_lag");
    assert_eq!(*runner.job().processed.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn test_builtin_conditions_precede_job_conditions() {
    let config = Arc::new(IterationConfig::default().with_max_job_runtime(Duration::from_secs(60)));
    let job = Scripted {
        registry: ThrottleRegistry::new().throttle_on("own", Duration::ZERO, |_| false),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config).unwrap();
    let names: Vec<&str> = runner.throttles().conditions().iter().map(|c| c.name()).collect();
    assert_eq!(names, vec![MAX_RUNTIME_REASON, SHUTDOWN_REASON, "own"]);
}

#[tokio::test]
async fn test_parent_condition_precedes_child_condition() {
    let parent = ThrottleRegistry::new().throttle_on("parent", Duration::from_secs(30), |_| true);
    let child = parent
        .inherit()
        .throttle_on("child", Duration::from_secs(5), |_| true);

    let job = Scripted {
        count: 3,
        registry: child,
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config()).unwrap();
    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();

    let continuation = outcome.reenqueue.unwrap();
    assert_eq!(continuation.reason, "parent");
    assert_eq!(continuation.delay, Duration::from_secs(30));
}

#[tokio::test]
async fn test_max_runtime_uses_default_backoff() {
    let config = Arc::new(
        IterationConfig::default()
            .with_max_job_runtime(Duration::from_secs(60))
            .with_default_retry_backoff(Duration::from_secs(2)),
    );
    let job = Scripted {
        count: 10,
        step_delay: Some(Duration::from_millis(20)),
        runtime_limit: Some(Duration::from_millis(1)),
        ..Default::default()
    };
    let runner = IterationRunner::new(job, config).unwrap();
    let outcome = runner.perform(JobId::new(), JobPayload::default()).await.unwrap();

    let continuation = outcome.reenqueue.unwrap();
    assert_eq!(continuation.reason, MAX_RUNTIME_REASON);
    assert_eq!(continuation.delay, Duration::from_secs(2));
    assert_eq!(*runner.job().processed.lock(), vec![0]);
    assert!(outcome.execution.total_time >= 0.02);
}

#[test]
fn test_runtime_override_above_global_is_rejected() {
    let config = Arc::new(IterationConfig::default().with_max_job_runtime(Duration::from_secs(10)));
    let job = Scripted {
        runtime_limit: Some(Duration::from_secs(11)),
        ..Default::default()
    };
    let error = IterationRunner::new(job, config).err().unwrap();
    assert_eq!(error.code(), ErrorCode::InvalidConfiguration);
}

#[tokio::test]
async fn test_invalid_state_marker_is_rejected() {
    let runner = IterationRunner::new(Scripted::default(), config()).unwrap();
    let payload = JobPayload::new(vec![json!({STATE_MARKER: {"cursorPosition": {"bad": 1}}})]);
    let error = runner.perform(JobId::new(), payload).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::DeserializationError);
}
