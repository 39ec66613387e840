//! The interruptible execution loop.
//!
//! One call to [`IterationRunner::perform`] is one invocation of an iteration job:
//!
//! ```text
//! NotStarted ──▶ Running ──┬──▶ Checkpointing ──▶ Reenqueued
//!                          ├──▶ Completed
//!                          └──▶ Aborted
//! ```
//!
//! The cursor only moves after a step succeeds, so a failed step is re-run by the retry of
//! the invocation and never skipped. Throttles are checked between steps; a step in progress
//! is never cancelled.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

use super::job::{IterationContext, IterationJob, IterationStep, JobError, JobId, StepOutcome, StepResult};
use super::state::{ExecutionState, JobPayload};
use crate::config::IterationConfig;
use crate::cursor::Cursor;
use crate::error::{ErrorCode, IterationError, Result};
use crate::telemetry::metrics::IterationMetrics;
use crate::throttle::{InterruptionAdapter, NeverInterrupt, Throttle, ThrottleCondition, ThrottleRegistry};

/// Reason recorded when a step asks to be retried later.
pub const RETRY_AFTER_REASON: &str = "retry_after";

// ═══════════════════════════════════════════════════════════════════════════════
// Run State & Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Checkpointing,
    Reenqueued,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reenqueued | Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Checkpointing => "checkpointing",
            Self::Reenqueued => "reenqueued",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A continuation the queue must schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Reenqueue {
    /// Original arguments followed by the checkpointed state
    pub payload: JobPayload,
    /// Delay before the continuation may run
    pub delay: Duration,
    /// Name of the throttle condition or signal that interrupted the run
    pub reason: String,
}

/// Result of one invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal state of the invocation
    pub state: RunState,
    /// Every state the invocation passed through, in order
    pub transitions: Vec<RunState>,
    /// Execution state as of the end of the invocation
    pub execution: ExecutionState,
    /// Set when the state is [`RunState::Reenqueued`]
    pub reenqueue: Option<Reenqueue>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn is_reenqueued(&self) -> bool {
        self.state == RunState::Reenqueued
    }
}

/// Why the step loop stopped.
enum Stop {
    Exhausted,
    Complete,
    CompleteSkipHook,
    RetryAfter(Duration),
    Throttled(Throttle),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives an [`IterationJob`] through one invocation at a time.
pub struct IterationRunner<J: IterationJob> {
    job: Arc<J>,
    config: Arc<IterationConfig>,
    interruption: Arc<dyn InterruptionAdapter>,
    throttles: ThrottleRegistry,
}

impl<J: IterationJob> IterationRunner<J> {
    /// Create a runner, validating the job's runtime override against the global limit.
    pub fn new(job: J, config: Arc<IterationConfig>) -> Result<Self> {
        let job = Arc::new(job);
        let max_runtime = effective_max_runtime(job.as_ref(), &config)?;
        let interruption: Arc<dyn InterruptionAdapter> = Arc::new(NeverInterrupt);
        let throttles = build_registry(job.as_ref(), max_runtime, interruption.clone());

        Ok(Self {
            job,
            config,
            interruption,
            throttles,
        })
    }

    /// Observe `adapter` for the "process is stopping" signal.
    pub fn with_interruption(mut self, adapter: Arc<dyn InterruptionAdapter>) -> Self {
        let max_runtime = self
            .job
            .max_job_runtime()
            .or(self.config.max_job_runtime);
        self.throttles = build_registry(self.job.as_ref(), max_runtime, adapter.clone());
        self.interruption = adapter;
        self
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    /// The conditions checked after every step, built-in ones first.
    pub fn throttles(&self) -> &ThrottleRegistry {
        &self.throttles
    }

    pub fn interrupted(&self) -> bool {
        self.interruption.interrupted()
    }

    /// Run one invocation of the job for `payload`.
    ///
    /// Configuration and contract errors are returned as-is. A failing step or hook returns a
    /// `StepFailed` error whose retry payload carries the state as of the last successful step;
    /// an enumerator failing mid-run keeps its own code and carries the same payload.
    pub async fn perform(&self, job_id: JobId, payload: JobPayload) -> Result<RunOutcome> {
        let (arguments, mut state) = payload.split()?;
        state.begin_run();

        let span = info_span!(
            "iteration_job",
            job = self.job.name(),
            job_id = %job_id,
            execution = state.executions,
        );
        self.run(job_id, arguments, state).instrument(span).await
    }

    async fn run(&self, job_id: JobId, arguments: Vec<Value>, mut state: ExecutionState) -> Result<RunOutcome> {
        let name = self.job.name();
        let mut transitions = vec![RunState::NotStarted];

        let enumerator = {
            let ctx = context(job_id, name, &arguments, &state);
            self.job
                .build_enumerator(&ctx, state.cursor_position.clone())
                .await
                .map_err(|e| e.with_job(name))?
        };
        let Some(mut enumerator) = enumerator else {
            info!(job = name, "build_enumerator returned nothing, skipping the job");
            state.accumulate_elapsed();
            transitions.push(RunState::Completed);
            return Ok(RunOutcome {
                state: RunState::Completed,
                transitions,
                execution: state,
                reenqueue: None,
            });
        };

        let hook = {
            let ctx = context(job_id, name, &arguments, &state);
            if state.is_first_run() {
                self.job.on_start(&ctx).await
            } else {
                self.job.on_resume(&ctx).await
            }
        };
        if let Err(error) = hook {
            return Err(self.failed(error, &arguments, state));
        }

        debug!(job = name, cursor = ?state.cursor_position, "Running");
        transitions.push(RunState::Running);

        let stop = loop {
            let next = match enumerator.next().await {
                Ok(next) => next,
                Err(error) => return Err(self.checkpointed(error, &arguments, state)),
            };
            let Some((item, cursor)) = next else {
                break Stop::Exhausted;
            };

            let result = {
                let ctx = context(job_id, name, &arguments, &state);
                self.step(item, &ctx).await?
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(error) => return Err(self.failed(error, &arguments, state)),
            };
            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Complete => break Stop::Complete,
                StepOutcome::CompleteSkipHook => break Stop::CompleteSkipHook,
                StepOutcome::RetryAfter(delay) => break Stop::RetryAfter(delay),
            }

            state.cursor_position = Some(cursor);
            state.iterations_this_run += 1;
            IterationMetrics::record_step(name);

            // A firing throttle stops the run before anything else is pulled.
            if let Some(throttle) = self
                .throttles
                .evaluate(&state, self.config.default_retry_backoff)
            {
                break Stop::Throttled(throttle);
            }
        };

        // Every way out of Running that is not an error passes through on_shutdown.
        let hook = {
            let ctx = context(job_id, name, &arguments, &state);
            self.job.on_shutdown(&ctx).await
        };
        if let Err(error) = hook {
            return Err(self.failed(error, &arguments, state));
        }

        match stop {
            Stop::Exhausted | Stop::Complete => {
                if matches!(stop, Stop::Exhausted)
                    && state.iterations_this_run == 0
                    && state.times_interrupted == 0
                {
                    info!(job = name, "Enumerator found nothing to iterate");
                }
                self.complete(job_id, &arguments, state, transitions).await
            }
            Stop::CompleteSkipHook => {
                self.record_run(&mut state);
                info!(
                    job = name,
                    cursor = ?state.cursor_position,
                    "Iteration aborted, skipping on_complete"
                );
                transitions.push(RunState::Aborted);
                Ok(RunOutcome {
                    state: RunState::Aborted,
                    transitions,
                    execution: state,
                    reenqueue: None,
                })
            }
            Stop::RetryAfter(delay) => {
                self.checkpoint(&arguments, state, transitions, RETRY_AFTER_REASON.to_string(), delay)
            }
            Stop::Throttled(throttle) => {
                self.checkpoint(&arguments, state, transitions, throttle.reason, throttle.backoff)
            }
        }
    }

    /// Run one step through `around_iteration`.
    ///
    /// The outer error is a contract violation; the inner one is the step's own failure.
    async fn step(&self, item: J::Item, ctx: &IterationContext<'_>) -> Result<StepResult> {
        let invoked = AtomicBool::new(false);
        let step = IterationStep::new(self.job.each_iteration(item, ctx), &invoked);
        let result = self.job.around_iteration(step, ctx).await;

        if !invoked.load(Ordering::SeqCst) {
            return Err(IterationError::contract_violation(format!(
                "around_iteration of {} returned without running the step",
                ctx.job_name
            ))
            .with_job(ctx.job_name));
        }
        Ok(result)
    }

    async fn complete(
        &self,
        job_id: JobId,
        arguments: &[Value],
        mut state: ExecutionState,
        mut transitions: Vec<RunState>,
    ) -> Result<RunOutcome> {
        let name = self.job.name();
        self.record_run(&mut state);
        transitions.push(RunState::Completed);

        let hook = {
            let ctx = context(job_id, name, arguments, &state);
            self.job.on_complete(&ctx).await
        };
        if let Err(error) = hook {
            return Err(self.failed(error, arguments, state));
        }

        IterationMetrics::record_completion(name);
        info!(
            job = name,
            times_interrupted = state.times_interrupted,
            total_time = state.total_time,
            "Completed iterating"
        );

        Ok(RunOutcome {
            state: RunState::Completed,
            transitions,
            execution: state,
            reenqueue: None,
        })
    }

    fn checkpoint(
        &self,
        arguments: &[Value],
        mut state: ExecutionState,
        mut transitions: Vec<RunState>,
        reason: String,
        delay: Duration,
    ) -> Result<RunOutcome> {
        let name = self.job.name();
        transitions.push(RunState::Checkpointing);
        debug!(job = name, reason = %reason, "Checkpointing");

        self.record_run(&mut state);
        state.times_interrupted += 1;
        let payload = JobPayload::with_state(arguments, &state)?;

        IterationMetrics::record_interruption(name, &reason);
        info!(
            job = name,
            reason = %reason,
            cursor = ?state.cursor_position.as_ref().map(Cursor::encode),
            backoff_ms = delay.as_millis() as u64,
            times_interrupted = state.times_interrupted,
            "Interrupted, re-enqueueing the job"
        );

        transitions.push(RunState::Reenqueued);
        Ok(RunOutcome {
            state: RunState::Reenqueued,
            transitions,
            execution: state,
            reenqueue: Some(Reenqueue {
                payload,
                delay,
                reason,
            }),
        })
    }

    fn record_run(&self, state: &mut ExecutionState) {
        let elapsed = state.run_elapsed();
        state.accumulate_elapsed();
        IterationMetrics::record_run(self.job.name(), elapsed);
    }

    /// Turn a step or hook failure into the error handed to the queue's retry path.
    fn failed(&self, error: JobError, arguments: &[Value], state: ExecutionState) -> IterationError {
        let failure = IterationError::step_failed(error).with_job(self.job.name());
        self.checkpointed(failure, arguments, state)
    }

    /// Attach the state as of the last successful step, so a retry resumes from it.
    fn checkpointed(&self, error: IterationError, arguments: &[Value], mut state: ExecutionState) -> IterationError {
        let name = self.job.name();
        self.record_run(&mut state);

        let error = error.with_job(name);
        match JobPayload::with_state(arguments, &state) {
            Ok(payload) => error.with_retry_payload(&payload),
            Err(e) => {
                warn!(job = name, error = %e, "Could not attach the retry payload");
                error
            }
        }
    }
}

fn context<'a>(
    job_id: JobId,
    job_name: &'a str,
    arguments: &'a [Value],
    state: &'a ExecutionState,
) -> IterationContext<'a> {
    IterationContext {
        job_id,
        job_name,
        arguments,
        state,
    }
}

/// The runtime limit in force for `job`: its own override, else the global one.
fn effective_max_runtime<J: IterationJob>(job: &J, config: &IterationConfig) -> Result<Option<Duration>> {
    match (job.max_job_runtime(), config.max_job_runtime) {
        (Some(own), Some(global)) if own > global => Err(IterationError::configuration(
            ErrorCode::InvalidConfiguration,
            format!(
                "max_job_runtime of {} ({:?}) may not exceed the global limit ({:?})",
                job.name(),
                own,
                global
            ),
        )
        .with_job(job.name())),
        (own, global) => Ok(own.or(global)),
    }
}

/// Built-in conditions first, then the job's own, in definition order.
fn build_registry<J: IterationJob>(
    job: &J,
    max_runtime: Option<Duration>,
    interruption: Arc<dyn InterruptionAdapter>,
) -> ThrottleRegistry {
    let mut registry = ThrottleRegistry::new();
    if let Some(limit) = max_runtime {
        registry.push(ThrottleCondition::max_runtime(limit));
    }
    registry
        .with(ThrottleCondition::shutdown(interruption))
        .extend(&job.throttle_conditions())
}
