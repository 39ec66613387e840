//! Execution state and its payload encoding.
//!
//! The state of an iteration job travels inside the job's own arguments: the last positional
//! argument may be a map holding the marker key [`STATE_MARKER`]:
//!
//! ```json
//! ["tenant-42", {"__job_iteration__": {
//!     "executions": 3, "cursorPosition": [1700000000, 17],
//!     "timesInterrupted": 2, "totalTime": 41.7
//! }}]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::cursor::Cursor;
use crate::error::Result;

/// Key marking the trailing argument that carries an [`ExecutionState`].
pub const STATE_MARKER: &str = "__job_iteration__";

// ═══════════════════════════════════════════════════════════════════════════════
// Execution State
// ═══════════════════════════════════════════════════════════════════════════════

/// Progress of one logical iteration job across invocations.
///
/// Only the execution loop mutates it; step logic sees it read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionState {
    /// Number of invocations so far, including the current one.
    pub executions: u32,
    /// Last successfully processed position; `None` means start from the beginning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<Cursor>,
    /// Number of checkpoints taken before the current invocation.
    pub times_interrupted: u32,
    /// Seconds spent iterating across all invocations.
    pub total_time: f64,
    /// Steps completed in the current invocation.
    #[serde(skip)]
    pub iterations_this_run: u64,
    #[serde(skip)]
    run_started_at: Option<Instant>,
}

impl ExecutionState {
    /// Start a new invocation.
    pub fn begin_run(&mut self) {
        self.executions += 1;
        self.iterations_this_run = 0;
        self.run_started_at = Some(Instant::now());
    }

    /// Time spent in the current invocation.
    pub fn run_elapsed(&self) -> Duration {
        self.run_started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Fold the current invocation's runtime into `total_time`. Idempotent per invocation.
    pub fn accumulate_elapsed(&mut self) {
        if let Some(started) = self.run_started_at.take() {
            self.total_time += started.elapsed().as_secs_f64();
        }
    }

    /// Whether this is the very first invocation of the job.
    pub fn is_first_run(&self) -> bool {
        self.executions == 1 && self.times_interrupted == 0
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor_position.as_ref()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// The positional arguments of an iteration job, possibly carrying its state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(Vec<Value>);

impl JobPayload {
    pub fn new(arguments: Vec<Value>) -> Self {
        Self(arguments)
    }

    /// Arguments followed by the state map.
    pub fn with_state(arguments: &[Value], state: &ExecutionState) -> Result<Self> {
        let mut marker = Map::new();
        marker.insert(STATE_MARKER.to_string(), serde_json::to_value(state)?);

        let mut values = arguments.to_vec();
        values.push(Value::Object(marker));
        Ok(Self(values))
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Whether the trailing argument carries a state marker.
    pub fn has_state(&self) -> bool {
        matches!(self.0.last(), Some(Value::Object(map)) if map.contains_key(STATE_MARKER))
    }

    /// Separate the user arguments from the execution state.
    ///
    /// Without a marker the state is the default, first-run state. If the trailing map holds
    /// other keys besides the marker, those stay behind as a user argument.
    pub fn split(self) -> Result<(Vec<Value>, ExecutionState)> {
        let mut arguments = self.0;
        if !matches!(arguments.last(), Some(Value::Object(map)) if map.contains_key(STATE_MARKER)) {
            return Ok((arguments, ExecutionState::default()));
        }

        let Some(Value::Object(mut map)) = arguments.pop() else {
            return Ok((arguments, ExecutionState::default()));
        };
        let state = match map.remove(STATE_MARKER) {
            Some(Value::Null) | None => ExecutionState::default(),
            Some(value) => serde_json::from_value(value)?,
        };
        if !map.is_empty() {
            arguments.push(Value::Object(map));
        }
        Ok((arguments, state))
    }
}

impl From<Vec<Value>> for JobPayload {
    fn from(arguments: Vec<Value>) -> Self {
        Self(arguments)
    }
}
