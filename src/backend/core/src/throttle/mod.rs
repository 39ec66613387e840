//! Throttle conditions evaluated after every step.
//!
//! A [`ThrottleCondition`] pairs a predicate over the [`ExecutionState`] with a backoff. The
//! [`ThrottleRegistry`] evaluates conditions in registration order; the first one that holds
//! decides the backoff and the run checkpoints.
//!
//! Registries are shared copy-on-write: [`ThrottleRegistry::inherit`] is cheap, and adding a
//! condition to an inherited registry copies the list so the parent is never affected.
//!
//! Predicates must not have side effects. They may read external state such as a
//! replication-lag gauge, but must not change it.

mod interruption;

pub use interruption::{InterruptionAdapter, NeverInterrupt};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::jobs::ExecutionState;

/// Reason recorded when the per-invocation runtime limit is exceeded.
pub const MAX_RUNTIME_REASON: &str = "max_job_runtime";

/// Reason recorded when the process is stopping.
pub const SHUTDOWN_REASON: &str = "shutdown";

type Predicate = Arc<dyn Fn(&ExecutionState) -> bool + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// How long to wait before the continuation runs.
#[derive(Clone)]
pub enum Backoff {
    /// A constant delay.
    Fixed(Duration),
    /// A delay computed each time the condition fires.
    Computed(Arc<dyn Fn() -> Duration + Send + Sync>),
    /// The configured default re-enqueue backoff, or no delay when none is configured.
    ConfiguredDefault,
}

impl Backoff {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Resolve to a concrete delay.
    pub fn resolve(&self, default_backoff: Option<Duration>) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Computed(generate) => generate(),
            Self::ConfiguredDefault => default_backoff.unwrap_or(Duration::ZERO),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
            Self::ConfiguredDefault => f.write_str("ConfiguredDefault"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conditions
// ═══════════════════════════════════════════════════════════════════════════════

/// A named predicate and the backoff applied when it holds.
#[derive(Clone)]
pub struct ThrottleCondition {
    name: String,
    predicate: Predicate,
    backoff: Backoff,
}

impl ThrottleCondition {
    pub fn new<F>(name: impl Into<String>, backoff: Backoff, predicate: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            backoff,
        }
    }

    /// Fires once this invocation has run longer than `limit`.
    pub fn max_runtime(limit: Duration) -> Self {
        Self::new(MAX_RUNTIME_REASON, Backoff::ConfiguredDefault, move |state| {
            state.run_elapsed() > limit
        })
    }

    /// Fires once `adapter` reports that the process is stopping.
    pub fn shutdown(adapter: Arc<dyn InterruptionAdapter>) -> Self {
        Self::new(SHUTDOWN_REASON, Backoff::ConfiguredDefault, move |_| {
            adapter.interrupted()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn holds(&self, state: &ExecutionState) -> bool {
        (self.predicate)(state)
    }
}

impl fmt::Debug for ThrottleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleCondition")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// The outcome of a firing condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttle {
    pub reason: String,
    pub backoff: Duration,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// An ordered, copy-on-inherit list of throttle conditions.
#[derive(Debug, Clone, Default)]
pub struct ThrottleRegistry {
    conditions: Arc<Vec<ThrottleCondition>>,
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share this registry as the starting point of a derived one.
    pub fn inherit(&self) -> Self {
        self.clone()
    }

    /// Append a condition.
    pub fn push(&mut self, condition: ThrottleCondition) {
        Arc::make_mut(&mut self.conditions).push(condition);
    }

    /// Append a condition, builder style.
    pub fn with(mut self, condition: ThrottleCondition) -> Self {
        self.push(condition);
        self
    }

    /// Register a predicate with a fixed backoff.
    pub fn throttle_on<F>(self, name: impl Into<String>, backoff: Duration, predicate: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        self.with(ThrottleCondition::new(name, Backoff::Fixed(backoff), predicate))
    }

    /// Append every condition of `other`, after this registry's own.
    pub fn extend(mut self, other: &ThrottleRegistry) -> Self {
        if !other.is_empty() {
            Arc::make_mut(&mut self.conditions).extend(other.conditions.iter().cloned());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[ThrottleCondition] {
        &self.conditions
    }

    /// The first condition that holds, with its resolved backoff.
    pub fn evaluate(&self, state: &ExecutionState, default_backoff: Option<Duration>) -> Option<Throttle> {
        self.conditions
            .iter()
            .find(|condition| condition.holds(state))
            .map(|condition| Throttle {
                reason: condition.name.clone(),
                backoff: condition.backoff.resolve(default_backoff),
            })
    }
}
