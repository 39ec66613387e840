//! Configuration management.
//!
//! One [`IterationConfig`] value is built at startup and passed to runners and workers as an
//! `Arc`. Job types may lower the global runtime limit through
//! [`IterationJob::max_job_runtime`](crate::jobs::IterationJob::max_job_runtime), never raise it.
//!
//! Durations are written in humantime form:
//!
//! ```toml
//! max_job_runtime = "5m"
//! default_retry_backoff = "30s"
//!
//! [worker]
//! concurrency = 8
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::jobs::{RetryPolicy, WorkerConfig};
use crate::telemetry::LoggingConfig;

/// Environment variable prefix, e.g. `ITERATION__WORKER__CONCURRENCY=8`.
pub const ENV_PREFIX: &str = "ITERATION";

/// Main configuration of the iteration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationConfig {
    /// Longest a single invocation may iterate before it checkpoints
    #[serde(default, with = "humantime_serde")]
    pub max_job_runtime: Option<Duration>,

    /// Delay applied to re-enqueues whose throttle carries no backoff of its own
    #[serde(default, with = "humantime_serde")]
    pub default_retry_backoff: Option<Duration>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry policy for jobs that do not define their own
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl IterationConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: IterationConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment variables taking precedence.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: IterationConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    pub fn with_max_job_runtime(mut self, limit: Duration) -> Self {
        self.max_job_runtime = Some(limit);
        self
    }

    pub fn with_default_retry_backoff(mut self, backoff: Duration) -> Self {
        self.default_retry_backoff = Some(backoff);
        self
    }
}
