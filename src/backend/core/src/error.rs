//! Error handling for the iteration engine.
//!
//! This module provides:
//! - Machine-readable error codes grouped by taxonomy (configuration, contract, step, plumbing)
//! - User-friendly messages vs detailed internal messages
//! - Structured details, used to carry the retry payload of a failed step
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use iteration_core::error::{IterationError, Result, ErrorContext};
//!
//! fn open_fixture(path: &str) -> Result<std::fs::File> {
//!     std::fs::File::open(path).context("Failed to open fixture")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::jobs::{JobError, JobPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for iteration operations.
pub type Result<T> = std::result::Result<T, IterationError>;

/// Details key under which a failed invocation stores its retry payload.
const RETRY_PAYLOAD_KEY: &str = "retry_payload";

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration Errors (1000-1099)
    MissingOrderingKey,
    ConflictingOrderClause,
    ConflictingLimitClause,
    CursorArityMismatch,
    InvalidNestedLevel,
    PrimaryKeyNotCovered,
    InvalidSortDirection,
    InvalidBatchSize,
    TabularItemInArray,
    InvalidConfiguration,

    // Contract Errors (1100-1199)
    ContractViolation,

    // Step Errors (1200-1299)
    StepFailed,

    // Storage Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,

    // Queue Errors (2100-2199)
    QueueError,
    QueueConnectionFailed,
    QueueFull,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidCursor,

    // File Errors (2300-2399)
    IoError,
    CsvError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MissingOrderingKey => 1000,
            Self::ConflictingOrderClause => 1001,
            Self::ConflictingLimitClause => 1002,
            Self::CursorArityMismatch => 1003,
            Self::InvalidNestedLevel => 1004,
            Self::PrimaryKeyNotCovered => 1005,
            Self::InvalidSortDirection => 1006,
            Self::InvalidBatchSize => 1007,
            Self::TabularItemInArray => 1008,
            Self::InvalidConfiguration => 1009,

            Self::ContractViolation => 1100,

            Self::StepFailed => 1200,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,

            Self::QueueError => 2100,
            Self::QueueConnectionFailed => 2101,
            Self::QueueFull => 2102,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidCursor => 2202,

            Self::IoError => 2300,
            Self::CsvError => 2301,

            Self::InternalError => 9000,
        }
    }

    /// Configuration errors indicate a programming mistake in a job definition.
    pub const fn is_configuration(&self) -> bool {
        matches!(self.numeric_code(), 1000..=1099)
    }

    /// Contract errors are raised at the execution loop's dispatch boundary.
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation)
    }

    /// Check if a plain retry of the invocation can succeed.
    ///
    /// Configuration and contract errors are never retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepFailed
                | Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::QueueError
                | Self::QueueConnectionFailed
                | Self::QueueFull
                | Self::IoError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "configuration",
            1100..=1199 => "contract",
            1200..=1299 => "step",
            2000..=2099 => "database",
            2100..=2199 => "queue",
            2200..=2299 => "serialization",
            2300..=2399 => "file",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected failures of user step logic
    Low,
    /// Operational issues (storage or queue hiccups)
    Medium,
    /// Programming mistakes in job definitions
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::StepFailed => Self::Low,

            ErrorCode::DatabaseError
            | ErrorCode::QueueError
            | ErrorCode::QueueFull
            | ErrorCode::IoError
            | ErrorCode::CsvError
            | ErrorCode::InvalidCursor
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::Medium,

            ErrorCode::MissingOrderingKey
            | ErrorCode::ConflictingOrderClause
            | ErrorCode::ConflictingLimitClause
            | ErrorCode::CursorArityMismatch
            | ErrorCode::InvalidNestedLevel
            | ErrorCode::PrimaryKeyNotCovered
            | ErrorCode::InvalidSortDirection
            | ErrorCode::InvalidBatchSize
            | ErrorCode::TabularItemInArray
            | ErrorCode::InvalidConfiguration
            | ErrorCode::ContractViolation => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::QueueConnectionFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Job type the error was raised for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    /// Suggested action for the job author
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the iteration engine.
#[derive(Error, Debug)]
pub struct IterationError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message naming the violated contract
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl IterationError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error with a specific configuration code.
    pub fn configuration(code: ErrorCode, message: impl Into<String>) -> Self {
        debug_assert!(code.is_configuration());
        Self::new(code, message.into())
    }

    /// Create a contract violation error.
    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ContractViolation, message.into())
    }

    /// Create a cursor arity mismatch error.
    pub fn cursor_arity_mismatch(expected: usize, actual: usize) -> Self {
        Self::new(
            ErrorCode::CursorArityMismatch,
            format!(
                "cursor has {} value(s) but the source is configured with {} column(s)",
                actual, expected
            ),
        )
        .with_context("expected", expected)
        .with_context("actual", actual)
    }

    /// Create an invalid cursor error.
    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCursor, message.into())
    }

    /// Wrap a failure raised by user step logic.
    pub fn step_failed(error: JobError) -> Self {
        Self::with_internal(
            ErrorCode::StepFailed,
            "each_iteration raised an error",
            error.to_string(),
        )
        .with_source(error)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    /// Record the job type that raised this error.
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.details.job = Some(job.into());
        self
    }

    /// Attach the payload a retry of the failed invocation must be enqueued with.
    pub fn with_retry_payload(self, payload: &JobPayload) -> Self {
        self.with_context(RETRY_PAYLOAD_KEY, payload)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self.job_error() {
            Some(job_error) => job_error.retryable,
            None => self.code.is_retryable(),
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// The user step error behind a `StepFailed` error.
    pub fn job_error(&self) -> Option<&JobError> {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<JobError>())
    }

    /// The payload carrying the execution state as of the failure, if one was attached.
    pub fn retry_payload(&self) -> Option<JobPayload> {
        self.details
            .context
            .get(RETRY_PAYLOAD_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    job = ?self.details.job,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Iteration error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    job = ?self.details.job,
                    user_message = %self.user_message,
                    "Iteration error"
                );
            }
            ErrorSeverity::Low => {
                tracing::info!(
                    error_code = %code,
                    job = ?self.details.job,
                    internal_message = ?self.internal_message,
                    "Step failed"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::metrics::ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| IterationError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| IterationError::new(code, e.to_string()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for IterationError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for IterationError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::QueueConnectionFailed, "Unable to connect to the job queue")
        } else {
            (ErrorCode::QueueError, "A job queue error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for IterationError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<csv::Error> for IterationError {
    fn from(error: csv::Error) -> Self {
        let code = if error.is_io_error() {
            ErrorCode::IoError
        } else {
            ErrorCode::CsvError
        };

        Self::with_internal(code, "Failed to read delimited data", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for IterationError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::IoError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for IterationError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Invalid configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
