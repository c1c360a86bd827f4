use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor orchestration core.
///
/// Structural failures (`Validation`, `Duplicate`, `Capacity`, `NotFound`,
/// `CyclicDependency`) are reported to the caller immediately. Execution
/// failures (`Timeout`, `Executor`) are retried internally and only surface
/// as `RetryExhausted` once the retry budget is spent.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// Malformed input, e.g. an agent registration without capabilities.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An identifier that must be unique is already taken.
    #[error("Duplicate error: {0}")]
    Duplicate(String),

    /// A ceiling was reached, or no eligible agent has spare capacity.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Lookup of an unknown plan, task, workflow or agent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The task graph contains a cycle; the listed ids could not be placed.
    #[error("Cyclic dependency among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    /// A dispatched task did not resolve within its window.
    #[error("Task '{task_id}' timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The task that timed out.
        task_id: String,
        /// The configured timeout window.
        after: Duration,
    },

    /// A task failed on every attempt of its retry budget.
    #[error("Task '{task_id}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// The task that failed.
        task_id: String,
        /// Total number of attempts made.
        attempts: u32,
        /// The error reported by the final attempt.
        last_error: String,
    },

    /// An error reported by a task execution adapter.
    #[error("Executor error: {0}")]
    Executor(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
