//! Error taxonomy for the script host.
//!
//! Validation and busy-state errors are returned synchronously from
//! [`ScriptHost`](crate::host::ScriptHost) operations. Runtime failures
//! never surface here; they travel as the job's terminal
//! [`JobOutcome::Failed`](crate::job::JobOutcome::Failed).

use serde::Serialize;

use crate::job::JobId;

/// A parse failure reported before any worker exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Syntax error at line {line}: {message}")]
pub struct SyntaxError {
    /// 1-based line of the offending token (`0` if unknown).
    pub line: usize,
    pub message: String,
}

/// An uncaught error raised while a script was being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Runtime error at line {line}: {message}")]
pub struct ScriptFailure {
    /// 1-based line where the error was raised (`0` if unknown).
    pub line: usize,
    pub message: String,
}

impl ScriptFailure {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }

    /// Reported when the worker thread went away without a terminal report.
    pub fn worker_lost() -> Self {
        Self::new(0, "script worker terminated unexpectedly")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("A script is already running")]
    AlreadyRunning,

    #[error("Host is busy: a script or debug session is active")]
    Busy,

    #[error("Script host has been shut down")]
    ShutDown,

    #[error("No event stream available for job {0}")]
    UnknownJob(JobId),

    #[error("Failed to start script worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
