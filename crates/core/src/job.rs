//! Job identity, lifecycle status, and terminal outcomes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScriptFailure;

/// Opaque, unique identifier assigned to a job at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a [`ScriptJob`].
///
/// `Pending -> Running -> {Completed, Failed, Aborted}`. Terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            Self::Pending => next == Self::Running,
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Aborted => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Unattended evaluation to completion.
    Run,
    /// Evaluation under the stepping debugger.
    Debug,
}

/// Terminal outcome of a job, delivered exactly once.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The script ran to completion; carries the value of its last expression.
    Completed(Dynamic),
    /// The script raised an uncaught error.
    Failed(ScriptFailure),
    /// An abort request was honored at a checkpoint.
    Aborted,
}

impl JobOutcome {
    /// The job status this outcome puts a job in.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::Aborted => JobStatus::Aborted,
        }
    }
}

/// One execution attempt.
///
/// Owned by the host while active. Its status only moves forward; attempts
/// to leave a terminal state are ignored and logged.
#[derive(Debug)]
pub struct ScriptJob {
    id: JobId,
    kind: JobKind,
    source: Arc<str>,
    status: JobStatus,
    outcome: Option<JobOutcome>,
    submitted_at: DateTime<Utc>,
}

impl ScriptJob {
    /// Create a pending job for already-normalized `source`.
    pub fn new(kind: JobKind, source: impl Into<Arc<str>>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            source: source.into(),
            status: JobStatus::Pending,
            outcome: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Move from `Pending` to `Running`.
    pub fn mark_running(&mut self) -> bool {
        self.advance(JobStatus::Running)
    }

    /// Record the terminal outcome. Returns `false` if the job had already
    /// finished.
    pub fn finish(&mut self, outcome: JobOutcome) -> bool {
        if !self.advance(outcome.status()) {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                job_id = %self.id,
                from = %self.status,
                to = %next,
                "Ignoring invalid job status transition",
            );
            return false;
        }
        self.status = next;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
