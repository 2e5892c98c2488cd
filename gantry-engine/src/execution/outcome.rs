// Execution Results
// Step, job and run statuses plus the serializable run report

use crate::execution::matrix::MatrixAssignment;

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Value exposed as `steps.<id>.outcome`
    pub fn as_context_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "success",
            StepStatus::Failed => "failure",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

/// Job instance lifecycle.
///
/// `Pending -> Running -> {Succeeded | Failed | Cancelled}`; `Cancelled` is
/// also reachable from `Pending`. Terminal states have no way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Aggregate the statuses of a run's job instances.
    ///
    /// Any failure wins; a run whose instances all succeeded succeeds even if
    /// a cancellation arrived after they finished. Anything else (instances
    /// cancelled or never started) makes the run Cancelled.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut all_succeeded = true;
        for status in statuses {
            match status {
                JobStatus::Failed => return RunStatus::Failed,
                JobStatus::Succeeded => {}
                _ => all_succeeded = false,
            }
        }

        if all_succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Cancelled
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: StepStatus,
    /// Failed but `continue-on-error` kept the job going
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub continued_on_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub output: String,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Nested results of a composite action
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepResult>,
}

impl StepResult {
    pub fn new(name: impl Into<String>, id: Option<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            id,
            status,
            continued_on_error: false,
            exit_code: None,
            outputs: BTreeMap::new(),
            error: None,
            output: String::new(),
            duration: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    pub fn skipped(name: impl Into<String>, id: Option<String>) -> Self {
        Self::new(name, id, StepStatus::Skipped)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// `steps.<id>.conclusion`: failures under continue-on-error conclude as success
    pub fn conclusion(&self) -> &'static str {
        if self.continued_on_error {
            StepStatus::Succeeded.as_context_str()
        } else {
            self.status.as_context_str()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: String,
    pub name: String,
    pub index: usize,
    pub matrix: MatrixAssignment,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl JobResult {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed && !s.continued_on_error)
    }
}

/// Terminal report of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub workflow: String,
    pub concurrency_key: Option<String>,
    pub status: RunStatus,
    pub jobs: Vec<JobResult>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
