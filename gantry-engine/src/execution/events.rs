// Execution Events
// Progress reporting and event types for workflow runs

use crate::execution::outcome::{JobStatus, RunStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while runs are admitted and executed
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run admitted and its job instances about to be dispatched
    RunStarted {
        run_id: Uuid,
        workflow: String,
        concurrency_key: Option<String>,
        total_jobs: usize,
    },

    /// Run is waiting for its concurrency group
    RunQueued {
        run_id: Uuid,
        workflow: String,
        concurrency_key: String,
    },

    /// Run cancelled by a newer run in its concurrency group
    RunCancelled {
        run_id: Uuid,
        concurrency_key: String,
        superseded_by: Uuid,
    },

    /// Run reached a terminal status
    RunCompleted {
        run_id: Uuid,
        workflow: String,
        status: RunStatus,
        duration: Duration,
    },

    /// Job instance started
    JobStarted {
        run_id: Uuid,
        job_id: String,
        display_name: String,
        index: usize,
        total_steps: usize,
    },

    /// Job instance completed
    JobCompleted {
        run_id: Uuid,
        job_id: String,
        index: usize,
        status: JobStatus,
        duration: Duration,
    },

    /// Step execution started
    StepStarted {
        run_id: Uuid,
        job_index: usize,
        step_name: String,
        /// Nesting depth; composite steps are one level below their parent
        depth: usize,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        run_id: Uuid,
        job_index: usize,
        step_name: String,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        run_id: Uuid,
        job_index: usize,
        step_name: String,
        depth: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Step was skipped (condition evaluated to false or no host for it)
    StepSkipped {
        run_id: Uuid,
        job_index: usize,
        step_name: String,
        depth: usize,
        reason: String,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        run_id: Option<Uuid>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a job completed event
    pub fn job_completed(
        run_id: Uuid,
        job_id: impl Into<String>,
        index: usize,
        status: JobStatus,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            run_id,
            job_id: job_id.into(),
            index,
            status,
            duration,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            run_id,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            run_id,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, run_id: Option<Uuid>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            run_id,
        }
    }

    /// Run this event belongs to, if any
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunQueued { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::JobStarted { run_id, .. }
            | Self::JobCompleted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepOutput { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepSkipped { run_id, .. } => Some(*run_id),
            Self::Log { run_id, .. } => *run_id,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
