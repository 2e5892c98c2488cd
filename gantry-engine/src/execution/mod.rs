// Execution Engine Module
// Handles run coordination, concurrency groups, matrix expansion and step execution

pub mod cancel;
pub mod concurrency;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod matrix;
pub mod outcome;

// Re-export key types
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use concurrency::{
    render_key, AdmissionDecision, ConcurrencyManager, Promotion, QueuePolicy, QueuedRun,
};
pub use context::{JobContext, RunContext, StepScope};
pub use coordinator::{PlannedJob, RunCoordinator, RunPlan};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
};
pub use executor::StepExecutor;
pub use matrix::{JobInstance, JobMatrix, MatrixAssignment, MatrixExpander};
pub use outcome::{JobResult, JobStatus, RunOutcome, RunStatus, StepResult, StepStatus};
