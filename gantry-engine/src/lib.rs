// Gantry Engine Library
// Workflow run orchestration: triggers, concurrency groups, matrix fan-out and step execution

pub mod actions;
pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod runners;
pub mod trigger;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

// Re-export workflow types
pub use workflow::{
    ConcurrencyPolicy, JobDefinition, StepKind, StepSpec, TriggerRule, TriggerSet,
    WorkflowDefinition, WorkflowParser,
};

// Re-export trigger types
pub use trigger::{Event, TriggerEvaluator};

// Re-export expression types
pub use expression::{EvalError, ExpressionContext, ExpressionEngine};

// Re-export action types
pub use actions::{ActionCache, ActionFetcher, ActionRef, ActionResolver, ExecutableUnit};

// Re-export execution types
pub use execution::{
    AdmissionDecision, ConcurrencyManager, ExecutionEvent, JobResult, JobStatus, MatrixExpander,
    ProgressSender, QueuePolicy, RunCoordinator, RunOutcome, RunPlan, RunStatus, StepExecutor,
    StepResult, StepStatus,
};

// Re-export runner types
pub use runners::{ActionHost, CommandRunner, Shell, ShellRunner};
