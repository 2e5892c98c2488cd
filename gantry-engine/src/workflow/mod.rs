pub mod definition;
pub mod models;
pub mod parser;

pub use definition::{
    ConcurrencyPolicy, JobDefinition, StepKind, StepSpec, TriggerRule, TriggerSet,
    WorkflowDefinition,
};
pub use models::{
    Concurrency, Defaults, EventConfig, Job, Matrix, RunDefaults, Step, Strategy, Trigger,
    Workflow,
};
pub use parser::WorkflowParser;
