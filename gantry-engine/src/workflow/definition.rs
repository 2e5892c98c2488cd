// Workflow Definition
// Validated, immutable in-memory form of a workflow shared by a run

use crate::actions::ActionRef;
use crate::workflow::models::Matrix;

use serde::Serialize;
use std::collections::HashMap;

/// A validated workflow. Shared between job instances as `Arc<WorkflowDefinition>`.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub triggers: TriggerSet,
    pub concurrency: Option<ConcurrencyPolicy>,
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

impl WorkflowDefinition {
    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.id == id)
    }
}

/// The set of events a workflow reacts to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerSet {
    pub rules: Vec<TriggerRule>,
}

/// One event kind with its optional filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerRule {
    pub kind: String,
    /// Accepted sub-types; empty accepts any
    pub subtypes: Vec<String>,
    pub branches: Vec<String>,
    pub branches_ignore: Vec<String>,
}

impl TriggerRule {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_subtypes<I, S>(mut self, subtypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subtypes = subtypes.into_iter().map(Into::into).collect();
        self
    }
}

/// Concurrency group template and cancellation policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPolicy {
    pub key_template: String,
    pub cancel_in_progress: bool,
}

/// A job and its matrix strategy.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub env: HashMap<String, String>,
    pub matrix: Matrix,
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
    pub steps: Vec<StepSpec>,
}

/// A single step of a job or composite action.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub id: Option<String>,
    pub kind: StepKind,
    /// `with:` inputs, rendered to strings
    pub inputs: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// `if:` condition
    pub condition: Option<String>,
    pub continue_on_error: bool,
}

/// What a step executes.
#[derive(Debug, Clone)]
pub enum StepKind {
    Command {
        run: String,
        shell: Option<String>,
        working_directory: Option<String>,
    },
    Action {
        uses: ActionRef,
    },
}

impl StepSpec {
    /// Command step with no inputs, env or condition
    pub fn command(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            kind: StepKind::Command {
                run: run.into(),
                shell: None,
                working_directory: None,
            },
            inputs: HashMap::new(),
            env: HashMap::new(),
            condition: None,
            continue_on_error: false,
        }
    }

    /// Action step with no inputs, env or condition
    pub fn action(name: impl Into<String>, uses: ActionRef) -> Self {
        Self {
            name: name.into(),
            id: None,
            kind: StepKind::Action { uses },
            inputs: HashMap::new(),
            env: HashMap::new(),
            condition: None,
            continue_on_error: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn action_ref(&self) -> Option<&ActionRef> {
        match &self.kind {
            StepKind::Action { uses } => Some(uses),
            StepKind::Command { .. } => None,
        }
    }
}
