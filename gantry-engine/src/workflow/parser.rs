use crate::actions::ActionRef;
use crate::error::{EngineError, EngineResult};
use crate::expression::{strip_expression_wrapper, value_to_string, ExprParser, ExpressionEngine};
use crate::workflow::definition::{
    ConcurrencyPolicy, JobDefinition, StepKind, StepSpec, TriggerRule, TriggerSet,
    WorkflowDefinition,
};
use crate::workflow::models::{Defaults, Matrix, RunDefaults, Step, Trigger, Workflow};

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parser for GitHub Actions-style workflow YAML files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    ///
    /// A workflow without a `name` is named after its file stem.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Workflow> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut workflow = Self::parse(&content)?;
        if workflow.name.is_none() {
            workflow.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        Ok(workflow)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> EngineResult<Workflow> {
        let workflow: Workflow = serde_yaml::from_str(content)?;
        Ok(workflow)
    }

    /// Parse, validate and compile a workflow from a YAML string.
    pub fn load(content: &str) -> EngineResult<WorkflowDefinition> {
        Self::compile(Self::parse(content)?)
    }

    /// Parse, validate and compile a workflow file.
    pub fn load_file<P: AsRef<Path>>(path: P) -> EngineResult<WorkflowDefinition> {
        Self::compile(Self::from_file(path)?)
    }

    /// Validate a parsed workflow for semantic correctness.
    pub fn validate(workflow: &Workflow) -> EngineResult<()> {
        Self::validate_triggers(&workflow.on)?;

        if let Some(concurrency) = &workflow.concurrency {
            if concurrency.group().trim().is_empty() {
                return Err(EngineError::config("concurrency group must not be empty"));
            }
            ExpressionEngine::validate(concurrency.group()).map_err(|e| {
                EngineError::config(format!("invalid concurrency group: {}", e.message))
            })?;
        }

        if workflow.jobs.is_empty() {
            return Err(EngineError::config("workflow has no jobs"));
        }

        for (job_id, job) in &workflow.jobs {
            if job.steps.is_empty() {
                return Err(EngineError::config(format!("Job '{}' has no steps", job_id)));
            }

            if let Some(matrix) = job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
                Self::validate_matrix(job_id, matrix)?;
            }

            if job.strategy.as_ref().and_then(|s| s.max_parallel) == Some(0) {
                return Err(EngineError::config(format!(
                    "Job '{}' has max-parallel of 0",
                    job_id
                )));
            }

            Self::validate_steps(&format!("job '{}'", job_id), &job.steps)?;
        }

        Ok(())
    }

    /// Validate a step list (job or composite action).
    pub(crate) fn validate_steps(owner: &str, steps: &[Step]) -> EngineResult<()> {
        let mut ids = HashSet::new();

        for (step_idx, step) in steps.iter().enumerate() {
            let step_name = step.name.as_deref().unwrap_or("unnamed");

            // Steps have either 'run' or 'uses' (not both, not neither)
            match (&step.run, &step.uses) {
                (None, None) => {
                    return Err(EngineError::config(format!(
                        "Step {} '{}' in {} must have either 'run' or 'uses'",
                        step_idx, step_name, owner
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(EngineError::config(format!(
                        "Step {} '{}' in {} cannot have both 'run' and 'uses'",
                        step_idx, step_name, owner
                    )))
                }
                (None, Some(uses)) => {
                    ActionRef::parse(uses).map_err(|e| {
                        EngineError::config(format!(
                            "Step {} '{}' in {}: {}",
                            step_idx, step_name, owner, e
                        ))
                    })?;
                }
                (Some(run), None) => {
                    ExpressionEngine::validate(run).map_err(|e| {
                        EngineError::config(format!(
                            "Step {} '{}' in {}: {}",
                            step_idx, step_name, owner, e.message
                        ))
                    })?;
                }
            }

            if let Some(id) = &step.id {
                if !ids.insert(id.as_str()) {
                    return Err(EngineError::config(format!(
                        "duplicate step id '{}' in {}",
                        id, owner
                    )));
                }
            }

            if let Some(condition) = &step.if_condition {
                ExprParser::parse_str(strip_expression_wrapper(condition)).map_err(|e| {
                    EngineError::config(format!(
                        "invalid condition on step {} '{}' in {}: {}",
                        step_idx, step_name, owner, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    fn validate_triggers(trigger: &Trigger) -> EngineResult<()> {
        let kinds: Vec<&str> = match trigger {
            Trigger::Single(kind) => vec![kind.as_str()],
            Trigger::Multiple(kinds) => kinds.iter().map(String::as_str).collect(),
            Trigger::Detailed(events) => events.keys().map(String::as_str).collect(),
        };

        if kinds.is_empty() {
            return Err(EngineError::config("workflow has no triggers"));
        }
        if kinds.iter().any(|kind| kind.trim().is_empty()) {
            return Err(EngineError::config("trigger with an empty event kind"));
        }

        Ok(())
    }

    fn validate_matrix(job_id: &str, matrix: &Matrix) -> EngineResult<()> {
        for (name, values) in &matrix.dimensions {
            if values.is_empty() {
                return Err(EngineError::config(format!(
                    "matrix dimension '{}' in job '{}' has no values",
                    name, job_id
                )));
            }
        }

        for entry in matrix.include.iter().chain(&matrix.exclude) {
            if entry.is_empty() {
                return Err(EngineError::config(format!(
                    "empty include/exclude entry in matrix of job '{}'",
                    job_id
                )));
            }
        }

        for entry in &matrix.exclude {
            for key in entry.keys() {
                if !matrix.dimensions.iter().any(|(name, _)| name == key) {
                    return Err(EngineError::config(format!(
                        "matrix exclude in job '{}' references unknown dimension '{}'",
                        job_id, key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate and convert a parsed workflow into its immutable definition.
    pub fn compile(workflow: Workflow) -> EngineResult<WorkflowDefinition> {
        Self::validate(&workflow)?;

        let triggers = Self::compile_triggers(&workflow.on);
        let concurrency = workflow.concurrency.as_ref().map(|c| ConcurrencyPolicy {
            key_template: c.group().to_string(),
            cancel_in_progress: c.cancel_in_progress(),
        });
        let workflow_defaults = run_defaults(workflow.defaults.as_ref());

        let mut jobs = Vec::with_capacity(workflow.jobs.len());
        for (id, job) in workflow.jobs {
            let job_defaults = run_defaults(job.defaults.as_ref());
            let defaults = RunDefaults {
                shell: job_defaults.shell.or_else(|| workflow_defaults.shell.clone()),
                working_directory: job_defaults
                    .working_directory
                    .or_else(|| workflow_defaults.working_directory.clone()),
            };

            let (matrix, fail_fast, max_parallel) = match job.strategy {
                Some(strategy) => (
                    strategy.matrix.unwrap_or_default(),
                    strategy.fail_fast,
                    strategy.max_parallel,
                ),
                None => (Matrix::default(), true, None),
            };

            jobs.push(JobDefinition {
                name: job.name.unwrap_or_else(|| id.clone()),
                steps: Self::compile_steps(&job.steps, &defaults)?,
                id,
                env: job.env,
                matrix,
                fail_fast,
                max_parallel,
            });
        }

        Ok(WorkflowDefinition {
            name: workflow.name.unwrap_or_else(|| "workflow".to_string()),
            triggers,
            concurrency,
            env: workflow.env,
            jobs,
        })
    }

    fn compile_triggers(trigger: &Trigger) -> TriggerSet {
        let rules = match trigger {
            Trigger::Single(kind) => vec![TriggerRule::new(kind.as_str())],
            Trigger::Multiple(kinds) => kinds.iter().map(|k| TriggerRule::new(k.as_str())).collect(),
            Trigger::Detailed(events) => {
                let mut rules: Vec<TriggerRule> = events
                    .iter()
                    .map(|(kind, config)| {
                        let config = config.clone().unwrap_or_default();
                        TriggerRule {
                            kind: kind.clone(),
                            subtypes: config.types,
                            branches: config.branches,
                            branches_ignore: config.branches_ignore,
                        }
                    })
                    .collect();
                rules.sort_by(|a, b| a.kind.cmp(&b.kind));
                rules
            }
        };

        TriggerSet { rules }
    }

    /// Convert validated raw steps into step specs.
    pub(crate) fn compile_steps(steps: &[Step], defaults: &RunDefaults) -> EngineResult<Vec<StepSpec>> {
        steps
            .iter()
            .map(|step| -> EngineResult<StepSpec> {
                let kind = match (&step.run, &step.uses) {
                    (Some(run), _) => StepKind::Command {
                        run: run.clone(),
                        shell: step.shell.clone().or_else(|| defaults.shell.clone()),
                        working_directory: step
                            .working_directory
                            .clone()
                            .or_else(|| defaults.working_directory.clone()),
                    },
                    (None, Some(uses)) => StepKind::Action {
                        uses: ActionRef::parse(uses)?,
                    },
                    (None, None) => {
                        return Err(EngineError::config(format!(
                            "step '{}' must have either 'run' or 'uses'",
                            step.display_name()
                        )))
                    }
                };

                Ok(StepSpec {
                    name: step.display_name(),
                    id: step.id.clone(),
                    kind,
                    inputs: step
                        .with
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_string(v)))
                        .collect(),
                    env: step.env.clone(),
                    condition: step.if_condition.clone(),
                    continue_on_error: step.continue_on_error,
                })
            })
            .collect()
    }
}

fn run_defaults(defaults: Option<&Defaults>) -> RunDefaults {
    defaults.and_then(|d| d.run.clone()).unwrap_or_default()
}
