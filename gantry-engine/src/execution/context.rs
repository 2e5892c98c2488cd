// Runtime Execution Context
// Run, job instance and step scope state used for expression evaluation and env layering

use crate::execution::matrix::MatrixAssignment;
use crate::execution::outcome::{StepResult, StepStatus};
use crate::expression::{EvalError, ExpressionContext, ExpressionEngine, JobStatusContext};
use crate::trigger::Event;
use crate::workflow::definition::{JobDefinition, WorkflowDefinition};

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Facts shared by every job instance of a run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow: Arc<WorkflowDefinition>,
    pub event: Event,
    pub workspace: PathBuf,
    /// Lowest env layer, usually the process environment
    pub base_env: HashMap<String, String>,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
        event: Event,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id,
            workflow,
            event,
            workspace: workspace.into(),
            base_env: HashMap::new(),
        }
    }

    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// The `github` context
    pub fn github(&self) -> Map<String, Value> {
        let event = &self.event;
        let mut github = Map::new();
        github.insert("workflow".into(), json!(self.workflow.name));
        github.insert("run_id".into(), json!(self.run_id.to_string()));
        github.insert("event_name".into(), json!(event.kind));
        github.insert("ref".into(), json!(event.git_ref));
        github.insert("ref_name".into(), json!(ref_name(&event.git_ref)));
        github.insert("head_ref".into(), json!(event.head_ref.clone().unwrap_or_default()));
        github.insert("base_ref".into(), json!(event.base_ref.clone().unwrap_or_default()));
        github.insert("sha".into(), json!(event.sha.clone().unwrap_or_default()));
        github.insert("actor".into(), json!(event.actor.clone().unwrap_or_default()));
        github.insert("workspace".into(), json!(self.workspace.display().to_string()));
        github.insert("event".into(), json!({ "action": event.subtype }));
        github
    }

    /// Expression context with only `github` populated
    pub fn expression_context(&self) -> ExpressionContext {
        ExpressionContext {
            github: self.github(),
            ..Default::default()
        }
    }

    /// Variables every step process sees before workflow env
    fn default_env(&self) -> Vec<(&'static str, String)> {
        let event = &self.event;
        vec![
            ("CI", "true".to_string()),
            ("GITHUB_ACTIONS", "true".to_string()),
            ("GITHUB_WORKFLOW", self.workflow.name.clone()),
            ("GITHUB_RUN_ID", self.run_id.to_string()),
            ("GITHUB_EVENT_NAME", event.kind.clone()),
            ("GITHUB_REF", event.git_ref.clone()),
            ("GITHUB_REF_NAME", ref_name(&event.git_ref).to_string()),
            ("GITHUB_HEAD_REF", event.head_ref.clone().unwrap_or_default()),
            ("GITHUB_BASE_REF", event.base_ref.clone().unwrap_or_default()),
            ("GITHUB_SHA", event.sha.clone().unwrap_or_default()),
            ("GITHUB_ACTOR", event.actor.clone().unwrap_or_default()),
            ("GITHUB_WORKSPACE", self.workspace.display().to_string()),
            ("RUNNER_OS", runner_os().to_string()),
            ("RUNNER_TEMP", std::env::temp_dir().display().to_string()),
        ]
    }
}

fn ref_name(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
}

fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

/// Read-only context of a single job instance
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run: Arc<RunContext>,
    pub job_id: String,
    /// Instance position within the run
    pub index: usize,
    matrix: Map<String, Value>,
    runner: Map<String, Value>,
}

impl JobContext {
    pub fn new(
        run: Arc<RunContext>,
        job_id: impl Into<String>,
        index: usize,
        matrix: &MatrixAssignment,
    ) -> Self {
        let mut runner = Map::new();
        runner.insert("os".into(), json!(runner_os()));
        runner.insert("arch".into(), json!(std::env::consts::ARCH));
        runner.insert("temp".into(), json!(std::env::temp_dir().display().to_string()));

        Self {
            run,
            job_id: job_id.into(),
            index,
            matrix: matrix.to_context(),
            runner,
        }
    }

    /// Top-level scope of the job: base env < defaults < workflow env < job env.
    ///
    /// Workflow and job env values may reference `matrix` and `github`.
    pub fn root_scope(&self, job: &JobDefinition) -> Result<StepScope, EvalError> {
        let mut scope = StepScope::default();
        scope.env.extend(self.run.base_env.clone());
        for (key, value) in self.run.default_env() {
            scope.env.insert(key.to_string(), value);
        }

        for layer in [&self.run.workflow.env, &job.env] {
            let ctx = self.expression_context(&scope, &scope.env);
            let rendered = interpolate_map(layer, &ctx)?;
            scope.env.extend(rendered);
        }

        Ok(scope)
    }

    /// Expression context for evaluating within `scope` with `env` visible
    pub fn expression_context(
        &self,
        scope: &StepScope,
        env: &HashMap<String, String>,
    ) -> ExpressionContext {
        ExpressionContext {
            github: self.run.github(),
            env: env
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            matrix: self.matrix.clone(),
            steps: scope.steps.clone(),
            inputs: scope.inputs.clone(),
            runner: self.runner.clone(),
            job: scope.status,
        }
    }
}

/// Step-visible state of a job or of one composite action invocation.
///
/// Composite actions get a fresh scope: their steps see their own `steps`
/// and `inputs` contexts.
#[derive(Debug, Clone, Default)]
pub struct StepScope {
    pub env: HashMap<String, String>,
    steps: Map<String, Value>,
    inputs: Map<String, Value>,
    pub status: JobStatusContext,
}

impl StepScope {
    /// Scope for the steps of a composite action invoked from `self`
    pub fn child(&self, env: HashMap<String, String>, inputs: &HashMap<String, String>) -> Self {
        Self {
            env,
            steps: Map::new(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            status: JobStatusContext {
                failed: false,
                cancelled: self.status.cancelled,
            },
        }
    }

    /// Expose a finished step as `steps.<id>`
    pub fn record_step(&mut self, result: &StepResult) {
        if let Some(id) = &result.id {
            let outputs: Map<String, Value> = result
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.steps.insert(
                id.clone(),
                json!({
                    "outputs": outputs,
                    "outcome": result.status.as_context_str(),
                    "conclusion": result.conclusion(),
                }),
            );
        }

        match result.status {
            StepStatus::Failed if !result.continued_on_error => self.status.failed = true,
            StepStatus::Cancelled => self.status.cancelled = true,
            _ => {}
        }
    }

    /// Apply values a step wrote to `GITHUB_ENV`
    pub fn apply_env(&mut self, env: &HashMap<String, String>) {
        for (key, value) in env {
            self.env.insert(key.clone(), value.clone());
        }
    }

    pub fn step_output(&self, id: &str, name: &str) -> Option<&str> {
        self.steps.get(id)?.get("outputs")?.get(name)?.as_str()
    }
}

/// Interpolate every value of an env-like map
pub fn interpolate_map(
    values: &HashMap<String, String>,
    ctx: &ExpressionContext,
) -> Result<HashMap<String, String>, EvalError> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), ExpressionEngine::interpolate(v, ctx)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{StepSpec, TriggerSet};
    use crate::workflow::models::Matrix;

    fn workflow() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "CI".to_string(),
            triggers: TriggerSet::default(),
            concurrency: None,
            env: HashMap::from([
                ("LEVEL".to_string(), "workflow".to_string()),
                ("CARGO_TERM_COLOR".to_string(), "always".to_string()),
            ]),
            jobs: vec![],
        })
    }

    fn job() -> JobDefinition {
        JobDefinition {
            id: "build".to_string(),
            name: "build".to_string(),
            env: HashMap::from([
                ("LEVEL".to_string(), "job".to_string()),
                ("TARGET".to_string(), "${{ matrix.target }}".to_string()),
            ]),
            matrix: Matrix::default(),
            fail_fast: true,
            max_parallel: None,
            steps: vec![StepSpec::command("noop", "true")],
        }
    }

    fn job_context() -> JobContext {
        let run = RunContext::new(
            Uuid::nil(),
            workflow(),
            Event::new("push", "refs/heads/main").with_sha("abc123"),
            "/work",
        )
        .with_base_env(HashMap::from([
            ("RUST_BACKTRACE".to_string(), "1".to_string()),
            ("LEVEL".to_string(), "process".to_string()),
        ]));
        let matrix: MatrixAssignment = vec![("target", json!("x86_64-unknown-linux-gnu"))]
            .into_iter()
            .collect();
        JobContext::new(Arc::new(run), "build", 0, &matrix)
    }

    #[test]
    fn test_env_layering() {
        let ctx = job_context();
        let scope = ctx.root_scope(&job()).unwrap();
        assert_eq!(scope.env["LEVEL"], "job");
        assert_eq!(scope.env["RUST_BACKTRACE"], "1");
        assert_eq!(scope.env["CARGO_TERM_COLOR"], "always");
        assert_eq!(scope.env["TARGET"], "x86_64-unknown-linux-gnu");
        assert_eq!(scope.env["GITHUB_REF_NAME"], "main");
        assert_eq!(scope.env["GITHUB_SHA"], "abc123");
    }

    #[test]
    fn test_github_context() {
        let ctx = job_context();
        let github = ctx.run.github();
        assert_eq!(github["event_name"], "push");
        assert_eq!(github["ref"], "refs/heads/main");
        assert_eq!(github["workflow"], "CI");
        assert_eq!(github["run_id"], Uuid::nil().to_string());
    }

    #[test]
    fn test_record_step() {
        let mut scope = StepScope::default();
        let mut result = StepResult::new("Version", Some("version".to_string()), StepStatus::Succeeded);
        result.outputs.insert("value".to_string(), "1.0".to_string());
        scope.record_step(&result);
        assert_eq!(scope.step_output("version", "value"), Some("1.0"));
        assert!(!scope.status.failed);

        let mut lint = StepResult::new("Lint", Some("lint".to_string()), StepStatus::Failed);
        lint.continued_on_error = true;
        scope.record_step(&lint);
        assert!(!scope.status.failed);

        let ctx = job_context();
        let expr = ctx.expression_context(&scope, &scope.env);
        assert_eq!(
            ExpressionEngine::evaluate("steps.lint.outcome", &expr).unwrap(),
            json!("failure")
        );
        assert_eq!(
            ExpressionEngine::evaluate("steps.lint.conclusion", &expr).unwrap(),
            json!("success")
        );

        scope.record_step(&StepResult::new("Test", None, StepStatus::Failed));
        assert!(scope.status.failed);
    }

    #[test]
    fn test_child_scope() {
        let mut parent = StepScope::default();
        parent.status.failed = true;
        parent.record_step(&StepResult::new("a", Some("a".to_string()), StepStatus::Succeeded));

        let child = parent.child(
            HashMap::new(),
            &HashMap::from([("name".to_string(), "world".to_string())]),
        );
        assert!(!child.status.failed);
        assert!(child.step_output("a", "x").is_none());

        let ctx = job_context();
        let expr = ctx.expression_context(&child, &child.env);
        assert_eq!(
            ExpressionEngine::evaluate("inputs.name", &expr).unwrap(),
            json!("world")
        );
    }
}
