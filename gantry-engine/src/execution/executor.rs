// Step Executor
// Runs the ordered steps of one job instance, delegating to runners and composite actions

use crate::actions::{ActionRef, ActionResolver, CompositeAction, ExecutableUnit, ExternalAction, ResolvedStep};
use crate::error::EngineError;
use crate::execution::cancel::CancelToken;
use crate::execution::context::{interpolate_map, JobContext, RunContext, StepScope};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::matrix::JobInstance;
use crate::execution::outcome::{JobResult, JobStatus, StepResult, StepStatus};
use crate::expression::ExpressionEngine;
use crate::runners::{ActionHost, CommandOutput, CommandRequest, CommandRunner, OutputCallback};
use crate::workflow::definition::{JobDefinition, StepKind, StepSpec};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs job instances step by step
pub struct StepExecutor {
    /// Runner for `run:` steps
    runner: Arc<dyn CommandRunner>,
    /// Resolver for `uses:` steps
    resolver: Arc<ActionResolver>,
    /// Host for opaque external actions
    action_host: Option<Arc<dyn ActionHost>>,
    /// Progress event sender
    event_tx: Option<ProgressSender>,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, resolver: Arc<ActionResolver>) -> Self {
        Self {
            runner,
            resolver,
            action_host: None,
            event_tx: None,
        }
    }

    /// Set the host for external actions
    pub fn with_action_host(mut self, host: Arc<dyn ActionHost>) -> Self {
        self.action_host = Some(host);
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every step of a job instance.
    ///
    /// Actions are resolved when the instance starts; a resolution error fails
    /// the instance without running any step. Cancellation is observed before
    /// every step and interrupts the step in flight.
    pub async fn run(
        &self,
        run: Arc<RunContext>,
        job: &JobDefinition,
        instance: &JobInstance,
        cancel: CancelToken,
    ) -> JobResult {
        let start = Instant::now();
        let run_id = run.run_id;
        let display_name = instance.display_name(&job.name);
        let ctx = JobContext::new(run, &job.id, instance.index, &instance.matrix);

        let mut result = JobResult {
            job_id: job.id.clone(),
            name: display_name.clone(),
            index: instance.index,
            matrix: instance.matrix.clone(),
            status: JobStatus::Running,
            steps: Vec::new(),
            error: None,
            duration: Default::default(),
        };

        if cancel.is_cancelled() {
            result.status = JobStatus::Cancelled;
            result.steps = job.steps.iter().map(cancelled_step).collect();
            return result;
        }

        self.event_tx.send_event(ExecutionEvent::JobStarted {
            run_id,
            job_id: job.id.clone(),
            display_name: display_name.clone(),
            index: instance.index,
            total_steps: job.steps.len(),
        });
        info!(%run_id, job = %display_name, "job started");

        let prepared = match self.resolver.resolve_steps(&job.steps).await {
            Ok(steps) => ctx
                .root_scope(job)
                .map(|scope| (steps, scope))
                .map_err(|e| EngineError::Expression(e.message)),
            Err(e) => Err(e),
        };

        match prepared {
            Ok((steps, mut scope)) => {
                result.steps = self.run_steps(&ctx, &mut scope, &steps, 0, &cancel).await;
                result.status = job_status(&result.steps);
                if let Some(failed) = result.failed_step() {
                    let reason = failed
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string());
                    result.error = Some(
                        EngineError::StepFailure {
                            step: failed.name.clone(),
                            reason,
                        }
                        .to_string(),
                    );
                }
            }
            Err(e) => {
                warn!(%run_id, job = %display_name, error = %e, "job could not start");
                self.event_tx
                    .send_event(ExecutionEvent::error(e.to_string(), Some(run_id)));
                result.status = JobStatus::Failed;
                result.error = Some(e.to_string());
                result.steps = job
                    .steps
                    .iter()
                    .map(|s| StepResult::skipped(&s.name, s.id.clone()))
                    .collect();
            }
        }

        result.duration = start.elapsed();
        self.event_tx.send_event(ExecutionEvent::job_completed(
            run_id,
            &job.id,
            instance.index,
            result.status,
            result.duration,
        ));
        info!(%run_id, job = %display_name, status = %result.status, "job finished");

        result
    }

    /// Run a step list sequentially within `scope`
    fn run_steps<'a>(
        &'a self,
        ctx: &'a JobContext,
        scope: &'a mut StepScope,
        steps: &'a [ResolvedStep],
        depth: usize,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Vec<StepResult>> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(steps.len());
            for step in steps {
                let result = self.run_step(ctx, scope, step, depth, cancel).await;
                scope.record_step(&result);
                results.push(result);
            }
            results
        })
    }

    async fn run_step(
        &self,
        ctx: &JobContext,
        scope: &mut StepScope,
        step: &ResolvedStep,
        depth: usize,
        cancel: &CancelToken,
    ) -> StepResult {
        let spec = &step.spec;
        let run_id = ctx.run.run_id;

        if cancel.is_cancelled() {
            return cancelled_step(spec);
        }

        // Evaluate condition
        let condition_ctx = ctx.expression_context(scope, &scope.env);
        match ExpressionEngine::evaluate_condition(spec.condition.as_deref(), &condition_ctx) {
            Ok(true) => {}
            Ok(false) => {
                let reason = match &spec.condition {
                    Some(condition) => format!("condition '{}' evaluated to false", condition),
                    None => "a previous step failed".to_string(),
                };
                self.event_tx.send_event(ExecutionEvent::StepSkipped {
                    run_id,
                    job_index: ctx.index,
                    step_name: spec.name.clone(),
                    depth,
                    reason,
                });
                return StepResult::skipped(&spec.name, spec.id.clone());
            }
            Err(e) => {
                return self.finish(
                    spec,
                    StepResult::new(&spec.name, spec.id.clone(), StepStatus::Failed)
                        .with_error(format!("invalid condition: {}", e.message)),
                );
            }
        }

        self.event_tx.send_event(ExecutionEvent::StepStarted {
            run_id,
            job_index: ctx.index,
            step_name: spec.name.clone(),
            depth,
        });
        debug!(%run_id, job = %ctx.job_id, step = %spec.name, depth, "step started");

        let start = Instant::now();
        let mut result = match self.step_env(ctx, scope, spec) {
            Ok((env, inputs)) => match (&spec.kind, &step.unit) {
                (StepKind::Command { .. }, _) => {
                    self.run_command(ctx, scope, spec, env, cancel).await
                }
                (StepKind::Action { .. }, Some(ExecutableUnit::Composite(action))) => {
                    self.run_composite(ctx, spec, action, env, inputs, depth, cancel)
                        .await
                }
                (StepKind::Action { .. }, Some(ExecutableUnit::External(action))) => {
                    self.run_external(ctx, spec, action, env, inputs, depth, cancel)
                        .await
                }
                (StepKind::Action { uses }, None) => {
                    StepResult::new(&spec.name, spec.id.clone(), StepStatus::Failed)
                        .with_error(format!("action '{}' was not resolved", uses))
                }
            },
            Err(message) => StepResult::new(&spec.name, spec.id.clone(), StepStatus::Failed)
                .with_error(message),
        };
        result.duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::StepCompleted {
            run_id,
            job_index: ctx.index,
            step_name: spec.name.clone(),
            depth,
            status: result.status,
            duration: result.duration,
            exit_code: result.exit_code,
        });

        self.finish(spec, result)
    }

    /// Apply continue-on-error to a finished step
    fn finish(&self, spec: &StepSpec, mut result: StepResult) -> StepResult {
        if result.status == StepStatus::Failed && spec.continue_on_error {
            result.continued_on_error = true;
        }
        result
    }

    /// Step env (scope env < step env < step inputs) and rendered `with:` inputs
    fn step_env(
        &self,
        ctx: &JobContext,
        scope: &StepScope,
        spec: &StepSpec,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), String> {
        let scope_ctx = ctx.expression_context(scope, &scope.env);
        let mut env = scope.env.clone();
        env.extend(interpolate_map(&spec.env, &scope_ctx).map_err(|e| e.message)?);

        let step_ctx = ctx.expression_context(scope, &env);
        let inputs = interpolate_map(&spec.inputs, &step_ctx).map_err(|e| e.message)?;
        env.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok((env, inputs))
    }

    async fn run_command(
        &self,
        ctx: &JobContext,
        scope: &mut StepScope,
        spec: &StepSpec,
        env: HashMap<String, String>,
        cancel: &CancelToken,
    ) -> StepResult {
        let StepKind::Command {
            run,
            shell,
            working_directory,
        } = &spec.kind
        else {
            return StepResult::new(&spec.name, spec.id.clone(), StepStatus::Failed)
                .with_error("not a command step");
        };

        let expr_ctx = ctx.expression_context(scope, &env);
        let script = match ExpressionEngine::interpolate(run, &expr_ctx) {
            Ok(script) => script,
            Err(e) => {
                return StepResult::new(&spec.name, spec.id.clone(), StepStatus::Failed)
                    .with_error(e.message)
            }
        };
        let working_dir = match working_directory {
            Some(dir) => ctx.run.workspace.join(dir),
            None => ctx.run.workspace.clone(),
        };

        let request = CommandRequest {
            script,
            shell: shell.clone(),
            working_dir,
            env,
            on_output: self.output_callback(ctx, &spec.name),
        };

        let output = self.runner.run(request, cancel.clone()).await;
        if !output.cancelled {
            scope.apply_env(&output.env);
        }
        command_result(spec, output)
    }

    fn output_callback(&self, ctx: &JobContext, step_name: &str) -> Option<OutputCallback> {
        let tx = self.event_tx.clone()?;
        let run_id = ctx.run.run_id;
        let job_index = ctx.index;
        let step_name = step_name.to_string();
        Some(Arc::new(move |line: &str, is_error: bool| {
            tx.send_event(ExecutionEvent::StepOutput {
                run_id,
                job_index,
                step_name: step_name.clone(),
                output: line.to_string(),
                is_error,
            });
        }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_composite(
        &self,
        ctx: &JobContext,
        spec: &StepSpec,
        action: &Arc<CompositeAction>,
        mut env: HashMap<String, String>,
        provided: HashMap<String, String>,
        depth: usize,
        cancel: &CancelToken,
    ) -> StepResult {
        let mut result = StepResult::new(&spec.name, spec.id.clone(), StepStatus::Succeeded);

        let inputs = match composite_inputs(action, provided) {
            Ok(inputs) => inputs,
            Err(message) => {
                result.status = StepStatus::Failed;
                return result.with_error(message);
            }
        };
        for (name, value) in &inputs {
            env.insert(input_env_name(name), value.clone());
        }

        let mut child = StepScope::default().child(env, &inputs);
        result.steps = self
            .run_steps(ctx, &mut child, &action.steps, depth + 1, cancel)
            .await;

        if result.steps.iter().any(|s| s.status == StepStatus::Cancelled) {
            result.status = StepStatus::Cancelled;
            return result;
        }
        if let Some(failed) = result
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed && !s.continued_on_error)
        {
            result.status = StepStatus::Failed;
            let reason = failed.error.as_deref().unwrap_or("failed");
            let message = format!("{}: {}", failed.name, reason);
            return result.with_error(message);
        }

        let output_ctx = ctx.expression_context(&child, &child.env);
        for (name, expression) in &action.outputs {
            match ExpressionEngine::interpolate(expression, &output_ctx) {
                Ok(value) => {
                    result.outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    result.status = StepStatus::Failed;
                    return result.with_error(format!("output '{}': {}", name, e.message));
                }
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_external(
        &self,
        ctx: &JobContext,
        spec: &StepSpec,
        action: &Arc<ExternalAction>,
        env: HashMap<String, String>,
        inputs: HashMap<String, String>,
        depth: usize,
        cancel: &CancelToken,
    ) -> StepResult {
        let run_id = ctx.run.run_id;

        let Some(host) = &self.action_host else {
            if is_checkout(&action.reference) {
                debug!(%run_id, action = %action.identifier, "workspace is already checked out");
                return StepResult::new(&spec.name, spec.id.clone(), StepStatus::Succeeded);
            }

            let reason = format!("no action host configured for '{}'", action.identifier);
            warn!(%run_id, step = %spec.name, action = %action.identifier, "skipping external action");
            self.event_tx.send_event(ExecutionEvent::StepSkipped {
                run_id,
                job_index: ctx.index,
                step_name: spec.name.clone(),
                depth,
                reason: reason.clone(),
            });
            self.event_tx
                .send_event(ExecutionEvent::warning(reason, Some(run_id)));
            return StepResult::skipped(&spec.name, spec.id.clone());
        };

        let outcome = host.invoke(action, &inputs, &env, cancel.clone()).await;
        let status = if cancel.is_cancelled() {
            StepStatus::Cancelled
        } else if outcome.success {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };

        let mut result = StepResult::new(&spec.name, spec.id.clone(), status);
        result.outputs = outcome.outputs.into_iter().collect();
        if status == StepStatus::Failed {
            result.error = Some(
                outcome
                    .message
                    .unwrap_or_else(|| format!("action '{}' failed", action.identifier)),
            );
        }
        result
    }
}

fn cancelled_step(spec: &StepSpec) -> StepResult {
    StepResult::new(&spec.name, spec.id.clone(), StepStatus::Cancelled)
}

/// Final status of a job from its step results
fn job_status(steps: &[StepResult]) -> JobStatus {
    if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
        JobStatus::Cancelled
    } else if steps
        .iter()
        .any(|s| s.status == StepStatus::Failed && !s.continued_on_error)
    {
        JobStatus::Failed
    } else {
        JobStatus::Succeeded
    }
}

fn command_result(spec: &StepSpec, output: CommandOutput) -> StepResult {
    let status = if output.cancelled {
        StepStatus::Cancelled
    } else if output.succeeded() {
        StepStatus::Succeeded
    } else {
        StepStatus::Failed
    };

    let mut result = StepResult::new(&spec.name, spec.id.clone(), status);
    result.exit_code = output.exit_code;
    result.outputs = output.outputs.into_iter().collect::<BTreeMap<_, _>>();
    result.error = match (&output.error, status) {
        (Some(error), _) => Some(error.clone()),
        (None, StepStatus::Failed) => Some(match output.exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by signal".to_string(),
        }),
        _ => None,
    };
    result.output = if output.stderr.is_empty() {
        output.stdout
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    };
    result
}

/// Declared inputs with defaults applied; undeclared inputs pass through
fn composite_inputs(
    action: &CompositeAction,
    mut provided: HashMap<String, String>,
) -> Result<HashMap<String, String>, String> {
    for (name, default) in &action.input_defaults {
        provided
            .entry(name.clone())
            .or_insert_with(|| default.clone());
    }

    let mut missing: Vec<&str> = action
        .inputs
        .iter()
        .filter(|(name, input)| input.required && !provided.contains_key(*name))
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(format!(
            "action '{}' is missing required input(s): {}",
            action.identifier,
            missing.join(", ")
        ));
    }

    Ok(provided)
}

/// `INPUT_<NAME>` variable for an action input
fn input_env_name(name: &str) -> String {
    format!("INPUT_{}", name.replace(' ', "_").to_uppercase())
}

fn is_checkout(reference: &ActionRef) -> bool {
    matches!(reference, ActionRef::External { owner, repo, .. } if owner == "actions" && repo == "checkout")
}
