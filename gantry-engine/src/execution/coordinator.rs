// Run Coordinator
// Turns accepted events into runs: admission, matrix fan-out, parallel dispatch and aggregation

use crate::actions::{ActionCache, ActionResolver};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::execution::concurrency::{render_key, AdmissionDecision, ConcurrencyManager, Promotion};
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::StepExecutor;
use crate::execution::matrix::{JobInstance, JobMatrix, MatrixAssignment, MatrixExpander};
use crate::execution::outcome::{JobResult, JobStatus, RunOutcome, RunStatus, StepResult, StepStatus};
use crate::runners::{Shell, ShellRunner};
use crate::trigger::{Event, TriggerEvaluator};
use crate::workflow::definition::WorkflowDefinition;

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What a run for an event would look like, without executing it
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub workflow: String,
    pub accepted: bool,
    pub concurrency_key: Option<String>,
    pub cancel_in_progress: bool,
    pub jobs: Vec<PlannedJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub job_id: String,
    pub name: String,
    pub index: usize,
    pub matrix: MatrixAssignment,
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
}

/// Instance statuses of one run, shared by its job tasks
struct RunState {
    statuses: Vec<JobStatus>,
}

impl RunState {
    fn new(total_jobs: usize) -> Self {
        Self {
            statuses: vec![JobStatus::Pending; total_jobs],
        }
    }

    fn transition(&mut self, index: usize, next: JobStatus) {
        if let Some(status) = self.statuses.get_mut(index) {
            if status.can_transition_to(next) {
                *status = next;
            } else {
                debug!(index, from = %status, to = %next, "ignored job status transition");
            }
        }
    }

    /// Mark an instance whose task died without a result
    fn abandon(&mut self, index: usize) {
        if let Some(status) = self.statuses.get_mut(index) {
            if !status.is_terminal() {
                *status = JobStatus::Failed;
            }
        }
    }
}

/// Releases a run's concurrency slot and registration however `handle` ends,
/// including when its future is dropped mid-run
struct RunGuard<'a> {
    coordinator: &'a RunCoordinator,
    run_id: Uuid,
    key: Option<String>,
    handle: CancelHandle,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.handle.cancel();
        if let Some(key) = &self.key {
            self.coordinator.concurrency.release(key, self.run_id);
        }
        lock(&self.coordinator.runs).remove(&self.run_id);
    }
}

/// Top-level orchestrator for one workflow
pub struct RunCoordinator {
    workflow: Arc<WorkflowDefinition>,
    executor: Arc<StepExecutor>,
    concurrency: Arc<ConcurrencyManager>,
    workspace: PathBuf,
    base_env: HashMap<String, String>,
    event_tx: Option<ProgressSender>,
    /// Cancel handles of runs in flight
    runs: Mutex<HashMap<Uuid, CancelHandle>>,
}

impl RunCoordinator {
    pub fn new(workflow: Arc<WorkflowDefinition>, executor: Arc<StepExecutor>) -> Self {
        Self {
            workflow,
            executor,
            concurrency: Arc::new(ConcurrencyManager::default()),
            workspace: PathBuf::from("."),
            base_env: HashMap::new(),
            event_tx: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Build a coordinator with the shell runner, action cache and queue
    /// policy described by `config`
    pub fn from_config(
        workflow: Arc<WorkflowDefinition>,
        config: &EngineConfig,
        workspace: impl Into<PathBuf>,
        progress: Option<ProgressSender>,
    ) -> EngineResult<Self> {
        let workspace = workspace.into();

        let shell = match &config.default_shell {
            Some(name) => Shell::from_name(name).ok_or_else(|| {
                EngineError::config(format!("unsupported default shell '{}'", name))
            })?,
            None => Shell::detect(),
        };
        let runner = Arc::new(ShellRunner::with_default_shell(shell));
        let cache = Arc::new(ActionCache::with_cache_dir(&config.action_cache_dir));
        let resolver = Arc::new(
            ActionResolver::new(workspace.clone(), cache).with_max_depth(config.max_action_depth),
        );

        let mut executor = StepExecutor::new(runner, resolver);
        if let Some(tx) = &progress {
            executor = executor.with_progress(tx.clone());
        }

        let base_env = if config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };

        let mut coordinator = Self::new(workflow, Arc::new(executor))
            .with_concurrency(Arc::new(ConcurrencyManager::new(config.queue_policy)))
            .with_workspace(workspace)
            .with_base_env(base_env);
        if let Some(tx) = progress {
            coordinator = coordinator.with_progress(tx);
        }
        Ok(coordinator)
    }

    /// Share a concurrency manager with other coordinators
    pub fn with_concurrency(mut self, concurrency: Arc<ConcurrencyManager>) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Lowest env layer of every step
    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    /// Request cancellation of a run in flight. Returns false for unknown runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match lock(&self.runs).get(&run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn run_context(&self, run_id: Uuid, event: Event) -> RunContext {
        RunContext::new(run_id, self.workflow.clone(), event, self.workspace.clone())
            .with_base_env(self.base_env.clone())
    }

    fn expand(&self) -> Vec<JobMatrix> {
        let mut next_index = 0;
        self.workflow
            .jobs
            .iter()
            .map(|job| {
                let matrix = MatrixExpander::expand(job, next_index);
                next_index += matrix.instances.len();
                matrix
            })
            .collect()
    }

    /// Describe the run `event` would start
    pub fn plan(&self, event: &Event) -> EngineResult<RunPlan> {
        let accepted = TriggerEvaluator::accepts(event, &self.workflow.triggers)?;
        let run = self.run_context(Uuid::new_v4(), event.clone());

        let (concurrency_key, cancel_in_progress) = match &self.workflow.concurrency {
            Some(policy) => (
                Some(render_key(&policy.key_template, &run)?),
                policy.cancel_in_progress,
            ),
            None => (None, false),
        };

        let jobs = self
            .expand()
            .into_iter()
            .flat_map(|matrix| {
                let name = self
                    .workflow
                    .job(&matrix.job_id)
                    .map(|j| j.name.clone())
                    .unwrap_or_default();
                let (fail_fast, max_parallel) = (matrix.fail_fast, matrix.max_parallel);
                matrix.instances.into_iter().map(move |instance| PlannedJob {
                    name: instance.display_name(&name),
                    job_id: instance.job_id,
                    index: instance.index,
                    matrix: instance.matrix,
                    fail_fast,
                    max_parallel,
                })
            })
            .collect();

        Ok(RunPlan {
            workflow: self.workflow.name.clone(),
            accepted,
            concurrency_key,
            cancel_in_progress,
            jobs,
        })
    }

    /// Handle an incoming event.
    ///
    /// Returns `None` when the workflow does not react to the event. Only
    /// configuration problems are errors; job and step failures are part of
    /// the returned outcome.
    pub async fn handle(&self, event: Event) -> EngineResult<Option<RunOutcome>> {
        if !TriggerEvaluator::accepts(&event, &self.workflow.triggers)? {
            debug!(workflow = %self.workflow.name, event = %event.kind, "event not accepted");
            return Ok(None);
        }

        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let run = Arc::new(self.run_context(run_id, event));

        let key = match &self.workflow.concurrency {
            Some(policy) => Some((render_key(&policy.key_template, &run)?, policy.cancel_in_progress)),
            None => None,
        };

        let (handle, token) = cancel_pair();
        lock(&self.runs).insert(run_id, handle.clone());
        let _guard = RunGuard {
            coordinator: self,
            run_id,
            key: key.as_ref().map(|(k, _)| k.clone()),
            handle: handle.clone(),
        };

        let span = info_span!("run", %run_id, workflow = %self.workflow.name);
        let outcome = self
            .execute(run, key, handle, token, start)
            .instrument(span)
            .await;

        Ok(Some(outcome))
    }

    async fn execute(
        &self,
        run: Arc<RunContext>,
        key: Option<(String, bool)>,
        handle: CancelHandle,
        token: CancelToken,
        start: Instant,
    ) -> RunOutcome {
        let run_id = run.run_id;
        let matrices = self.expand();

        if let Some((key, cancel_in_progress)) = &key {
            match self.admit(run_id, key, *cancel_in_progress, handle, token.clone()).await {
                Ok(()) => {}
                Err(superseded_by) => {
                    // A promotion racing with cancellation may have made this run active
                    self.concurrency.release(key, run_id);
                    info!(key = %key, ?superseded_by, "run cancelled before it started");
                    return self.finish(
                        run_id,
                        Some(key.clone()),
                        RunStatus::Cancelled,
                        cancelled_jobs(&self.workflow, &matrices),
                        start.elapsed(),
                    );
                }
            }
        }

        let total_jobs = matrices.iter().map(|m| m.instances.len()).sum();
        self.event_tx.send_event(ExecutionEvent::RunStarted {
            run_id,
            workflow: self.workflow.name.clone(),
            concurrency_key: key.as_ref().map(|(k, _)| k.clone()),
            total_jobs,
        });
        info!(key = ?key.as_ref().map(|(k, _)| k), jobs = total_jobs, "run started");

        let (jobs, statuses) = self.dispatch(run, &matrices, total_jobs, token).await;
        let status = RunStatus::aggregate(statuses);

        if let Some((key, _)) = &key {
            self.concurrency.release(key, run_id);
        }

        self.finish(run_id, key.map(|(k, _)| k), status, jobs, start.elapsed())
    }

    /// Wait for admission. `Err` carries the run that superseded this one.
    async fn admit(
        &self,
        run_id: Uuid,
        key: &str,
        cancel_in_progress: bool,
        handle: CancelHandle,
        mut token: CancelToken,
    ) -> Result<(), Option<Uuid>> {
        match self.concurrency.admit(key, run_id, cancel_in_progress, handle) {
            AdmissionDecision::Start => Ok(()),
            AdmissionDecision::CancelAndStart(previous) => {
                self.event_tx.send_event(ExecutionEvent::RunCancelled {
                    run_id: previous,
                    concurrency_key: key.to_string(),
                    superseded_by: run_id,
                });
                Ok(())
            }
            AdmissionDecision::Queue(queued) => {
                self.event_tx.send_event(ExecutionEvent::RunQueued {
                    run_id,
                    workflow: self.workflow.name.clone(),
                    concurrency_key: key.to_string(),
                });
                tokio::select! {
                    promotion = queued.promoted() => match promotion {
                        Promotion::Start => {
                            info!(key, "run promoted from queue");
                            Ok(())
                        }
                        Promotion::Superseded(by) => Err(Some(by)),
                    },
                    _ = token.cancelled() => {
                        // Dropping the waiter removes this run from the queue
                        Err(None)
                    }
                }
            }
        }
    }

    /// Run every instance on its own task and collect the results in index order
    async fn dispatch(
        &self,
        run: Arc<RunContext>,
        matrices: &[JobMatrix],
        total_jobs: usize,
        run_token: CancelToken,
    ) -> (Vec<JobResult>, Vec<JobStatus>) {
        let state = Arc::new(Mutex::new(RunState::new(total_jobs)));
        let mut tasks = JoinSet::new();
        let mut matrix_handles = Vec::with_capacity(matrices.len());

        for matrix in matrices {
            let (matrix_handle, matrix_token) = cancel_pair();
            matrix_handles.push(matrix_handle.clone());
            let limit = matrix.max_parallel.map(|n| Arc::new(Semaphore::new(n)));

            for instance in &matrix.instances {
                let task = InstanceTask {
                    run: run.clone(),
                    workflow: self.workflow.clone(),
                    executor: self.executor.clone(),
                    state: state.clone(),
                    instance: instance.clone(),
                    fail_fast: matrix.fail_fast,
                    matrix_handle: matrix_handle.clone(),
                    limit: limit.clone(),
                };
                let span = info_span!("job", job = %instance.job_id, index = instance.index);
                tasks.spawn(task.run(matrix_token.clone()).instrument(span));
            }
        }

        // Forward run cancellation to every matrix
        let forward = {
            let mut run_token = run_token;
            tokio::spawn(async move {
                run_token.cancelled().await;
                for handle in matrix_handles {
                    handle.cancel();
                }
            })
        };

        let mut results: Vec<JobResult> = Vec::with_capacity(total_jobs);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "job task ended abnormally"),
            }
        }
        forward.abort();

        // Instances whose task died still need a result
        for matrix in matrices {
            for instance in &matrix.instances {
                if !results.iter().any(|r| r.index == instance.index) {
                    lock(&state).abandon(instance.index);
                    let job_name = self
                        .workflow
                        .job(&instance.job_id)
                        .map(|j| j.name.as_str())
                        .unwrap_or(&instance.job_id);
                    results.push(JobResult {
                        job_id: instance.job_id.clone(),
                        name: instance.display_name(job_name),
                        index: instance.index,
                        matrix: instance.matrix.clone(),
                        status: JobStatus::Failed,
                        steps: Vec::new(),
                        error: Some("job task ended abnormally".to_string()),
                        duration: Duration::ZERO,
                    });
                }
            }
        }

        results.sort_by_key(|r| r.index);
        let statuses = lock(&state).statuses.clone();
        (results, statuses)
    }

    fn finish(
        &self,
        run_id: Uuid,
        concurrency_key: Option<String>,
        status: RunStatus,
        jobs: Vec<JobResult>,
        duration: Duration,
    ) -> RunOutcome {
        self.event_tx.send_event(ExecutionEvent::RunCompleted {
            run_id,
            workflow: self.workflow.name.clone(),
            status,
            duration,
        });
        info!(%status, duration_ms = duration.as_millis() as u64, "run finished");

        RunOutcome {
            run_id,
            workflow: self.workflow.name.clone(),
            concurrency_key,
            status,
            jobs,
            duration,
        }
    }
}

/// One job instance scheduled on its own task
struct InstanceTask {
    run: Arc<RunContext>,
    workflow: Arc<WorkflowDefinition>,
    executor: Arc<StepExecutor>,
    state: Arc<Mutex<RunState>>,
    instance: JobInstance,
    fail_fast: bool,
    matrix_handle: CancelHandle,
    limit: Option<Arc<Semaphore>>,
}

impl InstanceTask {
    async fn run(self, mut cancel: CancelToken) -> JobResult {
        let Some(job) = self.workflow.job(&self.instance.job_id) else {
            return JobResult {
                job_id: self.instance.job_id.clone(),
                name: self.instance.job_id.clone(),
                index: self.instance.index,
                matrix: self.instance.matrix.clone(),
                status: JobStatus::Failed,
                steps: Vec::new(),
                error: Some(format!("unknown job '{}'", self.instance.job_id)),
                duration: Duration::ZERO,
            };
        };

        // Hold a max-parallel slot for the whole instance
        let _permit = match &self.limit {
            Some(limit) => tokio::select! {
                permit = limit.clone().acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            },
            None => None,
        };

        let next = if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Running
        };
        lock(&self.state).transition(self.instance.index, next);

        let result = self
            .executor
            .run(self.run.clone(), job, &self.instance, cancel)
            .await;

        lock(&self.state).transition(self.instance.index, result.status);

        if result.status == JobStatus::Failed && self.fail_fast {
            if !self.matrix_handle.is_cancelled() {
                info!(job = %result.name, "fail-fast: cancelling remaining instances");
            }
            self.matrix_handle.cancel();
        }

        result
    }
}

/// Results for a run that never started
fn cancelled_jobs(workflow: &WorkflowDefinition, matrices: &[JobMatrix]) -> Vec<JobResult> {
    matrices
        .iter()
        .flat_map(|matrix| matrix.instances.iter())
        .map(|instance| {
            let job = workflow.job(&instance.job_id);
            let name = job.map(|j| j.name.as_str()).unwrap_or(&instance.job_id);
            JobResult {
                job_id: instance.job_id.clone(),
                name: instance.display_name(name),
                index: instance.index,
                matrix: instance.matrix.clone(),
                status: JobStatus::Cancelled,
                steps: job
                    .map(|j| {
                        j.steps
                            .iter()
                            .map(|s| StepResult::new(&s.name, s.id.clone(), StepStatus::Cancelled))
                            .collect()
                    })
                    .unwrap_or_default(),
                error: None,
                duration: Duration::ZERO,
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::concurrency::QueuePolicy;
    use crate::runners::scripted::{Response, ScriptedRunner};
    use crate::workflow::WorkflowParser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        workspace: tempfile::TempDir,
        cache: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                workspace: tempfile::tempdir().unwrap(),
                cache: tempfile::tempdir().unwrap(),
            }
        }

        fn coordinator(&self, yaml: &str, runner: Arc<ScriptedRunner>) -> RunCoordinator {
            let workflow = WorkflowParser::load(yaml).unwrap();
            let resolver = ActionResolver::new(
                self.workspace.path(),
                Arc::new(ActionCache::with_cache_dir(self.cache.path())),
            );
            let executor = StepExecutor::new(runner, Arc::new(resolver));
            RunCoordinator::new(Arc::new(workflow), Arc::new(executor))
                .with_workspace(self.workspace.path())
        }
    }

    fn pr_event(subtype: &str) -> Event {
        Event::new("pull_request", "refs/pull/123/merge")
            .with_subtype(subtype)
            .with_head_ref("feature")
            .with_base_ref("main")
    }

    const CI: &str = r#"
name: CI
on:
  pull_request:
    types: [opened, reopened, synchronize]
concurrency:
  group: ${{ github.workflow }}-${{ github.head_ref }}
  cancel-in-progress: true
env:
  CARGO_TERM_COLOR: always
jobs:
  build:
    name: Build
    strategy:
      matrix:
        os: [ubuntu-22.04]
        target: [x86_64-unknown-linux-gnu]
    steps:
      - uses: actions/checkout@v4
      - name: Build
        run: cargo build --target ${{ matrix.target }}
      - name: Test
        run: cargo test
"#;

    #[tokio::test]
    async fn test_rejected_event() {
        let fx = Fixture::new();
        let runner = Arc::new(ScriptedRunner::new());
        let coordinator = fx.coordinator(CI, runner.clone());

        let outcome = coordinator.handle(pr_event("closed")).await.unwrap();
        assert!(outcome.is_none());
        assert!(runner.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_single_instance_run() {
        let fx = Fixture::new();
        let runner = Arc::new(ScriptedRunner::new());
        let coordinator = fx.coordinator(CI, runner.clone());

        let outcome = coordinator
            .handle(pr_event("synchronize"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.concurrency_key.as_deref(), Some("CI-feature"));
        assert_eq!(outcome.jobs.len(), 1);
        let job = &outcome.jobs[0];
        assert_eq!(job.name, "Build (ubuntu-22.04, x86_64-unknown-linux-gnu)");
        assert_eq!(job.steps.len(), 3);
        assert_eq!(
            runner.scripts(),
            vec!["cargo build --target x86_64-unknown-linux-gnu", "cargo test"]
        );
        assert_eq!(coordinator.concurrency().active_run("CI-feature"), None);
    }

    #[tokio::test]
    async fn test_plan() {
        let fx = Fixture::new();
        let yaml = r#"
name: Matrix
on: push
jobs:
  test:
    strategy:
      matrix:
        os: [linux, mac]
        node: [18, 20]
    steps:
      - run: npm test
  lint:
    steps:
      - run: npm run lint
"#;
        let coordinator = fx.coordinator(yaml, Arc::new(ScriptedRunner::new()));
        let plan = coordinator.plan(&Event::new("push", "main")).unwrap();

        assert!(plan.accepted);
        assert!(plan.concurrency_key.is_none());
        let names: Vec<_> = plan.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["test (linux, 18)", "test (linux, 20)", "test (mac, 18)", "test (mac, 20)", "lint"]
        );
        assert_eq!(plan.jobs[4].index, 4);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings() {
        let fx = Fixture::new();
        let yaml = r#"
name: FailFast
on: push
jobs:
  test:
    strategy:
      matrix:
        shard: [a, b, c]
    steps:
      - run: run-shard ${{ matrix.shard }}
"#;
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("run-shard a", Response::exit(1).with_delay(Duration::from_millis(20)))
                .on("run-shard", Response::hang()),
        );
        let coordinator = fx.coordinator(yaml, runner);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.handle(Event::new("push", "main")),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let statuses: Vec<_> = outcome.jobs.iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Failed, JobStatus::Cancelled, JobStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn test_without_fail_fast_all_complete() {
        let fx = Fixture::new();
        let yaml = r#"
name: NoFailFast
on: push
jobs:
  test:
    strategy:
      fail-fast: false
      matrix:
        shard: [a, b, c]
    steps:
      - run: run-shard ${{ matrix.shard }}
"#;
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("run-shard a", Response::exit(1))
                .on("run-shard", Response::exit(0).with_delay(Duration::from_millis(30))),
        );
        let coordinator = fx.coordinator(yaml, runner.clone());

        let outcome = coordinator
            .handle(Event::new("push", "main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let statuses: Vec<_> = outcome.jobs.iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Failed, JobStatus::Succeeded, JobStatus::Succeeded]
        );
        assert_eq!(runner.scripts().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_in_progress_preempts_previous_run() {
        let fx = Fixture::new();
        let yaml = r#"
name: wf
on: push
concurrency:
  group: ${workflow}-123
  cancel-in-progress: true
jobs:
  test:
    strategy:
      matrix:
        shard: [a, b]
    steps:
      - run: long ${{ matrix.shard }}
"#;
        let first_runner = Arc::new(ScriptedRunner::new().on("long", Response::hang()));
        let first = Arc::new(fx.coordinator(yaml, first_runner.clone()));
        let second = fx
            .coordinator(yaml, Arc::new(ScriptedRunner::new()))
            .with_concurrency(first.concurrency().clone());

        let first_run = {
            let first = first.clone();
            tokio::spawn(async move { first.handle(Event::new("push", "main")).await })
        };
        while first_runner.scripts().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second_outcome = second
            .handle(Event::new("push", "main"))
            .await
            .unwrap()
            .unwrap();
        let first_outcome = tokio::time::timeout(Duration::from_secs(5), first_run)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(first_outcome.status, RunStatus::Cancelled);
        assert!(first_outcome
            .jobs
            .iter()
            .all(|j| j.status == JobStatus::Cancelled));
        assert_eq!(second_outcome.status, RunStatus::Succeeded);
        assert_eq!(second_outcome.concurrency_key.as_deref(), Some("wf-123"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_run_waits_for_active_run() {
        let fx = Fixture::new();
        let yaml = r#"
name: deploy
on: push
concurrency: production
jobs:
  deploy:
    steps:
      - run: deploy
"#;
        let runner = Arc::new(
            ScriptedRunner::new().on("deploy", Response::exit(0).with_delay(Duration::from_millis(100))),
        );
        let coordinator = Arc::new(fx.coordinator(yaml, runner.clone()));
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let queued = Arc::new(
            fx.coordinator(yaml, runner.clone())
                .with_concurrency(coordinator.concurrency().clone())
                .with_progress(tx),
        );

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.handle(Event::new("push", "main")).await })
        };
        while runner.scripts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = queued.handle(Event::new("push", "main")).await.unwrap().unwrap();
        let first = first.await.unwrap().unwrap().unwrap();

        assert_eq!(first.status, RunStatus::Succeeded);
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_eq!(runner.scripts().len(), 2);

        let mut saw_queued = false;
        while let Ok(event) = rx.try_recv() {
            saw_queued |= matches!(event, ExecutionEvent::RunQueued { .. });
        }
        assert!(saw_queued);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_superseded_queued_run_is_cancelled() {
        let fx = Fixture::new();
        let yaml = r#"
name: deploy
on: push
concurrency: production
jobs:
  deploy:
    steps:
      - run: deploy
"#;
        let runner = Arc::new(
            ScriptedRunner::new().on("deploy", Response::exit(0).with_delay(Duration::from_millis(200))),
        );
        let manager = Arc::new(ConcurrencyManager::new(QueuePolicy::SupersedePending));
        let coordinator = Arc::new(
            fx.coordinator(yaml, runner.clone())
                .with_concurrency(manager.clone()),
        );

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle(Event::new("push", "main")).await })
        };
        while runner.scripts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle(Event::new("push", "main")).await })
        };
        while manager.queued("production") < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let third = coordinator.handle(Event::new("push", "main")).await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap().unwrap();
        let first = first.await.unwrap().unwrap().unwrap();

        assert_eq!(first.status, RunStatus::Succeeded);
        assert_eq!(second.status, RunStatus::Cancelled);
        assert_eq!(second.jobs[0].status, JobStatus::Cancelled);
        assert_eq!(third.status, RunStatus::Succeeded);
        assert_eq!(runner.scripts().len(), 2);
    }

    struct CountingRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::runners::CommandRunner for CountingRunner {
        async fn run(
            &self,
            _request: crate::runners::CommandRequest,
            _cancel: CancelToken,
        ) -> crate::runners::CommandOutput {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            crate::runners::CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_parallel() {
        let fx = Fixture::new();
        let yaml = r#"
name: limited
on: push
jobs:
  test:
    strategy:
      max-parallel: 2
      matrix:
        n: [1, 2, 3, 4, 5, 6]
    steps:
      - run: work
"#;
        let runner = Arc::new(CountingRunner {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let workflow = WorkflowParser::load(yaml).unwrap();
        let resolver = ActionResolver::new(
            fx.workspace.path(),
            Arc::new(ActionCache::with_cache_dir(fx.cache.path())),
        );
        let executor = StepExecutor::new(runner.clone(), Arc::new(resolver));
        let coordinator = RunCoordinator::new(Arc::new(workflow), Arc::new(executor));

        let outcome = coordinator
            .handle(Event::new("push", "main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.jobs.len(), 6);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let fx = Fixture::new();
        let yaml = "name: c\non: push\njobs:\n  j:\n    steps:\n      - run: hang\n";
        let runner = Arc::new(ScriptedRunner::new().on("hang", Response::hang()));
        let coordinator = Arc::new(fx.coordinator(yaml, runner.clone()));

        let task = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle(Event::new("push", "main")).await })
        };
        while runner.scripts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let run_id = *lock(&coordinator.runs).keys().next().unwrap();
        assert!(coordinator.cancel(run_id));

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(!coordinator.cancel(run_id));
    }

    #[tokio::test]
    async fn test_dropped_run_releases_group() {
        let fx = Fixture::new();
        let yaml = r#"
name: deploy
on: push
concurrency: prod
jobs:
  deploy:
    steps:
      - run: deploy --wait
"#;
        let runner = Arc::new(ScriptedRunner::new().on("deploy", Response::hang()));
        let coordinator = fx.coordinator(yaml, runner.clone());

        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.handle(Event::new("push", "main")),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(runner.scripts().len(), 1);
        assert_eq!(coordinator.concurrency().active_run("prod"), None);
        assert!(lock(&coordinator.runs).is_empty());
    }

    /// Finishes its command even when cancellation arrives mid-step
    struct StubbornRunner {
        started: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::runners::CommandRunner for StubbornRunner {
        async fn run(
            &self,
            _request: crate::runners::CommandRequest,
            _cancel: CancelToken,
        ) -> crate::runners::CommandOutput {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            crate::runners::CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_after_jobs_succeeded_keeps_success() {
        let fx = Fixture::new();
        let yaml = "name: late\non: push\njobs:\n  j:\n    steps:\n      - run: finish\n";
        let runner = Arc::new(StubbornRunner {
            started: AtomicUsize::new(0),
        });
        let workflow = WorkflowParser::load(yaml).unwrap();
        let resolver = ActionResolver::new(
            fx.workspace.path(),
            Arc::new(ActionCache::with_cache_dir(fx.cache.path())),
        );
        let executor = StepExecutor::new(runner.clone(), Arc::new(resolver));
        let coordinator = Arc::new(RunCoordinator::new(Arc::new(workflow), Arc::new(executor)));

        let task = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.handle(Event::new("push", "main")).await })
        };
        while runner.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let run_id = *lock(&coordinator.runs).keys().next().unwrap();
        assert!(coordinator.cancel(run_id));

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(outcome.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_continue_on_error_run_succeeds() {
        let fx = Fixture::new();
        let yaml = r#"
name: lenient
on: push
jobs:
  check:
    steps:
      - name: Lint
        run: cargo clippy
        continue-on-error: true
      - name: Test
        run: cargo test
"#;
        let runner = Arc::new(ScriptedRunner::new().on("clippy", Response::exit(1)));
        let coordinator = fx.coordinator(yaml, runner);

        let outcome = coordinator
            .handle(Event::new("push", "main"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.jobs[0].status, JobStatus::Succeeded);
        assert_eq!(outcome.jobs[0].steps[0].status, StepStatus::Failed);

        let json: serde_json::Value = serde_json::from_str(&outcome.to_json().unwrap()).unwrap();
        assert_eq!(json["jobs"][0]["steps"][0]["status"], "failed");
        assert_eq!(json["jobs"][0]["steps"][0]["continued_on_error"], true);
    }
}
