use crate::commands::{load_workflow, EngineArgs, EventArgs};
use crate::output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use uuid::Uuid;

use gantry_engine::execution::{progress_channel, LogLevel, ProgressReceiver};
use gantry_engine::{
    EngineResult, ExecutionEvent, JobStatus, RunCoordinator, RunOutcome, StepStatus,
};

/// Deliver an event to a workflow and execute the resulting run
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow file, or a workflow name under .github/workflows
    pub workflow: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Workspace directory (default: repository root of the current directory)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Print the run outcome as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// Returns whether the run succeeded; an ignored event counts as success
pub async fn execute(args: RunArgs) -> Result<bool> {
    let config = args.engine.load_config()?;
    let (workspace, path, workflow) = load_workflow(&args.workflow, args.workspace.as_deref())?;

    output::status("Loaded", &format!("{}", path.display()));
    output::info(&format!(
        "Workflow '{}': {} jobs, workspace {}",
        workflow.name,
        workflow.jobs.len(),
        workspace.display()
    ));

    let (tx, rx) = progress_channel();
    let coordinator = Arc::new(RunCoordinator::from_config(
        Arc::new(workflow),
        &config,
        workspace,
        Some(tx),
    )?);

    let event = args.event.to_event();
    let handle = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.handle(event).await }
    });

    let mut renderer = Renderer::default();
    let result = renderer.drive(rx, handle, &coordinator).await?;

    let outcome = match result {
        Some(outcome) => outcome,
        None => {
            output::warning(&format!(
                "Workflow does not react to '{}' on {}",
                args.event.event, args.event.git_ref
            ));
            return Ok(true);
        }
    };

    if args.json {
        println!("{}", outcome.to_json()?);
    } else {
        print_failures(&outcome);
    }

    Ok(outcome.succeeded())
}

/// Renders progress events until the run task finishes
#[derive(Default)]
struct Renderer {
    run_id: Option<Uuid>,
    job_names: HashMap<usize, String>,
    depths: HashMap<usize, usize>,
}

impl Renderer {
    async fn drive(
        &mut self,
        mut rx: ProgressReceiver,
        mut handle: tokio::task::JoinHandle<EngineResult<Option<RunOutcome>>>,
        coordinator: &RunCoordinator,
    ) -> Result<Option<RunOutcome>> {
        let mut interrupted = false;
        let result = loop {
            tokio::select! {
                Some(event) = rx.recv() => self.render(&event),
                joined = &mut handle => break joined?,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    match self.run_id {
                        Some(run_id) if coordinator.cancel(run_id) => {
                            output::warning("Interrupt received, cancelling run");
                        }
                        _ => output::warning("Interrupt received, no run to cancel"),
                    }
                }
            }
        };

        while let Ok(event) = rx.try_recv() {
            self.render(&event);
        }
        Ok(result?)
    }

    fn job_label(&self, index: usize) -> String {
        self.job_names
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("job #{}", index))
    }

    fn render(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted {
                run_id,
                workflow,
                concurrency_key,
                total_jobs,
            } => {
                self.run_id = Some(*run_id);
                eprintln!();
                let group = concurrency_key
                    .as_deref()
                    .map(|key| format!(", group '{}'", key))
                    .unwrap_or_default();
                output::header(&format!(
                    "Run {} of '{}' ({} jobs{})",
                    run_id, workflow, total_jobs, group
                ));
            }

            ExecutionEvent::RunQueued {
                run_id,
                concurrency_key,
                ..
            } => {
                self.run_id = Some(*run_id);
                output::info(&format!(
                    "Run {} queued behind concurrency group '{}'",
                    run_id, concurrency_key
                ));
            }

            ExecutionEvent::RunCancelled {
                run_id,
                concurrency_key,
                superseded_by,
            } => {
                output::warning(&format!(
                    "Run {} in group '{}' superseded by {}",
                    run_id, concurrency_key, superseded_by
                ));
            }

            ExecutionEvent::RunCompleted {
                status, duration, ..
            } => {
                eprintln!();
                output::run_summary(*status, duration);
            }

            ExecutionEvent::JobStarted {
                display_name,
                index,
                total_steps,
                ..
            } => {
                self.job_names.insert(*index, display_name.clone());
                eprintln!("  Job '{}' ({} steps)", display_name, total_steps);
            }

            ExecutionEvent::JobCompleted {
                index,
                status,
                duration,
                ..
            } => {
                output::outcome_line(
                    *status == JobStatus::Succeeded,
                    false,
                    &format!(
                        "  Job '{}' {} ({})",
                        self.job_label(*index),
                        output::job_symbol(*status),
                        output::seconds(duration)
                    ),
                );
            }

            ExecutionEvent::StepStarted {
                job_index,
                step_name,
                depth,
                ..
            } => {
                self.depths.insert(*job_index, *depth);
                eprintln!(
                    "{}    [{}] {}",
                    output::indent(*depth),
                    self.job_label(*job_index),
                    step_name
                );
            }

            ExecutionEvent::StepOutput {
                job_index,
                output: text,
                is_error,
                ..
            } => {
                let depth = self.depths.get(job_index).copied().unwrap_or(0);
                for line in text.lines() {
                    if *is_error {
                        output::step_error(line, depth);
                    } else {
                        output::step_output(line, depth);
                    }
                }
            }

            ExecutionEvent::StepCompleted {
                step_name,
                depth,
                status,
                duration,
                exit_code,
                ..
            } => {
                let exit_info = match exit_code {
                    Some(code) if *code != 0 => format!(" (exit code: {})", code),
                    _ => String::new(),
                };
                output::outcome_line(
                    *status == StepStatus::Succeeded,
                    *status == StepStatus::Skipped,
                    &format!(
                        "{}      {} {} ({}){}",
                        output::indent(*depth),
                        step_name,
                        output::step_symbol(*status),
                        output::seconds(duration),
                        exit_info
                    ),
                );
            }

            ExecutionEvent::StepSkipped {
                step_name,
                depth,
                reason,
                ..
            } => {
                output::dim(&format!(
                    "{}      {} skipped: {}",
                    output::indent(*depth),
                    step_name,
                    reason
                ));
            }

            ExecutionEvent::Log { level, message, .. } => match level {
                LogLevel::Error => output::error(message),
                LogLevel::Warning => output::warning(message),
                LogLevel::Info => output::info(message),
                LogLevel::Debug => output::dim(message),
            },
        }
    }
}

fn print_failures(outcome: &RunOutcome) {
    for job in &outcome.jobs {
        if let Some(error) = &job.error {
            output::failure(&format!("{}: {}", job.name, error));
        }
    }
}
