use crate::commands::{load_workflow, EngineArgs, EventArgs};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use gantry_engine::RunCoordinator;

/// Show what a run for an event would look like without executing it
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Workflow file, or a workflow name under .github/workflows
    pub workflow: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Workspace directory (default: repository root of the current directory)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Print the plan as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: PlanArgs) -> Result<bool> {
    let config = args.engine.load_config()?;
    let (workspace, _, workflow) = load_workflow(&args.workflow, args.workspace.as_deref())?;

    let coordinator = RunCoordinator::from_config(Arc::new(workflow), &config, workspace, None)?;
    let plan = coordinator.plan(&args.event.to_event())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(true);
    }

    output::header(&format!("Plan for '{}'", plan.workflow));
    if plan.accepted {
        output::check(&format!(
            "Event '{}' on {} starts a run",
            args.event.event, args.event.git_ref
        ));
    } else {
        output::warning(&format!(
            "Event '{}' on {} is ignored by this workflow",
            args.event.event, args.event.git_ref
        ));
    }

    match &plan.concurrency_key {
        Some(key) => output::info(&format!(
            "Concurrency group '{}'{}",
            key,
            if plan.cancel_in_progress {
                " (cancels in-progress runs)"
            } else {
                ""
            }
        )),
        None => output::info("No concurrency group"),
    }

    output::info(&format!("{} job instances:", plan.jobs.len()));
    for job in &plan.jobs {
        let mut detail = Vec::new();
        if !job.fail_fast {
            detail.push("no fail-fast".to_string());
        }
        if let Some(max) = job.max_parallel {
            detail.push(format!("max-parallel {}", max));
        }
        let detail = if detail.is_empty() {
            String::new()
        } else {
            format!(" [{}]", detail.join(", "))
        };
        eprintln!("    #{} {} ({}){}", job.index, job.name, job.job_id, detail);
    }

    Ok(true)
}
