use crate::commands::EngineArgs;
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use gantry_engine::utils::{locate_workflow, resolve_workspace};
use gantry_engine::{ActionCache, ActionResolver, WorkflowParser};

/// Validate a workflow file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Workflow file, or a workflow name under .github/workflows
    pub workflow: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Workspace used to resolve local actions (default: repository root)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,
}

pub async fn execute(args: ValidateArgs) -> Result<bool> {
    let config = args.engine.load_config()?;
    let workspace = resolve_workspace(args.workspace.as_deref())?;
    let path = locate_workflow(&args.workflow, &workspace)?;

    output::status("Validating", &format!("{}", path.display()));

    // Step 1: Parse YAML syntax
    let raw = match WorkflowParser::from_file(&path) {
        Ok(workflow) => workflow,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            return Ok(false);
        }
    };
    output::check("YAML syntax valid");

    // Step 2: Structural validation and compilation
    if let Err(e) = WorkflowParser::validate(&raw) {
        output::error(&e.to_string());
        return Ok(false);
    }
    let workflow = match WorkflowParser::compile(raw) {
        Ok(workflow) => workflow,
        Err(e) => {
            output::error(&e.to_string());
            return Ok(false);
        }
    };

    let steps: usize = workflow.jobs.iter().map(|job| job.steps.len()).sum();
    output::check(&format!(
        "Structure: {} triggers, {} jobs, {} steps",
        workflow.triggers.rules.len(),
        workflow.jobs.len(),
        steps
    ));

    // Step 3: Action resolution
    output::status("Resolving", "actions...");
    let resolver = ActionResolver::new(
        workspace,
        Arc::new(ActionCache::with_cache_dir(&config.action_cache_dir)),
    )
    .with_max_depth(config.max_action_depth);

    if let Err(e) = resolver.preflight(&workflow).await {
        output::error(&e.to_string());
        return Ok(false);
    }
    output::check("Actions resolved");

    eprintln!();
    output::success(&format!("Workflow '{}' is valid", workflow.name));
    Ok(true)
}
