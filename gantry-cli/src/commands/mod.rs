pub mod plan;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use gantry_engine::utils::{locate_workflow, resolve_workspace};
use gantry_engine::{EngineConfig, Event, WorkflowDefinition, WorkflowParser};

/// The event delivered to a workflow
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind (push, pull_request, workflow_dispatch, ...)
    #[arg(long, short = 'e', value_name = "KIND", default_value = "push")]
    pub event: String,

    /// Event sub-type, such as `opened` for pull_request
    #[arg(long = "type", value_name = "TYPE")]
    pub subtype: Option<String>,

    /// Git ref the event applies to
    #[arg(long = "ref", value_name = "REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Target branch of a pull request
    #[arg(long, value_name = "REF")]
    pub base_ref: Option<String>,

    /// Source branch of a pull request
    #[arg(long, value_name = "REF")]
    pub head_ref: Option<String>,

    /// Commit the event applies to
    #[arg(long, value_name = "SHA")]
    pub sha: Option<String>,

    /// User that triggered the event
    #[arg(long, value_name = "NAME", env = "USER")]
    pub actor: Option<String>,
}

impl EventArgs {
    pub fn to_event(&self) -> Event {
        let mut event = Event::new(&self.event, &self.git_ref);
        if let Some(subtype) = &self.subtype {
            event = event.with_subtype(subtype);
        }
        if let Some(base_ref) = &self.base_ref {
            event = event.with_base_ref(base_ref);
        }
        if let Some(head_ref) = &self.head_ref {
            event = event.with_head_ref(head_ref);
        }
        if let Some(sha) = &self.sha {
            event = event.with_sha(sha);
        }
        if let Some(actor) = &self.actor {
            event = event.with_actor(actor);
        }
        event
    }
}

/// Engine settings that override the config file and environment
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Queue policy for busy concurrency groups (fifo, supersede-pending)
    #[arg(long, value_name = "POLICY")]
    pub queue_policy: Option<String>,

    /// Shell for run steps that name none
    #[arg(long, value_name = "SHELL")]
    pub shell: Option<String>,

    /// Directory holding pre-fetched external actions
    #[arg(long, value_name = "DIR")]
    pub action_cache: Option<PathBuf>,

    /// Maximum composite action nesting depth
    #[arg(long, value_name = "N")]
    pub max_action_depth: Option<usize>,
}

impl EngineArgs {
    pub fn load_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load()?;
        if let Some(policy) = &self.queue_policy {
            config.queue_policy = policy.parse()?;
        }
        if let Some(shell) = &self.shell {
            config.default_shell = Some(shell.clone());
        }
        if let Some(dir) = &self.action_cache {
            config.action_cache_dir = dir.clone();
        }
        if let Some(depth) = self.max_action_depth {
            config.max_action_depth = depth;
        }
        tracing::debug!(?config, "engine configuration");
        Ok(config)
    }
}

/// Resolve the workspace and load the named workflow from it
pub fn load_workflow(
    workflow: &Path,
    workspace: Option<&Path>,
) -> Result<(PathBuf, PathBuf, WorkflowDefinition)> {
    let workspace = resolve_workspace(workspace)?;
    let path = locate_workflow(workflow, &workspace)?;
    let definition = WorkflowParser::load_file(&path)
        .map_err(|e| eyre!("{}: {}", path.display(), e))?;
    Ok((workspace, path, definition))
}
