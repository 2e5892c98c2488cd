// Runners Module
// Process and action backends used by the step executor

pub mod shell;

#[cfg(test)]
pub(crate) mod scripted;

pub use shell::{parse_file_commands, Shell, ShellRunner};

use crate::actions::ExternalAction;
use crate::execution::cancel::CancelToken;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Receives each output line as it is produced; the flag marks stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// A command to run on behalf of a `run:` step
#[derive(Clone)]
pub struct CommandRequest {
    pub script: String,
    /// Shell named by the step; `None` uses the runner's default
    pub shell: Option<String>,
    pub working_dir: PathBuf,
    /// Complete environment of the process
    pub env: HashMap<String, String>,
    pub on_output: Option<OutputCallback>,
}

impl std::fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRequest")
            .field("script", &self.script)
            .field("shell", &self.shell)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env.len())
            .finish()
    }
}

/// Result of running a command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or never started
    pub exit_code: Option<i32>,
    /// Values written to `GITHUB_OUTPUT`
    pub outputs: HashMap<String, String>,
    /// Values written to `GITHUB_ENV`
    pub env: HashMap<String, String>,
    pub cancelled: bool,
    /// The command could not be started
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.cancelled && self.exit_code == Some(0)
    }
}

/// Trait for command runners
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command until it exits or `cancel` fires
    async fn run(&self, request: CommandRequest, cancel: CancelToken) -> CommandOutput;
}

/// Result of invoking an external action
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    pub outputs: HashMap<String, String>,
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            message: Some(message.into()),
        }
    }
}

/// Executes actions that are not run in-process
#[async_trait::async_trait]
pub trait ActionHost: Send + Sync {
    async fn invoke(
        &self,
        action: &ExternalAction,
        inputs: &HashMap<String, String>,
        env: &HashMap<String, String>,
        cancel: CancelToken,
    ) -> ActionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.succeeded());

        let cancelled = CommandOutput {
            exit_code: Some(0),
            cancelled: true,
            ..Default::default()
        };
        assert!(!cancelled.succeeded());
        assert!(!CommandOutput::error("no shell").succeeded());
    }
}
