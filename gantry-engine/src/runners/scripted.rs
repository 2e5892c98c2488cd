// Scripted Runner
// In-memory command runner with canned responses for engine tests

use crate::execution::cancel::CancelToken;
use crate::runners::{CommandOutput, CommandRequest, CommandRunner};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub exit_code: i32,
    pub stdout: String,
    pub outputs: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub delay: Option<Duration>,
    /// Block until cancelled
    pub hang: bool,
}

impl Response {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, key: &str, value: &str) -> Self {
        self.outputs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Responds to scripts containing a rule's pattern; anything else exits 0
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, Response)>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, pattern: &str, response: Response) -> Self {
        self.rules.push((pattern.to_string(), response));
        self
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.script).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, request: CommandRequest, mut cancel: CancelToken) -> CommandOutput {
        let response = self
            .rules
            .iter()
            .find(|(pattern, _)| request.script.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_default();
        let on_output = request.on_output.clone();
        self.requests.lock().unwrap().push(request);

        if response.hang {
            cancel.cancelled().await;
            return CommandOutput {
                cancelled: true,
                ..Default::default()
            };
        }

        if let Some(delay) = response.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return CommandOutput {
                        cancelled: true,
                        ..Default::default()
                    };
                }
            }
        }

        if let Some(callback) = on_output {
            for line in response.stdout.lines() {
                callback(line, false);
            }
        }

        CommandOutput {
            stdout: response.stdout,
            stderr: String::new(),
            exit_code: Some(response.exit_code),
            outputs: response.outputs,
            env: response.env,
            cancelled: false,
            error: None,
        }
    }
}
