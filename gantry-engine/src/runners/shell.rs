// Shell Runner
// Executes `run:` steps through bash, sh, pwsh or python

use crate::execution::cancel::CancelToken;
use crate::runners::{CommandOutput, CommandRequest, CommandRunner};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// POSIX sh with `-e`
    Sh,
    /// Bash with `-eo pipefail`
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (Windows only, falls back to pwsh)
    PowerShell,
    /// Python 3
    Python,
}

impl Shell {
    /// Resolve a `shell:` value
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sh" => Some(Shell::Sh),
            "bash" => Some(Shell::Bash),
            "pwsh" => Some(Shell::Pwsh),
            "powershell" => Some(Shell::PowerShell),
            "python" => Some(Shell::Python),
            _ => None,
        }
    }

    /// Bash when it is on PATH, otherwise sh
    pub fn detect() -> Self {
        if which::which("bash").is_ok() {
            Shell::Bash
        } else {
            Shell::Sh
        }
    }

    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Sh => ("sh", &["-e", "-c"]),
            Shell::Bash => ("bash", &["--noprofile", "--norc", "-eo", "pipefail", "-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    // Fall back to pwsh on non-Windows
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
            Shell::Python => ("python3", &["-c"]),
        }
    }
}

/// Shell runner for executing scripts
pub struct ShellRunner {
    /// Shell used when a step names none
    default_shell: Shell,
    /// Directory for per-step output and env files
    temp_dir: PathBuf,
}

impl ShellRunner {
    /// Create a new shell runner with a detected default shell
    pub fn new() -> Self {
        Self::with_default_shell(Shell::detect())
    }

    /// Create a shell runner with a specific default shell
    pub fn with_default_shell(shell: Shell) -> Self {
        Self {
            default_shell: shell,
            temp_dir: std::env::temp_dir().join("gantry"),
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn default_shell(&self) -> Shell {
        self.default_shell
    }

    fn shell_for(&self, name: Option<&str>) -> Result<Shell, String> {
        match name {
            None => Ok(self.default_shell),
            Some(name) => Shell::from_name(name).ok_or_else(|| format!("unsupported shell '{}'", name)),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: CommandRequest, mut cancel: CancelToken) -> CommandOutput {
        let shell = match self.shell_for(request.shell.as_deref()) {
            Ok(shell) => shell,
            Err(message) => return CommandOutput::error(message),
        };
        let (shell_cmd, shell_args) = shell.get_command();

        if let Err(e) = fs::create_dir_all(&self.temp_dir) {
            return CommandOutput::error(format!(
                "failed to create {}: {}",
                self.temp_dir.display(),
                e
            ));
        }
        let files = match StepFiles::create(&self.temp_dir) {
            Ok(files) => files,
            Err(e) => return CommandOutput::error(format!("failed to create step files: {}", e)),
        };

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&request.script);
        cmd.current_dir(&request.working_dir);
        cmd.env_clear();
        cmd.envs(&request.env);
        cmd.env("GITHUB_OUTPUT", &files.output);
        cmd.env("GITHUB_ENV", &files.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so cancellation reaches everything the step started
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(shell = shell_cmd, dir = %request.working_dir.display(), "spawning step process");

        // Spawn the process
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                files.remove();
                return CommandOutput::error(format!(
                    "Failed to spawn shell process '{}': {}",
                    shell_cmd, e
                ));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            files.remove();
            return CommandOutput::error("failed to capture process output");
        };

        let pid = child.id();
        let on_stdout = request.on_output.clone();
        let on_stderr = request.on_output.clone();

        // Read output streams concurrently
        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut output = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(callback) = &on_stdout {
                    callback(&line, false);
                }
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
            }
            output
        });

        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut output = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(callback) = &on_stderr {
                    callback(&line, true);
                }
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&line);
            }
            output
        });

        let mut cancelled = false;
        let exit_code = tokio::select! {
            status = child.wait() => status.ok().and_then(|s| s.code()),
            _ = cancel.cancelled() => {
                cancelled = true;
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to kill cancelled step process");
                }
                None
            }
        };

        let (stdout, stderr) = if cancelled {
            (
                collect_after_cancel(stdout_handle).await,
                collect_after_cancel(stderr_handle).await,
            )
        } else {
            (
                stdout_handle.await.unwrap_or_default(),
                stderr_handle.await.unwrap_or_default(),
            )
        };

        let mut outputs = parse_set_output_commands(&stdout);
        outputs.extend(parse_file_commands(&read_or_empty(&files.output)));
        let env = parse_file_commands(&read_or_empty(&files.env));
        files.remove();

        CommandOutput {
            stdout,
            stderr,
            exit_code,
            outputs,
            env,
            cancelled,
            error: None,
        }
    }
}

/// How long output readers may drain after a cancelled step is killed
const CANCEL_GRACE: Duration = Duration::from_millis(500);

#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pid))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, error = %e, "failed to kill step process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

/// Output read so far; a reader still blocked on a pipe held open by a
/// surviving descendant is abandoned
async fn collect_after_cancel(reader: JoinHandle<String>) -> String {
    let abort = reader.abort_handle();
    match tokio::time::timeout(CANCEL_GRACE, reader).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Per-step `GITHUB_OUTPUT` and `GITHUB_ENV` files
struct StepFiles {
    output: PathBuf,
    env: PathBuf,
}

impl StepFiles {
    fn create(dir: &Path) -> std::io::Result<Self> {
        let id = Uuid::new_v4();
        let files = Self {
            output: dir.join(format!("output-{}", id)),
            env: dir.join(format!("env-{}", id)),
        };
        fs::write(&files.output, "")?;
        fs::write(&files.env, "")?;
        Ok(files)
    }

    fn remove(&self) {
        let _ = fs::remove_file(&self.output);
        let _ = fs::remove_file(&self.env);
    }
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Parse `GITHUB_OUTPUT`/`GITHUB_ENV` content.
///
/// Supports `name=value` lines and multi-line values:
/// ```text
/// name<<EOF
/// line one
/// line two
/// EOF
/// ```
pub fn parse_file_commands(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some((name, delimiter)) = line.split_once("<<") {
            let delimiter = delimiter.trim();
            let mut value_lines = Vec::new();
            for next in lines.by_ref() {
                if next == delimiter {
                    break;
                }
                value_lines.push(next);
            }
            values.insert(name.trim().to_string(), value_lines.join("\n"));
        } else if let Some((name, value)) = line.split_once('=') {
            values.insert(name.trim().to_string(), value.to_string());
        }
    }

    values
}

/// Parse legacy `::set-output name=<name>::<value>` workflow commands from stdout
fn parse_set_output_commands(output: &str) -> HashMap<String, String> {
    let mut outputs = HashMap::new();

    for line in output.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("::set-output ") {
            if let Some((props, value)) = rest.split_once("::") {
                if let Some(name) = props.trim().strip_prefix("name=") {
                    outputs.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    outputs
}
