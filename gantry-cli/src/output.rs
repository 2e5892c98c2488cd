// Output formatting helpers for CLI commands
// Progress goes to stderr so `--json` reports on stdout stay parseable

use std::time::Duration;

use gantry_engine::{JobStatus, RunStatus, StepStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Print step output, indented by nesting depth
pub fn step_output(line: &str, depth: usize) {
    eprintln!("{}        | {}", indent(depth), line);
}

/// Print step error output (indented, red)
pub fn step_error(line: &str, depth: usize) {
    eprintln!("\x1b[31m{}        | {}\x1b[0m", indent(depth), line);
}

pub fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

pub fn seconds(duration: &Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// Print a status line colored by outcome
pub fn outcome_line(ok: bool, neutral: bool, message: &str) {
    if neutral {
        eprintln!("{}", message);
    } else if ok {
        eprintln!("\x1b[32m{}\x1b[0m", message);
    } else {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }
}

pub fn step_symbol(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "OK",
        StepStatus::Failed => "FAIL",
        StepStatus::Skipped => "SKIP",
        StepStatus::Cancelled => "CANCELLED",
    }
}

pub fn job_symbol(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Cancelled => "CANCELLED",
        _ => "DONE",
    }
}

pub fn run_summary(status: RunStatus, duration: &Duration) {
    match status {
        RunStatus::Succeeded => success(&format!("Run succeeded in {}", seconds(duration))),
        RunStatus::Failed => failure(&format!("Run failed after {}", seconds(duration))),
        RunStatus::Cancelled => warning(&format!("Run cancelled after {}", seconds(duration))),
    }
}
