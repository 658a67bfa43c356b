//! Thin wrappers over the host commands and files the suite pokes at.

use crate::config::CommandsConfig;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem, ProcessRequest, ProcessRunner};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    /// Trimmed stdout; on failure stdout and stderr joined by a blank line.
    pub output: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `command` through `sh -c`.
pub fn run_command(runner: &dyn ProcessRunner, command: &str) -> Result<CommandResult, HarnessError> {
    let out = runner.run(ProcessRequest::shell(command))?;
    let output = if out.exit_code == 0 {
        out.stdout.trim().to_string()
    } else {
        format!("{}\n\n{}", out.stdout.trim(), out.stderr.trim())
    };
    append_run_log(
        if out.exit_code == 0 { "debug" } else { "warn" },
        "command.finished",
        json!({ "command": command, "exit_code": out.exit_code }),
    );
    Ok(CommandResult {
        exit_code: out.exit_code,
        output,
    })
}

/// Retries `wipefs -a` until it succeeds; `false` once the attempts run out.
pub fn wipe_fs(
    runner: &dyn ProcessRunner,
    clock: &dyn Clock,
    config: &CommandsConfig,
    device: &str,
) -> Result<bool, HarnessError> {
    let backoff = Duration::from_millis(config.wipe_backoff_ms);
    for attempt in 1..=config.wipe_attempts {
        if run_command(runner, &format!("wipefs -a {device}"))?.success() {
            return Ok(true);
        }
        append_run_log(
            "info",
            "command.wipefs.retry",
            json!({ "device": device, "attempt": attempt }),
        );
        clock.sleep(backoff)?;
    }
    Ok(false)
}

/// Waits for the udev event queue to drain; the outcome is not checked.
pub fn udev_settle(runner: &dyn ProcessRunner) -> Result<(), HarnessError> {
    run_command(runner, "udevadm settle").map(|_| ())
}

pub fn read_file(fs: &dyn FileSystem, path: &Path) -> Result<String, HarnessError> {
    fs.read_to_string(path)
}

/// Replaces the file contents. With `ignore_nonexistent`, a missing file or
/// parent directory is not an error.
pub fn write_file(
    fs: &dyn FileSystem,
    path: &Path,
    contents: &str,
    ignore_nonexistent: bool,
) -> Result<(), HarnessError> {
    match fs.write_string(path, contents) {
        Err(HarnessError::NotFound(_)) if ignore_nonexistent => Ok(()),
        other => other,
    }
}
