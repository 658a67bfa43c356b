use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::Terminal;
use serde_json::json;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

pub type EnvMap = BTreeMap<String, String>;

pub const UNSTABLE_MARKER: &str = "unstable-fail...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnstableOutcome {
    Passed,
    /// The test failed but failures of unstable tests are not fatal; the
    /// message is what the failure said.
    SoftFailed(String),
}

/// Failures are fatal when `var` is present in the environment, whatever its
/// value.
pub fn unstable_failures_fatal(env: &EnvMap, var: &str) -> bool {
    env.contains_key(var)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

/// Runs a test known to be flaky. Skips always propagate. Other failures,
/// panics included, propagate only when `fatal`; otherwise the marker is
/// written to stderr and the run counts as soft-failed.
pub fn run_unstable(
    fatal: bool,
    terminal: &dyn Terminal,
    body: impl FnOnce() -> Result<(), HarnessError>,
) -> Result<UnstableOutcome, HarnessError> {
    let message = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => return Ok(UnstableOutcome::Passed),
        Ok(Err(error)) if error.is_skip() || fatal => return Err(error),
        Ok(Err(error)) => error.to_string(),
        Err(payload) if fatal => panic::resume_unwind(payload),
        Err(payload) => panic_message(payload.as_ref()),
    };
    append_run_log(
        "warn",
        "suite.unstable.soft_failure",
        json!({ "error": message }),
    );
    terminal.write_err(UNSTABLE_MARKER)?;
    Ok(UnstableOutcome::SoftFailed(message))
}
