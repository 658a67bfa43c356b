use super::{RecordStore, Recorder};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};

/// Recorders nested around one test body, outermost first.
pub struct RecordingSession {
    recorders: Vec<Box<dyn Recorder>>,
    store: RecordStore,
}

struct CleanupFailure {
    description: String,
    error: HarnessError,
}

impl CleanupFailure {
    fn summary(&self) -> String {
        format!("{}: {}", self.description, self.error)
    }
}

impl RecordingSession {
    pub fn new(store: RecordStore) -> Self {
        Self {
            recorders: Vec::new(),
            store,
        }
    }

    /// Adds a recorder inside the ones already added.
    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.recorders
            .iter()
            .map(|recorder| recorder.description().to_string())
            .collect()
    }

    /// Starts every recorder, runs `body`, then stops and saves the recorders
    /// innermost first on every exit path, panics included.
    ///
    /// A body failure is returned as is unless cleanup failed too, in which
    /// case it is wrapped in [`HarnessError::Cleanup`]. A panicking body keeps
    /// panicking once cleanup is done.
    pub fn run<T>(
        mut self,
        body: impl FnOnce() -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        append_run_log(
            "info",
            "session.started",
            json!({ "recorders": self.descriptions() }),
        );
        for index in 0..self.recorders.len() {
            if let Err(error) = self.recorders[index].start() {
                append_run_log(
                    "error",
                    "recorder.start.failed",
                    json!({
                        "description": self.recorders[index].description(),
                        "error": error.to_string()
                    }),
                );
                let failures = close_all(&mut self.recorders[..index], &self.store);
                return Err(with_cleanup(error, failures));
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        let failures = close_all(&mut self.recorders, &self.store);

        match outcome {
            Ok(Ok(value)) => {
                log_finished("ok", &failures);
                let mut failures = failures.into_iter();
                match failures.next() {
                    None => Ok(value),
                    Some(first) => Err(with_cleanup(first.error, failures.collect())),
                }
            }
            Ok(Err(error)) => {
                log_finished("error", &failures);
                Err(with_cleanup(error, failures))
            }
            Err(payload) => {
                log_finished("panic", &failures);
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Stops and saves `recorders` in reverse order without short-circuiting,
/// then moves their blocks into `store` in start order. A recorder that fails
/// to stop is not saved.
fn close_all(recorders: &mut [Box<dyn Recorder>], store: &RecordStore) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();
    let mut slots = vec![Vec::new(); recorders.len()];
    for (index, recorder) in recorders.iter_mut().enumerate().rev() {
        let slot = RecordStore::new();
        let result = recorder.stop().map_err(|error| ("stop", error)).and_then(|()| {
            recorder.save(&slot).map_err(|error| ("save", error))
        });
        slots[index] = slot.blocks();
        if let Err((phase, error)) = result {
            append_run_log(
                "error",
                &format!("recorder.{phase}.failed"),
                json!({
                    "description": recorder.description(),
                    "error": error.to_string()
                }),
            );
            failures.push(CleanupFailure {
                description: recorder.description().to_string(),
                error,
            });
        }
    }
    for block in slots.into_iter().flatten() {
        if let Err(error) = store.append(block) {
            failures.push(CleanupFailure {
                description: "record store".to_string(),
                error,
            });
        }
    }
    failures
}

fn with_cleanup(original: HarnessError, failures: Vec<CleanupFailure>) -> HarnessError {
    original.with_cleanup_failures(failures.iter().map(CleanupFailure::summary).collect())
}

fn log_finished(outcome: &str, failures: &[CleanupFailure]) {
    append_run_log(
        if failures.is_empty() { "info" } else { "warn" },
        "session.finished",
        json!({
            "outcome": outcome,
            "cleanup_failures": failures.iter().map(CleanupFailure::summary).collect::<Vec<_>>()
        }),
    );
}
