//! Scoped flight recorders bracketing one test execution.
//!
//! Each recorder is started before the test body, stopped after it (even when
//! it fails) and then saves one text block into a shared [`RecordStore`].

pub mod command;
pub mod journal;
pub mod session;

pub use command::CommandRecorder;
pub use journal::{FakeJournal, JournalEntry, JournalRecorder, JournalSource, JournalctlSource};
pub use session::RecordingSession;

use crate::errors::HarnessError;
use std::sync::{Arc, Mutex};

/// Append-only list of saved record blocks, shared by every recorder of a
/// session.
#[derive(Debug, Default, Clone)]
pub struct RecordStore {
    blocks: Arc<Mutex<Vec<String>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, block: String) -> Result<(), HarnessError> {
        self.blocks
            .lock()
            .map_err(|_| HarnessError::Io("record store lock poisoned".to_string()))?
            .push(block);
        Ok(())
    }

    pub fn blocks(&self) -> Vec<String> {
        self.blocks
            .lock()
            .map(|blocks| blocks.clone())
            .unwrap_or_default()
    }

    /// All blocks concatenated in the order they were saved.
    pub fn contents(&self) -> String {
        self.blocks().concat()
    }
}

pub trait Recorder {
    fn description(&self) -> &str;
    fn start(&mut self) -> Result<(), HarnessError>;
    fn stop(&mut self) -> Result<(), HarnessError>;
    fn save(&mut self, store: &RecordStore) -> Result<(), HarnessError>;
}

/// Fills an optional recorder slot; records nothing.
#[derive(Debug, Clone)]
pub struct NullRecorder {
    description: String,
}

impl NullRecorder {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

impl Recorder for NullRecorder {
    fn description(&self) -> &str {
        &self.description
    }

    fn start(&mut self) -> Result<(), HarnessError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HarnessError> {
        Ok(())
    }

    fn save(&mut self, _store: &RecordStore) -> Result<(), HarnessError> {
        Ok(())
    }
}

pub(crate) fn block_header(description: &str) -> String {
    format!("<<<<< {description} >>>>>\n")
}
