use super::{block_header, RecordStore, Recorder};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessRequest, ProcessRunner};
use serde_json::json;
use std::sync::Arc;

/// Runs a monitoring command for the duration of the recording and saves
/// everything it printed, stderr included.
pub struct CommandRecorder {
    description: String,
    argv: Vec<String>,
    runner: Arc<dyn ProcessRunner>,
    handle: Option<u64>,
    terminated: bool,
}

impl CommandRecorder {
    pub fn new(
        description: impl Into<String>,
        argv: Vec<String>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            description: description.into(),
            argv,
            runner,
            handle: None,
            terminated: false,
        }
    }
}

impl Recorder for CommandRecorder {
    fn description(&self) -> &str {
        &self.description
    }

    fn start(&mut self) -> Result<(), HarnessError> {
        let mut request = ProcessRequest::from_argv(&self.argv)?;
        request.merge_stderr = true;
        let handle = self.runner.spawn(request)?;
        append_run_log(
            "debug",
            "recorder.command.started",
            json!({ "description": self.description, "argv": self.argv, "handle": handle }),
        );
        self.handle = Some(handle);
        self.terminated = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HarnessError> {
        let handle = self.handle.ok_or_else(|| {
            HarnessError::Process(format!("{} stopped before it was started", self.description))
        })?;
        if let Err(error) = self.runner.terminate(handle) {
            // Nothing will be saved; reap the monitor now.
            self.handle = None;
            let _ = self.runner.kill(handle);
            return Err(error);
        }
        self.terminated = true;
        Ok(())
    }

    fn save(&mut self, store: &RecordStore) -> Result<(), HarnessError> {
        let handle = match (self.handle, self.terminated) {
            (Some(handle), true) => handle,
            _ => {
                return Err(HarnessError::Process(format!(
                    "{} saved before it was stopped",
                    self.description
                )))
            }
        };
        self.handle = None;
        let output = self.runner.wait(handle)?;
        append_run_log(
            "debug",
            "recorder.command.saved",
            json!({
                "description": self.description,
                "exit_code": output.exit_code,
                "bytes": output.stdout.len()
            }),
        );
        store.append(format!(
            "{}{}\n\n",
            block_header(&self.description),
            output.stdout
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{wait_for_marker, FakeProcessRunner, ProductionProcessRunner};

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|word| word.to_string()).collect()
    }

    #[test]
    fn echo_output_becomes_one_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("printed");
        let script = format!("echo hello; touch '{}'; exec sleep 30", marker.display());
        let store = RecordStore::new();
        let mut recorder = CommandRecorder::new(
            "desc",
            argv(&["sh", "-c", &script]),
            Arc::new(ProductionProcessRunner::new()),
        );
        recorder.start().expect("start");
        wait_for_marker(&marker);
        recorder.stop().expect("stop");
        recorder.save(&store).expect("save");
        assert_eq!(store.contents(), "<<<<< desc >>>>>\nhello\n\n\n");
    }

    #[test]
    fn monitor_is_terminated_and_its_output_collected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("printed");
        let script = format!(
            "echo watching; echo noise 1>&2; touch '{}'; exec sleep 30",
            marker.display()
        );
        let store = RecordStore::new();
        let mut recorder = CommandRecorder::new(
            "monitor",
            argv(&["sh", "-c", &script]),
            Arc::new(ProductionProcessRunner::new()),
        );
        recorder.start().expect("start");
        wait_for_marker(&marker);
        recorder.stop().expect("stop");
        recorder.save(&store).expect("save");
        let block = store.contents();
        assert!(block.starts_with("<<<<< monitor >>>>>\n"));
        assert!(block.contains("watching\n"));
        assert!(block.contains("noise\n"));
    }

    #[test]
    fn spawns_merged_and_terminates_before_waiting() {
        let fake = FakeProcessRunner::default();
        fake.push_stdout("KERNEL[1.0] add /devices/x\n");
        let store = RecordStore::new();
        let mut recorder = CommandRecorder::new(
            "udevadm monitor",
            argv(&["udevadm", "monitor"]),
            Arc::new(fake.clone()),
        );
        recorder.start().expect("start");
        assert!(recorder.save(&store).is_err());
        recorder.stop().expect("stop");
        recorder.save(&store).expect("save");

        let spawned = fake.spawned();
        assert!(spawned[0].merge_stderr);
        assert_eq!(spawned[0].display(), "udevadm monitor");
        assert_eq!(fake.terminates(), [0]);
        assert_eq!(fake.waits(), [0]);
        assert_eq!(
            store.contents(),
            "<<<<< udevadm monitor >>>>>\nKERNEL[1.0] add /devices/x\n\n\n"
        );
    }

    #[test]
    fn empty_argv_fails_to_start() {
        let mut recorder = CommandRecorder::new(
            "nothing",
            Vec::new(),
            Arc::new(FakeProcessRunner::default()),
        );
        assert!(recorder.start().is_err());
        assert!(recorder.stop().is_err());
    }

    #[test]
    fn failed_terminate_kills_and_skips_the_save() {
        let fake = FakeProcessRunner::default();
        fake.fail_next_terminate(HarnessError::Process("EPERM".to_string()));
        let mut recorder = CommandRecorder::new(
            "udisksctl monitor",
            argv(&["udisksctl", "monitor"]),
            Arc::new(fake.clone()),
        );
        recorder.start().expect("start");
        assert!(recorder.stop().is_err());
        assert_eq!(fake.kills(), [0]);
        assert!(recorder.save(&RecordStore::new()).is_err());
        assert!(fake.waits().is_empty());
    }
}
