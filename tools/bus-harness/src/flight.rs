//! The flight record: one header per test followed by the blocks of every
//! recorder that ran around it.

use crate::config::FlightConfig;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::recorder::{
    CommandRecorder, JournalRecorder, JournalSource, RecordStore, RecordingSession,
};
use crate::runtime::ProductionRuntime;
use chrono::{DateTime, Local};
use serde_json::json;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestId {
    pub module: String,
    pub class: String,
    pub method: String,
}

impl TestId {
    pub fn new(module: &str, class: &str, method: &str) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
            method: method.to_string(),
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.module, self.class, self.method)
    }
}

impl FromStr for TestId {
    type Err = HarnessError;

    /// The module part may itself be dotted: `a.b.Class.method`.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.rsplitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(class), Some(module))
                if !method.is_empty() && !class.is_empty() && !module.is_empty() =>
            {
                Ok(Self::new(module, class, method))
            }
            _ => Err(HarnessError::Cli(format!(
                "test id `{text}` is not of the form module.class.method"
            ))),
        }
    }
}

pub fn flight_header(now: SystemTime, monotonic: Duration, test_id: &TestId) -> String {
    let wall: DateTime<Local> = now.into();
    format!(
        "================{}[{:.8}] {}================\n",
        wall.format("%Y-%m-%d %H:%M:%S"),
        monotonic.as_secs_f64(),
        test_id
    )
}

/// Journal outermost, then the monitor commands in configured order.
pub fn build_session(
    config: &FlightConfig,
    runtime: &ProductionRuntime,
    journal: Arc<dyn JournalSource>,
    store: RecordStore,
) -> RecordingSession {
    let session = RecordingSession::new(store).with_recorder(Box::new(JournalRecorder::new(
        config.journal_label.clone(),
        journal,
        Arc::clone(&runtime.clock),
    )));
    config.monitors.iter().fold(session, |session, monitor| {
        session.with_recorder(Box::new(CommandRecorder::new(
            monitor.label.clone(),
            monitor.argv.clone(),
            Arc::clone(&runtime.process_runner),
        )))
    })
}

/// Runs `body` under a full recording session and appends its flight record.
///
/// The header is written before the body starts; the recorder blocks are
/// appended afterwards whatever the outcome.
pub fn record_test<T>(
    config: &FlightConfig,
    runtime: &ProductionRuntime,
    journal: Arc<dyn JournalSource>,
    test_id: &TestId,
    body: impl FnOnce() -> Result<T, HarnessError>,
) -> Result<T, HarnessError> {
    let fs = runtime.file_system.as_ref();
    let path = &config.record_path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs.create_dir_all(parent)?;
        }
    }
    let header = flight_header(runtime.clock.now(), runtime.clock.monotonic(), test_id);
    fs.append_string(path, &header)?;
    append_run_log(
        "info",
        "flight.test.started",
        json!({ "test_id": test_id.to_string(), "record_path": path.display().to_string() }),
    );

    let store = RecordStore::new();
    let session = build_session(config, runtime, journal, store.clone());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.run(body)));
    let saved = fs.append_string(path, &store.contents());
    if let Err(error) = &saved {
        append_run_log(
            "error",
            "flight.record.write_failed",
            json!({ "test_id": test_id.to_string(), "error": error.to_string() }),
        );
    }

    let result = match outcome {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    };
    append_run_log(
        if result.is_ok() { "info" } else { "warn" },
        "flight.test.finished",
        json!({
            "test_id": test_id.to_string(),
            "passed": result.is_ok(),
            "blocks": store.blocks().len()
        }),
    );
    match (result, saved) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(error)) => Err(error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(write)) => {
            Err(error.with_cleanup_failures(vec![format!("flight record: {write}")]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HarnessConfig, MonitorCommand};
    use crate::recorder::FakeJournal;
    use crate::runtime::{FakeClock, FakeFileSystem, FakeProcessRunner, FakeTerminal};
    use std::path::{Path, PathBuf};

    fn runtime(fs: &FakeFileSystem, runner: &FakeProcessRunner) -> ProductionRuntime {
        ProductionRuntime {
            clock: Arc::new(FakeClock::default()),
            file_system: Arc::new(fs.clone()),
            process_runner: Arc::new(runner.clone()),
            terminal: Arc::new(FakeTerminal::default()),
        }
    }

    fn flight_config() -> FlightConfig {
        FlightConfig {
            record_path: PathBuf::from("/logs/flight_record.log"),
            ..HarnessConfig::default().flight
        }
    }

    #[test]
    fn test_id_parses_dotted_modules() {
        let id: TestId = "storage.lvm.LVMTestCase.test_create".parse().expect("id");
        assert_eq!(id, TestId::new("storage.lvm", "LVMTestCase", "test_create"));
        assert_eq!(id.to_string(), "storage.lvm.LVMTestCase.test_create");
        assert!("LVMTestCase.test_create".parse::<TestId>().is_err());
        assert!("a..b".parse::<TestId>().is_err());
    }

    #[test]
    fn header_shape() {
        let header = flight_header(
            SystemTime::now(),
            Duration::from_secs_f64(1234.5),
            &TestId::new("mod", "Case", "test_x"),
        );
        assert!(header.starts_with("================"));
        assert!(header.ends_with("[1234.50000000] mod.Case.test_x================\n"));
        // "================YYYY-MM-DD HH:MM:SS["
        assert_eq!(header.find('['), Some(16 + 19));
    }

    #[test]
    fn session_nests_journal_then_monitors() {
        let fs = FakeFileSystem::default();
        let runner = FakeProcessRunner::default();
        let mut config = flight_config();
        config.monitors.push(MonitorCommand {
            label: "dmesg".to_string(),
            argv: vec!["dmesg".to_string(), "-w".to_string()],
        });
        let session = build_session(
            &config,
            &runtime(&fs, &runner),
            Arc::new(FakeJournal::default()),
            RecordStore::new(),
        );
        assert_eq!(
            session.descriptions(),
            ["journal", "udisksctl monitor", "udevadm monitor", "dmesg"]
        );
    }

    #[test]
    fn record_appends_header_then_blocks_in_start_order() {
        let fs = FakeFileSystem::default();
        let runner = FakeProcessRunner::default();
        // Monitors are waited on innermost first.
        runner.push_stdout("UDEV  [1.0] change /devices/sdb\n");
        runner.push_stdout("Monitoring the udisks daemon.\n");
        let journal = FakeJournal::default();
        journal.log(Duration::from_secs(100), Some(("udisksd", 11)), "Wiped /dev/sdb");

        let value = record_test(
            &flight_config(),
            &runtime(&fs, &runner),
            Arc::new(journal),
            &TestId::new("mod", "Case", "test_wipe"),
            || Ok(42),
        )
        .expect("record");
        assert_eq!(value, 42);

        let record = fs
            .contents(Path::new("/logs/flight_record.log"))
            .expect("record file");
        let journal_at = record.find("<<<<< journal >>>>>").expect("journal block");
        let udisks_at = record.find("<<<<< udisksctl monitor >>>>>").expect("udisks block");
        let udev_at = record.find("<<<<< udevadm monitor >>>>>").expect("udev block");
        assert!(record.starts_with("================"));
        assert!(record.contains("mod.Case.test_wipe================\n<<<<< journal >>>>>\n"));
        assert!(journal_at < udisks_at && udisks_at < udev_at);
        assert!(record.contains("udisksd[11]: Wiped /dev/sdb\n"));
        assert!(record.ends_with("UDEV  [1.0] change /devices/sdb\n\n\n"));
        assert_eq!(runner.terminates(), [1, 0]);
    }

    #[test]
    fn failing_test_still_gets_its_record() {
        let fs = FakeFileSystem::default();
        let runner = FakeProcessRunner::default();
        runner.push_stdout("");
        runner.push_stdout("");
        let err = record_test(
            &flight_config(),
            &runtime(&fs, &runner),
            Arc::new(FakeJournal::default()),
            &TestId::new("mod", "Case", "test_fail"),
            || -> Result<(), HarnessError> { Err(HarnessError::Assertion("0 != 1".to_string())) },
        )
        .expect_err("body failure");
        assert!(matches!(err, HarnessError::Assertion(_)));
        let record = fs
            .contents(Path::new("/logs/flight_record.log"))
            .expect("record file");
        assert!(record.contains("<<<<< journal >>>>>\n\n\n\n"));
        assert!(record.contains("<<<<< udevadm monitor >>>>>\n\n\n"));
    }
}
