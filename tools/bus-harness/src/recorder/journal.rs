use super::{block_header, RecordStore, Recorder};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessRequest, ProcessRunner};
use chrono::{DateTime, Local};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Time since boot.
    pub monotonic: Duration,
    pub realtime: SystemTime,
    pub comm: Option<String>,
    pub pid: Option<u32>,
    pub message: String,
}

impl JournalEntry {
    /// `HH:MM:SS[{monotonic:.8}] {source}: {message}` with a trailing newline.
    pub fn format_line(&self) -> String {
        let source = match (&self.comm, self.pid) {
            (Some(comm), Some(pid)) => format!("{comm}[{pid}]"),
            _ => "kernel".to_string(),
        };
        let wall: DateTime<Local> = self.realtime.into();
        format!(
            "{}[{:.8}] {}: {}\n",
            wall.format("%H:%M:%S"),
            self.monotonic.as_secs_f64(),
            source,
            self.message
        )
    }
}

/// Reads entries of the current boot's system journal.
pub trait JournalSource: Send + Sync {
    /// Entries logged at or after `since` (wall clock), oldest first.
    fn read_boot(&self, since: SystemTime) -> Result<Vec<JournalEntry>, HarnessError>;
}

pub struct JournalctlSource {
    runner: Arc<dyn ProcessRunner>,
}

impl JournalctlSource {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

impl JournalSource for JournalctlSource {
    fn read_boot(&self, since: SystemTime) -> Result<Vec<JournalEntry>, HarnessError> {
        let since_secs = since
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let out = self.runner.run(ProcessRequest::new(
            "journalctl",
            &[
                "--boot",
                "--output=json",
                // Without --all, fields over 4096 bytes come back as null.
                "--all",
                "--no-pager",
                &format!("--since=@{since_secs}"),
            ],
        ))?;
        if out.exit_code != 0 {
            return Err(HarnessError::Journal(format!(
                "journalctl exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        out.stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_journal_line)
            .collect()
    }
}

fn field_str<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str)
}

fn usec_field(record: &Value, name: &str) -> Result<u64, HarnessError> {
    field_str(record, name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| HarnessError::Journal(format!("journal entry lacks {name}")))
}

pub(crate) const ELIDED_MESSAGE: &str = "[message elided by journalctl]";

/// Messages that are not valid UTF-8 come back as byte arrays.
fn message_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Null) => ELIDED_MESSAGE.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let bytes: Vec<u8> = items
                .iter()
                .filter_map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&bytes).to_string()
        }
        _ => String::new(),
    }
}

pub(crate) fn parse_journal_line(line: &str) -> Result<JournalEntry, HarnessError> {
    let record: Value = serde_json::from_str(line)
        .map_err(|e| HarnessError::Journal(format!("invalid journal json: {e}")))?;
    let monotonic = Duration::from_micros(usec_field(&record, "__MONOTONIC_TIMESTAMP")?);
    let realtime = UNIX_EPOCH + Duration::from_micros(usec_field(&record, "__REALTIME_TIMESTAMP")?);
    Ok(JournalEntry {
        monotonic,
        realtime,
        comm: field_str(&record, "_COMM").map(str::to_string),
        pid: field_str(&record, "_PID").and_then(|pid| pid.parse().ok()),
        message: message_text(record.get("MESSAGE")),
    })
}

/// In-memory journal for tests.
#[derive(Default, Clone)]
pub struct FakeJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
    queries: Arc<Mutex<Vec<SystemTime>>>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl FakeJournal {
    pub fn push(&self, entry: JournalEntry) {
        self.entries.lock().expect("entries lock").push(entry);
    }

    /// Convenience entry stamped `monotonic` seconds after boot.
    pub fn log(&self, monotonic: Duration, comm: Option<(&str, u32)>, message: &str) {
        self.push(JournalEntry {
            monotonic,
            realtime: UNIX_EPOCH + monotonic,
            comm: comm.map(|(name, _)| name.to_string()),
            pid: comm.map(|(_, pid)| pid),
            message: message.to_string(),
        });
    }

    pub fn set_fail_next(&self, message: &str) {
        *self.fail_next.lock().expect("fail lock") = Some(message.to_string());
    }

    pub fn queries(&self) -> Vec<SystemTime> {
        self.queries.lock().expect("queries lock").clone()
    }
}

impl JournalSource for FakeJournal {
    fn read_boot(&self, since: SystemTime) -> Result<Vec<JournalEntry>, HarnessError> {
        self.queries.lock().expect("queries lock").push(since);
        if let Some(message) = self.fail_next.lock().expect("fail lock").take() {
            return Err(HarnessError::Journal(message));
        }
        Ok(self.entries.lock().expect("entries lock").clone())
    }
}

/// Copies the journal entries logged between `start` and `stop`.
pub struct JournalRecorder {
    description: String,
    source: Arc<dyn JournalSource>,
    clock: Arc<dyn Clock>,
    started: Option<(Duration, SystemTime)>,
    stopped: Option<Duration>,
}

impl JournalRecorder {
    pub fn new(
        description: impl Into<String>,
        source: Arc<dyn JournalSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            description: description.into(),
            source,
            clock,
            started: None,
            stopped: None,
        }
    }
}

impl Recorder for JournalRecorder {
    fn description(&self) -> &str {
        &self.description
    }

    fn start(&mut self) -> Result<(), HarnessError> {
        self.started = Some((self.clock.monotonic(), self.clock.now()));
        self.stopped = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HarnessError> {
        if self.started.is_none() {
            return Err(HarnessError::Journal(format!(
                "{} stopped before it was started",
                self.description
            )));
        }
        self.stopped = Some(self.clock.monotonic());
        Ok(())
    }

    fn save(&mut self, store: &RecordStore) -> Result<(), HarnessError> {
        let (Some((started, since)), Some(stopped)) = (self.started, self.stopped) else {
            return Err(HarnessError::Journal(format!(
                "{} saved before it was stopped",
                self.description
            )));
        };
        // journalctl --since has whole-second resolution.
        let query_since = since.checked_sub(Duration::from_secs(1)).unwrap_or(since);
        let mut entries = self.source.read_boot(query_since)?;
        entries.sort_by_key(|entry| entry.monotonic);

        let lines: Vec<String> = entries
            .iter()
            .skip_while(|entry| entry.monotonic < started)
            .take_while(|entry| entry.monotonic.as_secs() <= stopped.as_secs())
            .map(JournalEntry::format_line)
            .collect();
        append_run_log(
            "debug",
            "recorder.journal.saved",
            json!({
                "description": self.description,
                "entries": lines.len(),
                "started_secs": started.as_secs_f64(),
                "stopped_secs": stopped.as_secs_f64()
            }),
        );
        store.append(format!(
            "{}{}\n\n\n",
            block_header(&self.description),
            lines.concat()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeProcessRunner};

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[test]
    fn parses_journalctl_json_lines() {
        let entry = parse_journal_line(
            r#"{"__MONOTONIC_TIMESTAMP":"12500000","__REALTIME_TIMESTAMP":"1700000000000000","_COMM":"udisksd","_PID":"812","MESSAGE":"Mounted /dev/sda1"}"#,
        )
        .expect("entry");
        assert_eq!(entry.monotonic, secs(12.5));
        assert_eq!(entry.realtime, UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        assert_eq!(entry.comm.as_deref(), Some("udisksd"));
        assert_eq!(entry.pid, Some(812));
        assert_eq!(entry.message, "Mounted /dev/sda1");

        let kernel = parse_journal_line(
            r#"{"__MONOTONIC_TIMESTAMP":"1","__REALTIME_TIMESTAMP":"1","MESSAGE":[115,100,97]}"#,
        )
        .expect("kernel entry");
        assert_eq!(kernel.message, "sda");
        assert!(kernel.format_line().ends_with("[0.00000100] kernel: sda\n"));

        assert!(parse_journal_line(r#"{"MESSAGE":"x"}"#).is_err());
    }

    #[test]
    fn elided_message_is_marked_not_blank() {
        let entry = parse_journal_line(
            r#"{"__MONOTONIC_TIMESTAMP":"5","__REALTIME_TIMESTAMP":"5","_COMM":"udisksd","_PID":"3","MESSAGE":null}"#,
        )
        .expect("entry");
        assert_eq!(entry.message, ELIDED_MESSAGE);
        assert!(entry.format_line().ends_with("udisksd[3]: [message elided by journalctl]\n"));
    }

    #[test]
    fn journalctl_source_queries_current_boot_since_start() {
        let fake = FakeProcessRunner::default();
        fake.push_stdout(concat!(
            r#"{"__MONOTONIC_TIMESTAMP":"2000000","__REALTIME_TIMESTAMP":"2000000","MESSAGE":"a"}"#,
            "\n\n",
            r#"{"__MONOTONIC_TIMESTAMP":"3000000","__REALTIME_TIMESTAMP":"3000000","MESSAGE":"b"}"#,
            "\n"
        ));
        let source = JournalctlSource::new(Arc::new(fake.clone()));
        let entries = source
            .read_boot(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
            .expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            fake.spawned()[0].args,
            ["--boot", "--output=json", "--all", "--no-pager", "--since=@1700000000"]
        );

        fake.push_exit(1, "", "No journal files were found.");
        assert!(matches!(
            source.read_boot(UNIX_EPOCH),
            Err(HarnessError::Journal(_))
        ));
    }

    #[test]
    fn recorder_keeps_entries_between_start_and_stop_second() {
        let clock = FakeClock::new(UNIX_EPOCH + Duration::from_secs(50), secs(100.25));
        let journal = FakeJournal::default();
        journal.log(secs(99.9), Some(("udisksd", 7)), "before start");
        journal.log(secs(100.5), Some(("udisksd", 7)), "during");
        journal.log(secs(101.7), None, "same second as stop");
        journal.log(secs(102.0), Some(("udevd", 9)), "after stop");

        let store = RecordStore::new();
        let mut recorder =
            JournalRecorder::new("journal", Arc::new(journal.clone()), Arc::new(clock.clone()));
        recorder.start().expect("start");
        clock.advance(secs(1.25));
        recorder.stop().expect("stop");
        recorder.save(&store).expect("save");

        let block = store.contents();
        assert!(block.starts_with("<<<<< journal >>>>>\n"));
        assert!(block.ends_with("\n\n\n"));
        assert!(block.contains("[100.50000000] udisksd[7]: during\n"));
        assert!(block.contains("[101.70000000] kernel: same second as stop\n"));
        assert!(!block.contains("before start"));
        assert!(!block.contains("after stop"));
        assert_eq!(
            journal.queries(),
            [UNIX_EPOCH + Duration::from_secs(49)]
        );
    }

    #[test]
    fn empty_window_still_saves_a_block() {
        let store = RecordStore::new();
        let mut recorder = JournalRecorder::new(
            "journal",
            Arc::new(FakeJournal::default()),
            Arc::new(FakeClock::default()),
        );
        recorder.start().expect("start");
        recorder.stop().expect("stop");
        recorder.save(&store).expect("save");
        assert_eq!(store.contents(), "<<<<< journal >>>>>\n\n\n\n");
    }

    #[test]
    fn save_before_stop_is_an_error() {
        let mut recorder = JournalRecorder::new(
            "journal",
            Arc::new(FakeJournal::default()),
            Arc::new(FakeClock::default()),
        );
        assert!(recorder.stop().is_err());
        recorder.start().expect("start");
        assert!(recorder.save(&RecordStore::new()).is_err());
    }
}
