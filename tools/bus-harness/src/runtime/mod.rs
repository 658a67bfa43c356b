use crate::errors::HarnessError;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Route stderr into the stdout stream so both interleave in one capture.
    pub merge_stderr: bool,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: None,
            merge_stderr: false,
        }
    }

    /// Builds a request from an argv vector; an empty argv is rejected.
    pub fn from_argv(argv: &[String]) -> Result<Self, HarnessError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::Process("empty argv".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: None,
            merge_stderr: false,
        })
    }

    pub fn shell(command: &str) -> Self {
        Self::new("sh", &["-c", command])
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    /// Time since boot on the clock the system journal stamps entries with.
    fn monotonic(&self) -> Duration;
    fn sleep(&self, duration: Duration) -> Result<(), HarnessError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError>;
    /// Drains the process output to EOF and reaps it.
    fn wait(&self, handle: u64) -> Result<ProcessOutput, HarnessError>;
    fn kill(&self, handle: u64) -> Result<(), HarnessError>;
    /// Asks the process to exit (SIGTERM) without waiting; `wait` still collects it.
    fn terminate(&self, handle: u64) -> Result<(), HarnessError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, HarnessError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError>;
    fn append_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), HarnessError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), HarnessError>;
    /// Writes to stderr without a trailing newline.
    fn write_err(&self, text: &str) -> Result<(), HarnessError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic(&self) -> Duration {
        use nix::time::{clock_gettime, ClockId};
        clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map(|ts| {
                Duration::new(
                    u64::try_from(ts.tv_sec()).unwrap_or(0),
                    u32::try_from(ts.tv_nsec()).unwrap_or(0),
                )
            })
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Result<(), HarnessError> {
        std::thread::sleep(duration);
        Ok(())
    }
}

pub struct ProductionFileSystem;

fn io_error(path: &Path, error: std::io::Error) -> HarnessError {
    if error.kind() == std::io::ErrorKind::NotFound {
        HarnessError::NotFound(format!("{}: {error}", path.display()))
    } else {
        HarnessError::Io(format!("{}: {error}", path.display()))
    }
}

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        std::fs::write(path, contents).map_err(|e| io_error(path, e))
    }

    fn append_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| io_error(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), HarnessError> {
        std::fs::create_dir_all(path).map_err(|e| io_error(path, e))
    }
}

struct RunningChild {
    child: std::process::Child,
    merged: Option<std::io::PipeReader>,
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, RunningChild>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn take(&self, handle: u64) -> Result<RunningChild, HarnessError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| HarnessError::Process("process lock poisoned".to_string()))?;
        state
            .children
            .remove(&handle)
            .ok_or_else(|| HarnessError::Process(format!("unknown handle {handle}")))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null());

        let merged = if request.merge_stderr {
            let (reader, writer) =
                std::io::pipe().map_err(|e| HarnessError::Process(e.to_string()))?;
            let err_writer = writer
                .try_clone()
                .map_err(|e| HarnessError::Process(e.to_string()))?;
            cmd.stdout(writer).stderr(err_writer);
            Some(reader)
        } else {
            cmd.stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());
            None
        };

        let child = cmd
            .spawn()
            .map_err(|e| HarnessError::Process(format!("{}: {e}", request.program)))?;
        // The command still owns the pipe's write ends; they must close for EOF.
        drop(cmd);

        let mut state = self
            .state
            .lock()
            .map_err(|_| HarnessError::Process("process lock poisoned".to_string()))?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, RunningChild { child, merged });
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, HarnessError> {
        let RunningChild { child, merged } = self.take(handle)?;
        match merged {
            Some(mut reader) => {
                let mut buffer = Vec::new();
                reader
                    .read_to_end(&mut buffer)
                    .map_err(|e| HarnessError::Process(e.to_string()))?;
                let mut child = child;
                let status = child
                    .wait()
                    .map_err(|e| HarnessError::Process(e.to_string()))?;
                Ok(ProcessOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&buffer).to_string(),
                    stderr: String::new(),
                })
            }
            None => {
                let output = child
                    .wait_with_output()
                    .map_err(|e| HarnessError::Process(e.to_string()))?;
                Ok(ProcessOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
        }
    }

    fn kill(&self, handle: u64) -> Result<(), HarnessError> {
        let RunningChild { mut child, .. } = self.take(handle)?;
        child
            .kill()
            .map_err(|e| HarnessError::Process(e.to_string()))?;
        let _ = child.wait();
        Ok(())
    }

    fn terminate(&self, handle: u64) -> Result<(), HarnessError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = {
            let state = self
                .state
                .lock()
                .map_err(|_| HarnessError::Process("process lock poisoned".to_string()))?;
            state
                .children
                .get(&handle)
                .map(|running| running.child.id())
                .ok_or_else(|| HarnessError::Process(format!("unknown handle {handle}")))?
        };
        let pid = i32::try_from(pid)
            .map_err(|_| HarnessError::Process(format!("pid {pid} out of range")))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            // Already exited; its output is still waiting to be drained.
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(HarnessError::Process(format!("SIGTERM {pid}: {e}"))),
        }
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), HarnessError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| HarnessError::Io(e.to_string()))
    }

    fn write_err(&self, text: &str) -> Result<(), HarnessError> {
        use std::io::Write;
        let mut err = std::io::stderr();
        write!(err, "{text}")
            .and_then(|()| err.flush())
            .map_err(|e| HarnessError::Io(e.to_string()))
    }
}

#[derive(Clone)]
pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    monotonic: Arc<Mutex<Duration>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime, monotonic: Duration) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            monotonic: Arc::new(Mutex::new(monotonic)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    /// Total time slept since creation.
    pub fn slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().expect("clock lock") += duration;
        *self.monotonic.lock().expect("clock lock") += duration;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH, Duration::from_secs(100))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn monotonic(&self) -> Duration {
        *self.monotonic.lock().expect("clock lock")
    }

    fn sleep(&self, duration: Duration) -> Result<(), HarnessError> {
        self.sleeps.lock().expect("sleep lock").push(duration);
        self.advance(duration);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<HarnessError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: HarnessError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    fn maybe_fail(&self) -> Result<(), HarnessError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, HarnessError> {
        self.maybe_fail()?;
        self.contents(path)
            .ok_or_else(|| HarnessError::NotFound(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_string(&self, path: &Path, contents: &str) -> Result<(), HarnessError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), HarnessError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
    err_writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn stderr_text(&self) -> String {
        self.err_writes.lock().expect("err lock").concat()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), HarnessError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_err(&self, text: &str) -> Result<(), HarnessError> {
        self.err_writes
            .lock()
            .expect("err lock")
            .push(text.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, HarnessError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    terminates: Arc<Mutex<Vec<u64>>>,
    terminate_failure: Arc<Mutex<Option<HarnessError>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, HarnessError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    /// Queues a successful exit with the given stdout.
    pub fn push_stdout(&self, stdout: &str) {
        self.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }));
    }

    pub fn push_exit(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.push_response(Ok(ProcessOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }));
    }

    /// The next `terminate` fails with `error`.
    pub fn fail_next_terminate(&self, error: HarnessError) {
        *self.terminate_failure.lock().expect("terminate lock") = Some(error);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    pub fn terminates(&self) -> Vec<u64> {
        self.terminates.lock().expect("terminates lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, HarnessError> {
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, HarnessError> {
        self.waits.lock().expect("waits lock").push(handle);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(HarnessError::Process(
                "no fake response queued".to_string(),
            ));
        }
        responses.remove(0)
    }

    fn kill(&self, handle: u64) -> Result<(), HarnessError> {
        self.kills.lock().expect("kills lock").push(handle);
        Ok(())
    }

    fn terminate(&self, handle: u64) -> Result<(), HarnessError> {
        self.terminates
            .lock()
            .expect("terminates lock")
            .push(handle);
        match self.terminate_failure.lock().expect("terminate lock").take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Blocks until `path` exists, for tests whose child signals readiness by
/// creating a file after it has printed what the test checks.
#[cfg(test)]
pub(crate) fn wait_for_marker(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("{} never appeared", path.display());
}
