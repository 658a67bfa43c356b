pub mod bus;
pub mod bytes;
pub mod commands;
pub mod config;
pub mod directory;
pub mod errors;
pub mod flight;
pub mod logging;
pub mod probe;
pub mod recorder;
pub mod runtime;
pub mod suite;
pub mod unstable;

use bus::{BusValue, BusctlClient, ObjectRef, PropertyBus};
use clap::{error::ErrorKind, ArgGroup, Args, Parser, Subcommand};
use config::{load_config, CliOverrides, HarnessConfig};
use directory::ServiceDirectory;
use errors::HarnessError;
use flight::TestId;
use logging::{append_run_log, init_run_logger};
use probe::PropertyProbe;
use recorder::JournalctlSource;
use runtime::{ProcessRequest, ProductionRuntime};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use unstable::{run_unstable, unstable_failures_fatal, EnvMap, UnstableOutcome};

#[derive(Debug, Clone, Parser)]
#[command(name = "bus-harness")]
#[command(about = "Flight recorder and property probes for system bus service tests")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub run_log: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a command as one test and append its flight record.
    Record(RecordArgs),
    /// Poll a property until a condition holds.
    Probe(ProbeArgs),
    /// Wipe signatures from a device, retrying while it is busy.
    Wipe { device: String },
    /// Wait for the udev event queue to drain.
    Settle,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Record(_) => "record",
            Self::Probe(_) => "probe",
            Self::Wipe { .. } => "wipe",
            Self::Settle => "settle",
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct RecordArgs {
    /// module.class.method
    #[arg(long)]
    pub test_id: String,
    #[arg(long)]
    pub record_path: Option<PathBuf>,
    /// Report failures as `unstable-fail...` unless the unstable toggle is set.
    #[arg(long, default_value_t = false)]
    pub unstable: bool,
    #[arg(last = true, required = true)]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Args)]
#[command(group(
    ArgGroup::new("condition")
        .required(true)
        .args(["equals", "greater", "less", "present", "absent", "truthy", "falsy", "length"])
))]
pub struct ProbeArgs {
    /// Object path, or a suffix of the service path prefix.
    #[arg(long)]
    pub object: String,
    /// Interface name, or a suffix such as `.Block`.
    #[arg(long)]
    pub interface: String,
    #[arg(long)]
    pub property: String,
    #[arg(long)]
    pub equals: Option<String>,
    #[arg(long)]
    pub greater: Option<String>,
    #[arg(long)]
    pub less: Option<String>,
    #[arg(long, default_value_t = false)]
    pub present: bool,
    #[arg(long, default_value_t = false)]
    pub absent: bool,
    #[arg(long, default_value_t = false)]
    pub truthy: bool,
    #[arg(long, default_value_t = false)]
    pub falsy: bool,
    #[arg(long)]
    pub length: Option<usize>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeCondition {
    Equals(BusValue),
    Greater(BusValue),
    Less(BusValue),
    Present,
    Absent,
    Truthy,
    Falsy,
    Length(usize),
}

impl ProbeArgs {
    pub fn condition(&self) -> Result<ProbeCondition, HarnessError> {
        let condition = if let Some(value) = &self.equals {
            ProbeCondition::Equals(BusValue::parse_literal(value))
        } else if let Some(value) = &self.greater {
            ProbeCondition::Greater(BusValue::parse_literal(value))
        } else if let Some(value) = &self.less {
            ProbeCondition::Less(BusValue::parse_literal(value))
        } else if self.present {
            ProbeCondition::Present
        } else if self.absent {
            ProbeCondition::Absent
        } else if self.truthy {
            ProbeCondition::Truthy
        } else if self.falsy {
            ProbeCondition::Falsy
        } else if let Some(length) = self.length {
            ProbeCondition::Length(length)
        } else {
            return Err(HarnessError::Cli("probe needs a condition".to_string()));
        };
        Ok(condition)
    }
}

pub fn run() -> Result<i32, HarnessError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| HarnessError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, HarnessError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(HarnessError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        record_path: match &cli.command {
            Command::Record(record) => record.record_path.clone(),
            _ => None,
        },
        run_log_path: cli.run_log.clone(),
        probe_timeout_ms: match &cli.command {
            Command::Probe(probe) => probe.timeout_ms,
            _ => None,
        },
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    if let Some(path) = &cfg.logging.run_log_path {
        init_run_logger(path);
    }
    append_run_log(
        "info",
        "harness.command.started",
        json!({ "command": cli.command.name(), "service": cfg.service.name }),
    );

    let bus: Arc<dyn PropertyBus> = Arc::new(BusctlClient::new(
        Arc::clone(&runtime.process_runner),
        cfg.call_timeout(),
    ));

    let code = match &cli.command {
        Command::Record(record) => run_record(&cfg, runtime, &env_map, record)?,
        Command::Probe(probe) => run_probe(&cfg, runtime, bus, probe)?,
        Command::Wipe { device } => {
            let wiped = commands::wipe_fs(
                runtime.process_runner.as_ref(),
                runtime.clock.as_ref(),
                &cfg.commands,
                device,
            )?;
            if wiped {
                runtime.terminal.write_line(&format!("wiped {device}"))?;
                0
            } else {
                runtime.terminal.write_err(&format!(
                    "wipefs -a {device} kept failing after {} attempts\n",
                    cfg.commands.wipe_attempts
                ))?;
                1
            }
        }
        Command::Settle => {
            commands::udev_settle(runtime.process_runner.as_ref())?;
            0
        }
    };

    append_run_log(
        "info",
        "harness.command.finished",
        json!({ "command": cli.command.name(), "exit_code": code }),
    );
    Ok(code)
}

fn run_record(
    cfg: &HarnessConfig,
    runtime: &ProductionRuntime,
    env_map: &EnvMap,
    args: &RecordArgs,
) -> Result<i32, HarnessError> {
    let test_id: TestId = args.test_id.parse()?;
    let request = ProcessRequest::from_argv(&args.argv)?;
    let command = request.display();

    let record_once = || -> Result<i32, HarnessError> {
        let journal = Arc::new(JournalctlSource::new(Arc::clone(&runtime.process_runner)));
        let output = flight::record_test(&cfg.flight, runtime, journal, &test_id, || {
            runtime.process_runner.run(request.clone())
        })?;
        if !output.stdout.is_empty() {
            runtime
                .terminal
                .write_line(output.stdout.trim_end_matches('\n'))?;
        }
        if !output.stderr.is_empty() {
            runtime.terminal.write_err(&output.stderr)?;
        }
        Ok(output.exit_code)
    };

    if !args.unstable {
        return record_once();
    }

    let fatal = unstable_failures_fatal(env_map, &cfg.suite.unstable_env_var);
    let outcome = run_unstable(fatal, runtime.terminal.as_ref(), || {
        match record_once()? {
            0 => Ok(()),
            code => Err(HarnessError::Process(format!("`{command}` exited with {code}"))),
        }
    })?;
    if let UnstableOutcome::SoftFailed(message) = outcome {
        append_run_log(
            "warn",
            "harness.record.unstable_failure",
            json!({ "test_id": test_id.to_string(), "error": message }),
        );
    }
    Ok(0)
}

fn run_probe(
    cfg: &HarnessConfig,
    runtime: &ProductionRuntime,
    bus: Arc<dyn PropertyBus>,
    args: &ProbeArgs,
) -> Result<i32, HarnessError> {
    let condition = args.condition()?;
    let directory = ServiceDirectory::new(
        bus,
        Arc::clone(&runtime.clock),
        cfg.service.name.clone(),
        cfg.service.path_prefix.clone(),
    );
    let interface = if args.interface.starts_with('.') {
        directory.interface_name(&args.interface)
    } else {
        args.interface.clone()
    };
    let object = ObjectRef::new(cfg.service.name.clone(), directory.resolve_path(&args.object));
    let mut probe = PropertyProbe::new(
        directory.bus(),
        directory.clock(),
        object,
        interface,
        args.property.clone(),
    )
    .with_timing(cfg.probe_timing());

    let result = match &condition {
        ProbeCondition::Equals(value) => probe.assert_equal(value.clone()),
        ProbeCondition::Greater(value) => probe.assert_greater(value.clone()),
        ProbeCondition::Less(value) => probe.assert_less(value.clone()),
        ProbeCondition::Present => probe.assert_some(),
        ProbeCondition::Absent => probe.assert_none(),
        ProbeCondition::Truthy => probe.assert_true(),
        ProbeCondition::Falsy => probe.assert_false(),
        ProbeCondition::Length(length) => probe.assert_len(*length),
    };

    let label = format!(
        "{}:{} {}.{}",
        probe.object().service,
        probe.object().path,
        probe.interface(),
        probe.property()
    );
    match result {
        Ok(()) => {
            let seen = probe
                .last_value()
                .map_or_else(|| "None".to_string(), BusValue::to_string);
            runtime.terminal.write_line(&format!("{label} = {seen}"))?;
            Ok(0)
        }
        Err(HarnessError::Assertion(message)) => {
            runtime.terminal.write_err(&format!("{label}: {message}\n"))?;
            Ok(1)
        }
        Err(error) => Err(error),
    }
}

pub fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
