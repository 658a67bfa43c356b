use crate::errors::HarnessError;
use crate::probe::ProbeTiming;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub record_path: Option<PathBuf>,
    pub run_log_path: Option<PathBuf>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessConfig {
    pub service: ServiceConfig,
    pub probe: ProbeConfig,
    pub flight: FlightConfig,
    pub commands: CommandsConfig,
    pub suite: SuiteConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Bus name; also the prefix of every interface name.
    pub name: String,
    pub path_prefix: String,
    pub call_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorCommand {
    pub label: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlightConfig {
    pub record_path: PathBuf,
    pub journal_label: String,
    /// Outermost first.
    pub monitors: Vec<MonitorCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandsConfig {
    pub wipe_attempts: u32,
    pub wipe_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteConfig {
    pub devices: Vec<String>,
    pub min_devices: usize,
    pub unstable_env_var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub run_log_path: Option<PathBuf>,
}

fn monitor(label: &str, argv: &[&str]) -> MonitorCommand {
    MonitorCommand {
        label: label.to_string(),
        argv: argv.iter().map(|arg| arg.to_string()).collect(),
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "org.freedesktop.UDisks2".to_string(),
                path_prefix: "/org/freedesktop/UDisks2".to_string(),
                call_timeout_seconds: 100,
            },
            probe: ProbeConfig {
                timeout_ms: 5_000,
                interval_ms: 500,
            },
            flight: FlightConfig {
                record_path: PathBuf::from("flight_record.log"),
                journal_label: "journal".to_string(),
                monitors: vec![
                    monitor("udisksctl monitor", &["udisksctl", "monitor"]),
                    monitor("udevadm monitor", &["udevadm", "monitor"]),
                ],
            },
            commands: CommandsConfig {
                wipe_attempts: 10,
                wipe_backoff_ms: 1_000,
            },
            suite: SuiteConfig {
                devices: Vec::new(),
                min_devices: 4,
                unstable_env_var: "UNSTABLE_TESTS_FATAL".to_string(),
            },
            logging: LoggingConfig { run_log_path: None },
        }
    }
}

impl HarnessConfig {
    pub fn probe_timing(&self) -> ProbeTiming {
        ProbeTiming {
            timeout: Duration::from_millis(self.probe.timeout_ms),
            interval: Duration::from_millis(self.probe.interval_ms),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.service.call_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialHarnessConfig {
    service: Option<PartialServiceConfig>,
    probe: Option<PartialProbeConfig>,
    flight: Option<PartialFlightConfig>,
    commands: Option<PartialCommandsConfig>,
    suite: Option<PartialSuiteConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialServiceConfig {
    name: Option<String>,
    path_prefix: Option<String>,
    call_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialProbeConfig {
    timeout_ms: Option<u64>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialFlightConfig {
    record_path: Option<PathBuf>,
    journal_label: Option<String>,
    monitors: Option<Vec<MonitorCommand>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCommandsConfig {
    wipe_attempts: Option<u32>,
    wipe_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSuiteConfig {
    devices: Option<Vec<String>>,
    min_devices: Option<usize>,
    unstable_env_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    run_log_path: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<HarnessConfig, HarnessError> {
    let mut cfg = HarnessConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialHarnessConfig = toml::from_str(&file_contents)
            .map_err(|e| HarnessError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);

    cfg.flight.record_path = absolutize_path(process_cwd, &cfg.flight.record_path);
    if let Some(path) = &cfg.logging.run_log_path {
        cfg.logging.run_log_path = Some(absolutize_path(process_cwd, path));
    }

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut HarnessConfig, partial: PartialHarnessConfig) {
    if let Some(service) = partial.service {
        if let Some(name) = service.name {
            cfg.service.name = name;
        }
        if let Some(path_prefix) = service.path_prefix {
            cfg.service.path_prefix = path_prefix;
        }
        if let Some(value) = service.call_timeout_seconds {
            cfg.service.call_timeout_seconds = value;
        }
    }

    if let Some(probe) = partial.probe {
        if let Some(value) = probe.timeout_ms {
            cfg.probe.timeout_ms = value;
        }
        if let Some(value) = probe.interval_ms {
            cfg.probe.interval_ms = value;
        }
    }

    if let Some(flight) = partial.flight {
        if let Some(record_path) = flight.record_path {
            cfg.flight.record_path = record_path;
        }
        if let Some(journal_label) = flight.journal_label {
            cfg.flight.journal_label = journal_label;
        }
        if let Some(monitors) = flight.monitors {
            cfg.flight.monitors = monitors;
        }
    }

    if let Some(commands) = partial.commands {
        if let Some(value) = commands.wipe_attempts {
            cfg.commands.wipe_attempts = value;
        }
        if let Some(value) = commands.wipe_backoff_ms {
            cfg.commands.wipe_backoff_ms = value;
        }
    }

    if let Some(suite) = partial.suite {
        if let Some(devices) = suite.devices {
            cfg.suite.devices = devices;
        }
        if let Some(value) = suite.min_devices {
            cfg.suite.min_devices = value;
        }
        if let Some(value) = suite.unstable_env_var {
            cfg.suite.unstable_env_var = value;
        }
    }

    if let Some(logging) = partial.logging {
        cfg.logging.run_log_path = logging.run_log_path;
    }
}

fn apply_cli_overrides(cfg: &mut HarnessConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.record_path {
        cfg.flight.record_path = path.clone();
    }
    if let Some(path) = &overrides.run_log_path {
        cfg.logging.run_log_path = Some(path.clone());
    }
    if let Some(timeout_ms) = overrides.probe_timeout_ms {
        cfg.probe.timeout_ms = timeout_ms;
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &HarnessConfig) -> Result<(), HarnessError> {
    if cfg.service.name.trim().is_empty() {
        return Err(HarnessError::InvalidConfig(
            "service.name must not be empty".to_string(),
        ));
    }

    if !cfg.service.path_prefix.starts_with('/') {
        return Err(HarnessError::InvalidConfig(
            "service.path_prefix must be an absolute object path".to_string(),
        ));
    }

    if cfg.probe.interval_ms == 0 {
        return Err(HarnessError::InvalidConfig(
            "probe.interval_ms must be greater than zero".to_string(),
        ));
    }

    if cfg.probe.interval_ms > cfg.probe.timeout_ms {
        return Err(HarnessError::InvalidConfig(
            "probe.interval_ms must not exceed probe.timeout_ms".to_string(),
        ));
    }

    if cfg.commands.wipe_attempts == 0 {
        return Err(HarnessError::InvalidConfig(
            "commands.wipe_attempts must be greater than zero".to_string(),
        ));
    }

    for monitor in &cfg.flight.monitors {
        if monitor.argv.is_empty() || monitor.argv[0].trim().is_empty() {
            return Err(HarnessError::InvalidConfig(format!(
                "flight monitor `{}` needs a command",
                monitor.label
            )));
        }
    }

    Ok(())
}
