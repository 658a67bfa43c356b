//! Per-suite setup: the service directory, the distribution the suite runs
//! on, the test devices, and the host helpers tests call.

use crate::bus::{ObjectRef, PropertyBus};
use crate::commands::{self, CommandResult};
use crate::config::HarnessConfig;
use crate::directory::ServiceDirectory;
use crate::errors::HarnessError;
use crate::flight::{self, TestId};
use crate::logging::append_run_log;
use crate::probe::PropertyProbe;
use crate::recorder::JournalSource;
use crate::runtime::ProductionRuntime;
use crate::unstable::{self, EnvMap, UnstableOutcome};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub const HOSTNAME_SERVICE: &str = "org.freedesktop.hostname1";
pub const HOSTNAME_PATH: &str = "/org/freedesktop/hostname1";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistroInfo {
    pub project: String,
    pub name: String,
    pub version: String,
}

impl DistroInfo {
    /// Fields 2 to 4 of a CPE name such as `cpe:/o:fedoraproject:fedora:25`
    /// or `cpe:/o:redhat:enterprise_linux:7.3:GA:server`.
    pub fn from_cpe(cpe: &str) -> Self {
        let mut fields = cpe.split(':').skip(2).map(str::to_string);
        Self {
            project: fields.next().unwrap_or_default(),
            name: fields.next().unwrap_or_default(),
            version: fields.next().unwrap_or_default(),
        }
    }

    pub fn read(bus: &dyn PropertyBus) -> Result<Self, HarnessError> {
        let hostname = ObjectRef::new(HOSTNAME_SERVICE, HOSTNAME_PATH);
        let cpe = bus
            .get_property(&hostname, HOSTNAME_SERVICE, "OperatingSystemCPEName")?
            .ok_or_else(|| {
                HarnessError::Bus(format!("{hostname} has no OperatingSystemCPEName"))
            })?;
        Ok(Self::from_cpe(&cpe.to_string()))
    }

    /// The skip message when running on one of `distros` (and on `version`,
    /// if one is given).
    pub fn skip_reason(&self, distros: &[&str], version: &str, reason: &str) -> Option<String> {
        let distro_matches = distros.contains(&self.name.as_str());
        if !distro_matches || (!version.is_empty() && version != self.version) {
            return None;
        }
        let mut message = "not supported on this distribution in this version".to_string();
        if !reason.is_empty() {
            message.push_str(": ");
            message.push_str(reason);
        }
        Some(message)
    }

    /// `Err(Skipped)` where [`DistroInfo::skip_reason`] matches.
    pub fn skip_on(&self, distros: &[&str], version: &str, reason: &str) -> Result<(), HarnessError> {
        match self.skip_reason(distros, version, reason) {
            Some(message) => Err(HarnessError::Skipped(message)),
            None => Ok(()),
        }
    }
}

pub struct SuiteContext {
    config: HarnessConfig,
    runtime: ProductionRuntime,
    directory: ServiceDirectory,
    distro: DistroInfo,
}

impl SuiteContext {
    pub fn setup(
        config: HarnessConfig,
        runtime: &ProductionRuntime,
        bus: Arc<dyn PropertyBus>,
    ) -> Result<Self, HarnessError> {
        if config.suite.devices.len() < config.suite.min_devices {
            return Err(HarnessError::InvalidConfig(format!(
                "the suite needs at least {} test devices, {} configured",
                config.suite.min_devices,
                config.suite.devices.len()
            )));
        }
        let distro = DistroInfo::read(bus.as_ref())?;
        let directory = ServiceDirectory::new(
            bus,
            Arc::clone(&runtime.clock),
            config.service.name.clone(),
            config.service.path_prefix.clone(),
        )
        .with_timing(config.probe_timing());
        append_run_log(
            "info",
            "suite.setup",
            json!({
                "service": config.service.name,
                "devices": config.suite.devices,
                "distro": [distro.project, distro.name, distro.version]
            }),
        );
        Ok(Self {
            runtime: runtime.clone(),
            config,
            directory,
            distro,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn distro(&self) -> &DistroInfo {
        &self.distro
    }

    pub fn devices(&self) -> &[String] {
        &self.config.suite.devices
    }

    pub fn object(&self, path_suffix: &str) -> Option<ObjectRef> {
        self.directory.object(path_suffix)
    }

    pub fn property(&self, object: &ObjectRef, iface_suffix: &str, property: &str) -> PropertyProbe {
        self.directory.property(object, iface_suffix, property)
    }

    pub fn device(&self, dev_name: &str) -> Option<ObjectRef> {
        self.directory.device(dev_name)
    }

    pub fn drive_name(&self, device: &ObjectRef) -> Result<String, HarnessError> {
        self.directory.drive_name(device)
    }

    pub fn check_module_loaded(&self, module: &str) -> Result<bool, HarnessError> {
        self.directory.check_module_loaded(module)
    }

    pub fn skip_on(&self, distros: &[&str], version: &str, reason: &str) -> Result<(), HarnessError> {
        self.distro.skip_on(distros, version, reason)
    }

    pub fn run_command(&self, command: &str) -> Result<CommandResult, HarnessError> {
        commands::run_command(self.runtime.process_runner.as_ref(), command)
    }

    pub fn wipe_fs(&self, device: &str) -> Result<bool, HarnessError> {
        commands::wipe_fs(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
            &self.config.commands,
            device,
        )
    }

    pub fn udev_settle(&self) -> Result<(), HarnessError> {
        commands::udev_settle(self.runtime.process_runner.as_ref())
    }

    pub fn read_file(&self, path: &Path) -> Result<String, HarnessError> {
        commands::read_file(self.runtime.file_system.as_ref(), path)
    }

    pub fn write_file(
        &self,
        path: &Path,
        contents: &str,
        ignore_nonexistent: bool,
    ) -> Result<(), HarnessError> {
        commands::write_file(
            self.runtime.file_system.as_ref(),
            path,
            contents,
            ignore_nonexistent,
        )
    }

    /// Runs one test under the flight recorder.
    pub fn record<T>(
        &self,
        journal: Arc<dyn JournalSource>,
        test_id: &TestId,
        body: impl FnOnce() -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        flight::record_test(&self.config.flight, &self.runtime, journal, test_id, body)
    }

    pub fn run_unstable(
        &self,
        env: &EnvMap,
        body: impl FnOnce() -> Result<(), HarnessError>,
    ) -> Result<UnstableOutcome, HarnessError> {
        let fatal = unstable::unstable_failures_fatal(env, &self.config.suite.unstable_env_var);
        unstable::run_unstable(fatal, self.runtime.terminal.as_ref(), body)
    }
}
