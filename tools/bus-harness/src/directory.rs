//! Lookup helpers for the service under test.
//!
//! Paths and interface names are given as suffixes of the service's common
//! prefixes (`/block_devices/sda`, `.Block`), mirroring how tests talk about
//! the service.

use crate::bus::{is_valid_object_path, BusValue, ObjectRef, PropertyBus, INTROSPECTABLE_IFACE};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::probe::{ProbeTiming, PropertyProbe};
use crate::runtime::Clock;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// An interface bound to one object, ready for method calls.
pub struct InterfaceRef {
    bus: Arc<dyn PropertyBus>,
    object: ObjectRef,
    interface: String,
}

impl InterfaceRef {
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn name(&self) -> &str {
        &self.interface
    }

    pub fn call(&self, method: &str, args: &[BusValue]) -> Result<Vec<BusValue>, HarnessError> {
        self.bus
            .call_method(&self.object, &self.interface, method, args)
    }
}

pub struct ServiceDirectory {
    bus: Arc<dyn PropertyBus>,
    clock: Arc<dyn Clock>,
    service: String,
    path_prefix: String,
    timing: ProbeTiming,
}

impl ServiceDirectory {
    /// `service` doubles as the bus name and the interface-name prefix.
    pub fn new(
        bus: Arc<dyn PropertyBus>,
        clock: Arc<dyn Clock>,
        service: impl Into<String>,
        path_prefix: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            clock,
            service: service.into(),
            path_prefix: path_prefix.into(),
            timing: ProbeTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: ProbeTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn bus(&self) -> Arc<dyn PropertyBus> {
        Arc::clone(&self.bus)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Full object path for a suffix; full paths pass through unchanged.
    pub fn resolve_path(&self, path_suffix: &str) -> String {
        if path_suffix.starts_with(&self.path_prefix) {
            path_suffix.to_string()
        } else {
            format!("{}{}", self.path_prefix, path_suffix)
        }
    }

    pub fn interface_name(&self, iface_suffix: &str) -> String {
        format!("{}{}", self.service, iface_suffix)
    }

    /// Resolves an object, or `None` when the service does not export it.
    pub fn object(&self, path_suffix: &str) -> Option<ObjectRef> {
        let path = self.resolve_path(path_suffix);
        if !is_valid_object_path(&path) {
            append_run_log(
                "warn",
                "bus.object.invalid_path",
                json!({ "path": path }),
            );
            return None;
        }
        let object = ObjectRef::new(self.service.clone(), path);
        let exported = format!("interface name=\"{}", self.service);
        match self.bus.introspect(&object) {
            Ok(xml) if xml.contains(&exported) => Some(object),
            Ok(_) => {
                append_run_log(
                    "debug",
                    "bus.object.not_exported",
                    json!({ "object": object.to_string() }),
                );
                None
            }
            Err(error) => {
                append_run_log(
                    "debug",
                    "bus.object.lookup_failed",
                    json!({ "object": object.to_string(), "error": error.to_string() }),
                );
                None
            }
        }
    }

    pub fn interface(&self, object: &ObjectRef, iface_suffix: &str) -> InterfaceRef {
        InterfaceRef {
            bus: Arc::clone(&self.bus),
            object: object.clone(),
            interface: self.interface_name(iface_suffix),
        }
    }

    pub fn interface_at(&self, path_suffix: &str, iface_suffix: &str) -> Option<InterfaceRef> {
        self.object(path_suffix)
            .map(|object| self.interface(&object, iface_suffix))
    }

    pub fn property(&self, object: &ObjectRef, iface_suffix: &str, property: &str) -> PropertyProbe {
        PropertyProbe::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            object.clone(),
            self.interface_name(iface_suffix),
            property,
        )
        .with_timing(self.timing)
    }

    /// One immediate read, failing if the property is absent.
    pub fn property_raw(
        &self,
        object: &ObjectRef,
        iface_suffix: &str,
        property: &str,
    ) -> Result<BusValue, HarnessError> {
        let interface = self.interface_name(iface_suffix);
        self.bus
            .get_property(object, &interface, property)?
            .ok_or_else(|| {
                HarnessError::Bus(format!("{object} has no property {interface}.{property}"))
            })
    }

    /// Block device object for a device name or node, e.g. `sda` or `/dev/sda`.
    pub fn device(&self, dev_name: &str) -> Option<ObjectRef> {
        let base = Path::new(dev_name)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(dev_name);
        self.object(&format!("/block_devices/{base}"))
    }

    /// Last path element of the device's `Block.Drive` object path.
    pub fn drive_name(&self, device: &ObjectRef) -> Result<String, HarnessError> {
        let drive = self.property_raw(device, ".Block", "Drive")?;
        let path = drive
            .as_str()
            .ok_or_else(|| HarnessError::Bus(format!("Block.Drive of {device} is {drive}")))?;
        Ok(path.rsplit('/').next().unwrap_or(path).to_string())
    }

    /// Ensures the service's optional `module` is loaded, enabling modules
    /// when it is missing. Returns whether it is loaded afterwards.
    pub fn check_module_loaded(&self, module: &str) -> Result<bool, HarnessError> {
        let manager = self
            .object("/Manager")
            .ok_or_else(|| HarnessError::Bus(format!("{} exports no Manager", self.service)))?;
        let marker = format!("interface name=\"{}.Manager.{module}\"", self.service);

        if self.introspect_manager(&manager)?.contains(&marker) {
            return Ok(true);
        }
        append_run_log(
            "info",
            "suite.module.enabling",
            json!({ "module": module }),
        );
        self.interface(&manager, ".Manager")
            .call("EnableModules", &[BusValue::Bool(true)])?;
        Ok(self.introspect_manager(&manager)?.contains(&marker))
    }

    fn introspect_manager(&self, manager: &ObjectRef) -> Result<String, HarnessError> {
        let values = self
            .bus
            .call_method(manager, INTROSPECTABLE_IFACE, "Introspect", &[])?;
        match values.first().and_then(BusValue::as_str) {
            Some(xml) => Ok(xml.to_string()),
            None => self.bus.introspect(manager),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FakeBus;
    use crate::runtime::FakeClock;

    const SERVICE: &str = "org.freedesktop.UDisks2";
    const PREFIX: &str = "/org/freedesktop/UDisks2";

    fn directory(bus: &FakeBus) -> ServiceDirectory {
        ServiceDirectory::new(
            Arc::new(bus.clone()),
            Arc::new(FakeClock::default()),
            SERVICE,
            PREFIX,
        )
    }

    fn node(interfaces: &[&str]) -> String {
        let body: String = interfaces
            .iter()
            .map(|name| format!("<interface name=\"{name}\"></interface>"))
            .collect();
        format!("<node>{body}</node>")
    }

    #[test]
    fn suffixes_get_the_prefix_and_full_paths_pass_through() {
        let bus = FakeBus::default();
        let dir = directory(&bus);
        assert_eq!(dir.resolve_path("/Manager"), "/org/freedesktop/UDisks2/Manager");
        assert_eq!(
            dir.resolve_path("/org/freedesktop/UDisks2/drives/x"),
            "/org/freedesktop/UDisks2/drives/x"
        );
        assert_eq!(dir.interface_name(".Block"), "org.freedesktop.UDisks2.Block");
    }

    #[test]
    fn missing_objects_resolve_to_none() {
        let bus = FakeBus::default();
        bus.set_introspection(
            "/org/freedesktop/UDisks2/block_devices/sda",
            &node(&["org.freedesktop.DBus.Properties", "org.freedesktop.UDisks2.Block"]),
        );
        bus.set_introspection(
            "/org/freedesktop/UDisks2/block_devices/sdz",
            &node(&["org.freedesktop.DBus.Properties"]),
        );
        let dir = directory(&bus);

        assert!(dir.device("/dev/sda").is_some());
        assert!(dir.device("sdz").is_none());
        assert!(dir.device("sdq").is_none());
        assert!(dir.object("/bad-path").is_none());
        assert!(dir.interface_at("/block_devices/sdq", ".Block").is_none());
    }

    #[test]
    fn interface_on_present_object_calls_through() {
        let bus = FakeBus::default();
        let path = "/org/freedesktop/UDisks2/block_devices/sda";
        bus.set_introspection(path, &node(&["org.freedesktop.UDisks2.Filesystem"]));
        bus.push_reply(
            path,
            "org.freedesktop.UDisks2.Filesystem",
            "Mount",
            Ok(vec![BusValue::from("/run/media/sda")]),
        );
        let dir = directory(&bus);

        let fs = dir
            .interface_at("/block_devices/sda", ".Filesystem")
            .expect("present");
        assert_eq!(fs.object().path, path);
        assert_eq!(fs.name(), "org.freedesktop.UDisks2.Filesystem");
        let reply = fs.call("Mount", &[BusValue::empty_options()]).expect("mount");
        assert_eq!(reply, [BusValue::from("/run/media/sda")]);

        let call = bus.calls().pop().expect("recorded call");
        assert_eq!(call.method, "Mount");
        assert_eq!(call.interface, "org.freedesktop.UDisks2.Filesystem");
        assert_eq!(call.args, [BusValue::empty_options()]);
    }

    #[test]
    fn drive_name_is_last_path_element() {
        let bus = FakeBus::default();
        let path = "/org/freedesktop/UDisks2/block_devices/sda";
        bus.set_property(
            path,
            "org.freedesktop.UDisks2.Block",
            "Drive",
            BusValue::ObjectPath("/org/freedesktop/UDisks2/drives/QEMU_HARDDISK_1".to_string()),
        );
        let dir = directory(&bus);
        let device = ObjectRef::new(SERVICE, path);
        assert_eq!(dir.drive_name(&device).expect("drive"), "QEMU_HARDDISK_1");
        assert!(dir.property_raw(&device, ".Block", "Nope").is_err());
    }

    #[test]
    fn module_check_enables_modules_when_missing() {
        let bus = FakeBus::default();
        let manager = "/org/freedesktop/UDisks2/Manager";
        bus.set_introspection(manager, &node(&["org.freedesktop.UDisks2.Manager"]));
        bus.push_reply(
            manager,
            INTROSPECTABLE_IFACE,
            "Introspect",
            Ok(vec![BusValue::from(node(&["org.freedesktop.UDisks2.Manager"]))]),
        );
        bus.push_reply(
            manager,
            INTROSPECTABLE_IFACE,
            "Introspect",
            Ok(vec![BusValue::from(node(&[
                "org.freedesktop.UDisks2.Manager",
                "org.freedesktop.UDisks2.Manager.LVM2",
            ]))]),
        );

        let dir = directory(&bus);
        assert!(dir.check_module_loaded("LVM2").expect("loaded"));
        let calls = bus.calls();
        let methods: Vec<_> = calls.iter().map(|call| call.method.as_str()).collect();
        assert_eq!(methods, ["Introspect", "EnableModules", "Introspect"]);
        assert_eq!(calls[1].args, [BusValue::Bool(true)]);
        assert_eq!(calls[1].interface, "org.freedesktop.UDisks2.Manager");
    }

    #[test]
    fn probes_from_directory_use_full_interface_name() {
        let bus = FakeBus::default();
        let path = "/org/freedesktop/UDisks2/block_devices/sda";
        bus.set_property(path, "org.freedesktop.UDisks2.Block", "IdLabel", BusValue::from("data"));
        let dir = directory(&bus);
        let device = ObjectRef::new(SERVICE, path);
        let mut label = dir.property(&device, ".Block", "IdLabel");
        assert_eq!(label.interface(), "org.freedesktop.UDisks2.Block");
        label.assert_equal("data").expect("label");
    }
}
