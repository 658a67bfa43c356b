//! Access to remote objects on the system bus.
//!
//! The harness only needs three primitives from the transport: read a
//! property, call a method, and introspect an object. `BusctlClient` drives
//! the real bus through `busctl`; `FakeBus` scripts replies for tests.

pub mod busctl;
pub mod value;

pub use busctl::BusctlClient;
pub use value::BusValue;

use crate::errors::HarnessError;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";

/// A remote object: the bus name that owns it and its object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub service: String,
    pub path: String,
}

impl ObjectRef {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.path)
    }
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/')
        && !path.ends_with('/')
        && path.split('/').skip(1).all(|element| {
            !element.is_empty()
                && element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
}

pub trait PropertyBus: Send + Sync {
    /// `Ok(None)` means the object does not carry the property (or interface).
    fn get_property(
        &self,
        object: &ObjectRef,
        interface: &str,
        property: &str,
    ) -> Result<Option<BusValue>, HarnessError>;

    fn call_method(
        &self,
        object: &ObjectRef,
        interface: &str,
        method: &str,
        args: &[BusValue],
    ) -> Result<Vec<BusValue>, HarnessError>;

    /// Introspection XML of the object.
    fn introspect(&self, object: &ObjectRef) -> Result<String, HarnessError>;
}

#[derive(Debug, Clone)]
pub enum FakeReply {
    Value(Option<BusValue>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub object: ObjectRef,
    pub interface: String,
    pub method: String,
    pub args: Vec<BusValue>,
}

type PropertyKey = (String, String, String);
type MethodKey = (String, String, String);

/// Scripted bus. Each property replays its queued replies in order and then
/// keeps repeating the last one.
#[derive(Default, Clone)]
pub struct FakeBus {
    properties: Arc<Mutex<HashMap<PropertyKey, VecDeque<FakeReply>>>>,
    replies: Arc<Mutex<HashMap<MethodKey, VecDeque<Result<Vec<BusValue>, String>>>>>,
    introspection: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    fetches: Arc<Mutex<usize>>,
}

impl FakeBus {
    pub fn set_property(&self, path: &str, interface: &str, property: &str, value: BusValue) {
        self.script_property(path, interface, property, vec![FakeReply::Value(Some(value))]);
    }

    pub fn script_property(
        &self,
        path: &str,
        interface: &str,
        property: &str,
        replies: Vec<FakeReply>,
    ) {
        self.properties.lock().expect("properties lock").insert(
            (path.to_string(), interface.to_string(), property.to_string()),
            replies.into_iter().collect(),
        );
    }

    /// Queues the next reply of `method`; unqueued calls return no values.
    pub fn push_reply(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        reply: Result<Vec<BusValue>, String>,
    ) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry((path.to_string(), interface.to_string(), method.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn set_introspection(&self, path: &str, xml: &str) {
        self.introspection
            .lock()
            .expect("introspection lock")
            .insert(path.to_string(), xml.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().expect("fetches lock")
    }
}

impl PropertyBus for FakeBus {
    fn get_property(
        &self,
        object: &ObjectRef,
        interface: &str,
        property: &str,
    ) -> Result<Option<BusValue>, HarnessError> {
        *self.fetches.lock().expect("fetches lock") += 1;
        let mut properties = self.properties.lock().expect("properties lock");
        let key = (
            object.path.clone(),
            interface.to_string(),
            property.to_string(),
        );
        let Some(queue) = properties.get_mut(&key) else {
            return Ok(None);
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match reply {
            Some(FakeReply::Value(value)) => Ok(value),
            Some(FakeReply::Error(message)) => Err(HarnessError::Bus(message)),
            None => Ok(None),
        }
    }

    fn call_method(
        &self,
        object: &ObjectRef,
        interface: &str,
        method: &str,
        args: &[BusValue],
    ) -> Result<Vec<BusValue>, HarnessError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            object: object.clone(),
            interface: interface.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        });
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&(
                object.path.clone(),
                interface.to_string(),
                method.to_string(),
            ))
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Ok(values)) => Ok(values),
            Some(Err(message)) => Err(HarnessError::Bus(message)),
            None => Ok(Vec::new()),
        }
    }

    fn introspect(&self, object: &ObjectRef) -> Result<String, HarnessError> {
        self.introspection
            .lock()
            .expect("introspection lock")
            .get(&object.path)
            .cloned()
            .ok_or_else(|| HarnessError::Bus(format!("no such object {object}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_path_validation() {
        assert!(is_valid_object_path("/"));
        assert!(is_valid_object_path("/org/freedesktop/UDisks2/block_devices/sda1"));
        assert!(!is_valid_object_path("org/x"));
        assert!(!is_valid_object_path("/org//x"));
        assert!(!is_valid_object_path("/org/x/"));
        assert!(!is_valid_object_path("/org/x-y"));
    }

    #[test]
    fn fake_bus_replays_then_sticks_on_last_reply() {
        let bus = FakeBus::default();
        let object = ObjectRef::new("org.example", "/obj");
        bus.script_property(
            "/obj",
            "org.example.Iface",
            "Size",
            vec![
                FakeReply::Error("not yet".to_string()),
                FakeReply::Value(Some(BusValue::UInt64(1))),
            ],
        );
        assert!(bus.get_property(&object, "org.example.Iface", "Size").is_err());
        for _ in 0..3 {
            let value = bus
                .get_property(&object, "org.example.Iface", "Size")
                .expect("value");
            assert_eq!(value, Some(BusValue::UInt64(1)));
        }
        assert_eq!(bus.fetch_count(), 4);
        assert_eq!(
            bus.get_property(&object, "org.example.Iface", "Missing")
                .expect("absent"),
            None
        );
    }
}
