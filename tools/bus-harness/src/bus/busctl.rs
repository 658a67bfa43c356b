use super::value::{split_signature, BusValue};
use super::{ObjectRef, PropertyBus};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessOutput, ProcessRequest, ProcessRunner};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Errors busctl reports when the property or its interface is not there.
const ABSENT_MARKERS: &[&str] = &[
    "Unknown property",
    "UnknownProperty",
    "No such property",
    "No such interface",
    "UnknownInterface",
];

#[derive(Debug, Deserialize)]
struct TypedReply {
    #[serde(rename = "type")]
    signature: String,
    data: Value,
}

/// System-bus client that shells out to `busctl --json=short`.
pub struct BusctlClient {
    runner: Arc<dyn ProcessRunner>,
    call_timeout: Duration,
}

impl BusctlClient {
    pub fn new(runner: Arc<dyn ProcessRunner>, call_timeout: Duration) -> Self {
        Self {
            runner,
            call_timeout,
        }
    }

    fn busctl(&self, verb: &str, tail: Vec<String>) -> Result<ProcessOutput, HarnessError> {
        let mut args = vec![
            "--system".to_string(),
            "--json=short".to_string(),
            format!("--timeout={}", self.call_timeout.as_secs().max(1)),
            verb.to_string(),
        ];
        args.extend(tail);
        self.runner.run(ProcessRequest {
            program: "busctl".to_string(),
            args,
            cwd: None,
            merge_stderr: false,
        })
    }
}

fn parse_reply(stdout: &str) -> Result<Option<TypedReply>, HarnessError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| HarnessError::Bus(format!("invalid busctl json: {e}")))
}

impl PropertyBus for BusctlClient {
    fn get_property(
        &self,
        object: &ObjectRef,
        interface: &str,
        property: &str,
    ) -> Result<Option<BusValue>, HarnessError> {
        let out = self.busctl(
            "get-property",
            vec![
                object.service.clone(),
                object.path.clone(),
                interface.to_string(),
                property.to_string(),
            ],
        )?;
        if out.exit_code != 0 {
            if ABSENT_MARKERS.iter().any(|marker| out.stderr.contains(marker)) {
                return Ok(None);
            }
            return Err(HarnessError::Bus(format!(
                "get-property {object} {interface}.{property} failed: {}",
                out.stderr.trim()
            )));
        }
        match parse_reply(&out.stdout)? {
            Some(reply) => BusValue::from_busctl_json(&reply.signature, &reply.data).map(Some),
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
        let mut tail = vec![
            object.service.clone(),
            object.path.clone(),
            interface.to_string(),
            method.to_string(),
        ];
        if !args.is_empty() {
            tail.push(args.iter().map(BusValue::signature).collect());
            for arg in args {
                arg.push_busctl_args(&mut tail);
            }
        }
        append_run_log(
            "debug",
            "bus.call.started",
            json!({
                "object": object.to_string(),
                "interface": interface,
                "method": method,
                "arg_count": args.len()
            }),
        );
        let out = self.busctl("call", tail)?;
        if out.exit_code != 0 {
            append_run_log(
                "warn",
                "bus.call.failed",
                json!({
                    "object": object.to_string(),
                    "method": method,
                    "exit_code": out.exit_code,
                    "stderr": out.stderr
                }),
            );
            return Err(HarnessError::Bus(format!(
                "call {object} {interface}.{method} failed: {}",
                out.stderr.trim()
            )));
        }
        let Some(reply) = parse_reply(&out.stdout)? else {
            return Ok(Vec::new());
        };
        let types = split_signature(&reply.signature)?;
        let data = reply
            .data
            .as_array()
            .ok_or_else(|| HarnessError::Bus("busctl call reply data is not an array".to_string()))?;
        if types.len() != data.len() {
            return Err(HarnessError::Bus(format!(
                "busctl reply signature {} does not match {} values",
                reply.signature,
                data.len()
            )));
        }
        types
            .iter()
            .zip(data)
            .map(|(sig, value)| BusValue::from_busctl_json(sig, value))
            .collect()
    }

    fn introspect(&self, object: &ObjectRef) -> Result<String, HarnessError> {
        let out = self.runner.run(ProcessRequest {
            program: "busctl".to_string(),
            args: vec![
                "--system".to_string(),
                "introspect".to_string(),
                "--xml-interface".to_string(),
                object.service.clone(),
                object.path.clone(),
            ],
            cwd: None,
            merge_stderr: false,
        })?;
        if out.exit_code != 0 {
            return Err(HarnessError::Bus(format!(
                "introspect {object} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeProcessRunner;

    fn client(fake: &FakeProcessRunner) -> BusctlClient {
        BusctlClient::new(Arc::new(fake.clone()), Duration::from_secs(100))
    }

    fn manager() -> ObjectRef {
        ObjectRef::new("org.freedesktop.UDisks2", "/org/freedesktop/UDisks2/Manager")
    }

    #[test]
    fn get_property_decodes_typed_json() {
        let fake = FakeProcessRunner::default();
        fake.push_stdout("{\"type\":\"s\",\"data\":\"2.10.1\"}\n");
        let value = client(&fake)
            .get_property(&manager(), "org.freedesktop.UDisks2.Manager", "Version")
            .expect("property");
        assert_eq!(value, Some(BusValue::from("2.10.1")));

        let spawned = fake.spawned();
        assert_eq!(spawned[0].program, "busctl");
        assert_eq!(
            spawned[0].args,
            [
                "--system",
                "--json=short",
                "--timeout=100",
                "get-property",
                "org.freedesktop.UDisks2",
                "/org/freedesktop/UDisks2/Manager",
                "org.freedesktop.UDisks2.Manager",
                "Version"
            ]
        );
    }

    #[test]
    fn unknown_property_reads_as_absent() {
        let fake = FakeProcessRunner::default();
        fake.push_exit(1, "", "Failed to get property Foo: Unknown property or interface.");
        let value = client(&fake)
            .get_property(&manager(), "org.freedesktop.UDisks2.Manager", "Foo")
            .expect("absent, not error");
        assert_eq!(value, None);

        fake.push_exit(1, "", "Connection timed out");
        assert!(client(&fake)
            .get_property(&manager(), "org.freedesktop.UDisks2.Manager", "Foo")
            .is_err());
    }

    #[test]
    fn call_method_encodes_arguments_and_splits_reply() {
        let fake = FakeProcessRunner::default();
        fake.push_stdout("{\"type\":\"so\",\"data\":[\"ok\",\"/org/x\"]}");
        let values = client(&fake)
            .call_method(
                &manager(),
                "org.freedesktop.UDisks2.Manager",
                "EnableModules",
                &[BusValue::Bool(true)],
            )
            .expect("call");
        assert_eq!(
            values,
            [
                BusValue::from("ok"),
                BusValue::ObjectPath("/org/x".to_string())
            ]
        );
        let args = &fake.spawned()[0].args;
        assert_eq!(&args[args.len() - 2..], ["b", "true"]);
    }

    #[test]
    fn call_method_without_reply_yields_nothing() {
        let fake = FakeProcessRunner::default();
        fake.push_stdout("");
        let values = client(&fake)
            .call_method(&manager(), "org.freedesktop.UDisks2.Manager", "Ping", &[])
            .expect("call");
        assert!(values.is_empty());
    }
}
