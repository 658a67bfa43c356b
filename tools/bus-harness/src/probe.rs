//! Polling assertions over a single remote property.
//!
//! Remote state settles asynchronously after an operation is issued, so a
//! single read-and-compare is racy. Every assertion here re-reads the
//! property at a fixed interval until its condition holds or the timeout
//! runs out. A failed read or a value of the wrong shape just counts as a
//! miss for that attempt.

use crate::bus::{BusValue, ObjectRef, PropertyBus};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTiming {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl ProbeTiming {
    /// Number of reads a poll makes: `floor(timeout / interval)`.
    pub fn attempts(&self, timeout: Duration) -> u128 {
        timeout
            .as_nanos()
            .checked_div(self.interval.as_nanos())
            .unwrap_or(1)
    }
}

pub struct PropertyProbe {
    bus: Arc<dyn PropertyBus>,
    clock: Arc<dyn Clock>,
    object: ObjectRef,
    interface: String,
    property: String,
    timing: ProbeTiming,
    last: Option<BusValue>,
}

fn describe(value: Option<&BusValue>) -> String {
    value.map_or_else(|| "None".to_string(), BusValue::to_string)
}

fn describe_list(values: &[BusValue]) -> String {
    BusValue::Array(values.to_vec()).to_string()
}

fn present(value: Option<&BusValue>) -> Result<&BusValue, HarnessError> {
    value.ok_or_else(|| HarnessError::Assertion("property has no value".to_string()))
}

fn identity(value: &BusValue) -> Result<BusValue, HarnessError> {
    Ok(value.clone())
}

impl PropertyProbe {
    pub fn new(
        bus: Arc<dyn PropertyBus>,
        clock: Arc<dyn Clock>,
        object: ObjectRef,
        interface: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            clock,
            object,
            interface: interface.into(),
            property: property.into(),
            timing: ProbeTiming::default(),
            last: None,
        }
    }

    pub fn with_timing(mut self, timing: ProbeTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timing.timeout = timeout;
        self
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    /// Value seen by the most recent successful read; never triggers a read.
    pub fn last_value(&self) -> Option<&BusValue> {
        self.last.as_ref()
    }

    /// Reads the property once and caches the result.
    pub fn refresh(&mut self) -> Result<Option<&BusValue>, HarnessError> {
        self.last = self
            .bus
            .get_property(&self.object, &self.interface, &self.property)?;
        Ok(self.last.as_ref())
    }

    /// Polls until `predicate` holds for a freshly read value.
    ///
    /// Makes `floor(timeout / interval)` attempts, sleeping one interval
    /// after each miss. Read errors and predicate errors count as misses.
    pub fn wait_until<P>(&mut self, timeout: Duration, mut predicate: P) -> bool
    where
        P: FnMut(Option<&BusValue>) -> Result<bool, HarnessError>,
    {
        let attempts = self.timing.attempts(timeout);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = match self.refresh() {
                Ok(value) => predicate(value),
                Err(error) => Err(error),
            };
            match outcome {
                Ok(true) => {
                    append_run_log(
                        "debug",
                        "probe.wait.satisfied",
                        json!({
                            "object": self.object.to_string(),
                            "property": format!("{}.{}", self.interface, self.property),
                            "attempt": attempt as u64
                        }),
                    );
                    return true;
                }
                Ok(false) => {}
                Err(error) => last_error = Some(error.to_string()),
            }
            let _ = self.clock.sleep(self.timing.interval);
        }
        append_run_log(
            "warn",
            "probe.wait.timeout",
            json!({
                "object": self.object.to_string(),
                "property": format!("{}.{}", self.interface, self.property),
                "attempts": attempts as u64,
                "timeout_ms": timeout.as_millis() as u64,
                "last_value": describe(self.last.as_ref()),
                "last_error": last_error
            }),
        );
        false
    }

    fn check<P>(&mut self, predicate: P, failure: impl FnOnce(&Self) -> String) -> Result<(), HarnessError>
    where
        P: FnMut(Option<&BusValue>) -> Result<bool, HarnessError>,
    {
        if self.wait_until(self.timing.timeout, predicate) {
            Ok(())
        } else {
            Err(HarnessError::Assertion(failure(self)))
        }
    }

    pub fn assert_equal(&mut self, expected: impl Into<BusValue>) -> Result<(), HarnessError> {
        self.assert_equal_with(expected, identity)
    }

    /// Compares `accessor(value)` instead of the raw value.
    pub fn assert_equal_with<F>(
        &mut self,
        expected: impl Into<BusValue>,
        accessor: F,
    ) -> Result<(), HarnessError>
    where
        F: Fn(&BusValue) -> Result<BusValue, HarnessError>,
    {
        let expected = expected.into();
        self.check(
            |value| Ok(accessor(present(value)?)?.loose_eq(&expected)),
            |probe| {
                let seen = match probe.last_value().map(&accessor) {
                    Some(Ok(projected)) => projected.to_string(),
                    _ => describe(probe.last_value()),
                };
                format!("{seen} != {expected}")
            },
        )
    }

    pub fn assert_almost_equal(&mut self, expected: f64, delta: f64) -> Result<(), HarnessError> {
        self.assert_almost_equal_with(expected, delta, identity)
    }

    pub fn assert_almost_equal_with<F>(
        &mut self,
        expected: f64,
        delta: f64,
        accessor: F,
    ) -> Result<(), HarnessError>
    where
        F: Fn(&BusValue) -> Result<BusValue, HarnessError>,
    {
        self.check(
            |value| {
                let projected = accessor(present(value)?)?;
                let number = projected.as_f64().ok_or_else(|| {
                    HarnessError::Assertion(format!("{projected} is not a number"))
                })?;
                Ok((number - expected).abs() <= delta)
            },
            |probe| {
                let seen = match probe.last_value().map(&accessor) {
                    Some(Ok(projected)) => projected.to_string(),
                    _ => describe(probe.last_value()),
                };
                format!("{seen} is not almost equal to {expected} (delta = {delta})")
            },
        )
    }

    pub fn assert_greater(&mut self, bound: impl Into<BusValue>) -> Result<(), HarnessError> {
        let bound = bound.into();
        self.check(
            |value| Ok(present(value)?.compare(&bound)? == Ordering::Greater),
            |probe| format!("{} is not greater than {bound}", describe(probe.last_value())),
        )
    }

    pub fn assert_less(&mut self, bound: impl Into<BusValue>) -> Result<(), HarnessError> {
        let bound = bound.into();
        self.check(
            |value| Ok(present(value)?.compare(&bound)? == Ordering::Less),
            |probe| format!("{} is not less than {bound}", describe(probe.last_value())),
        )
    }

    pub fn assert_in(&mut self, candidates: &[BusValue]) -> Result<(), HarnessError> {
        self.check(
            |value| {
                let value = present(value)?;
                Ok(candidates.iter().any(|candidate| candidate.loose_eq(value)))
            },
            |probe| {
                format!(
                    "{} not found in {}",
                    describe(probe.last_value()),
                    describe_list(candidates)
                )
            },
        )
    }

    pub fn assert_not_in(&mut self, candidates: &[BusValue]) -> Result<(), HarnessError> {
        self.check(
            |value| {
                Ok(value.map_or(true, |value| {
                    !candidates.iter().any(|candidate| candidate.loose_eq(value))
                }))
            },
            |probe| {
                format!(
                    "{} unexpectedly found in {}",
                    describe(probe.last_value()),
                    describe_list(candidates)
                )
            },
        )
    }

    pub fn assert_true(&mut self) -> Result<(), HarnessError> {
        self.check(
            |value| Ok(value.is_some_and(BusValue::is_truthy)),
            |probe| format!("{} is not true", describe(probe.last_value())),
        )
    }

    pub fn assert_false(&mut self) -> Result<(), HarnessError> {
        self.check(
            |value| Ok(!value.is_some_and(BusValue::is_truthy)),
            |probe| format!("{} is not false", describe(probe.last_value())),
        )
    }

    pub fn assert_none(&mut self) -> Result<(), HarnessError> {
        self.check(
            |value| Ok(value.is_none()),
            |probe| format!("{} is not None", describe(probe.last_value())),
        )
    }

    pub fn assert_some(&mut self) -> Result<(), HarnessError> {
        self.check(
            |value| Ok(value.is_some()),
            |_| "unexpectedly None".to_string(),
        )
    }

    pub fn assert_len(&mut self, expected: usize) -> Result<(), HarnessError> {
        self.check(
            |value| {
                let value = present(value)?;
                let len = value.len().ok_or_else(|| {
                    HarnessError::Assertion(format!("{} has no length", value.type_name()))
                })?;
                Ok(len == expected)
            },
            |probe| match probe.last_value() {
                Some(value) => match value.len() {
                    Some(len) => {
                        format!("Expected length {expected}, but {value} has length {len}")
                    }
                    None => format!("{} has no length", value.type_name()),
                },
                None => "None has no length".to_string(),
            },
        )
    }
}
