//! Conversions for the service's NUL-terminated byte-array strings (`ay`).

use crate::bus::BusValue;
use crate::errors::HarnessError;

pub fn str_to_ay(text: &str) -> BusValue {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    BusValue::Bytes(bytes)
}

/// Drops the trailing NUL, if any, and decodes the rest as UTF-8.
pub fn ay_to_str(value: &BusValue) -> Result<String, HarnessError> {
    let bytes: Vec<u8> = match value {
        BusValue::Bytes(bytes) => bytes.clone(),
        BusValue::Array(items) => items
            .iter()
            .map(|item| match item {
                BusValue::Byte(byte) => Ok(*byte),
                other => Err(HarnessError::Bus(format!("{} is not a byte", other.type_name()))),
            })
            .collect::<Result<_, _>>()?,
        BusValue::Variant(inner) => return ay_to_str(inner),
        other => {
            return Err(HarnessError::Bus(format!(
                "{} is not a byte array",
                other.type_name()
            )))
        }
    };
    let text = bytes.strip_suffix(&[0]).unwrap_or(&bytes[..]);
    String::from_utf8(text.to_vec()).map_err(|e| HarnessError::Bus(e.to_string()))
}
