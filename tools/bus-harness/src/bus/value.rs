//! Dynamically typed bus values.
//!
//! Properties arrive untyped from the transport, so assertions compare them
//! loosely: integers of different widths compare by value, object paths and
//! signatures compare like strings, and variants are looked through.

use crate::errors::HarnessError;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Bytes(Vec<u8>),
    Array(Vec<BusValue>),
    /// String-keyed dictionary of variants (`a{sv}`), the shape of option maps.
    Dict(BTreeMap<String, BusValue>),
    Struct(Vec<BusValue>),
    Variant(Box<BusValue>),
}

impl BusValue {
    pub fn empty_options() -> Self {
        Self::Dict(BTreeMap::new())
    }

    pub fn signature(&self) -> String {
        match self {
            Self::Bool(_) => "b".to_string(),
            Self::Byte(_) => "y".to_string(),
            Self::Int16(_) => "n".to_string(),
            Self::UInt16(_) => "q".to_string(),
            Self::Int32(_) => "i".to_string(),
            Self::UInt32(_) => "u".to_string(),
            Self::Int64(_) => "x".to_string(),
            Self::UInt64(_) => "t".to_string(),
            Self::Double(_) => "d".to_string(),
            Self::Str(_) => "s".to_string(),
            Self::ObjectPath(_) => "o".to_string(),
            Self::Signature(_) => "g".to_string(),
            Self::Bytes(_) => "ay".to_string(),
            Self::Array(items) => match items.first() {
                Some(first) => format!("a{}", first.signature()),
                None => "as".to_string(),
            },
            Self::Dict(_) => "a{sv}".to_string(),
            Self::Struct(fields) => {
                let inner: String = fields.iter().map(BusValue::signature).collect();
                format!("({inner})")
            }
            Self::Variant(_) => "v".to_string(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Byte(_) => "byte",
            Self::Int16(_) => "int16",
            Self::UInt16(_) => "uint16",
            Self::Int32(_) => "int32",
            Self::UInt32(_) => "uint32",
            Self::Int64(_) => "int64",
            Self::UInt64(_) => "uint64",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
            Self::ObjectPath(_) => "object path",
            Self::Signature(_) => "signature",
            Self::Bytes(_) => "byte array",
            Self::Array(_) => "array",
            Self::Dict(_) => "dict",
            Self::Struct(_) => "struct",
            Self::Variant(inner) => inner.type_name(),
        }
    }

    fn unwrapped(&self) -> &BusValue {
        match self {
            Self::Variant(inner) => inner.unwrapped(),
            other => other,
        }
    }

    fn as_integer(&self) -> Option<i128> {
        match self.unwrapped() {
            Self::Byte(v) => Some(i128::from(*v)),
            Self::Int16(v) => Some(i128::from(*v)),
            Self::UInt16(v) => Some(i128::from(*v)),
            Self::Int32(v) => Some(i128::from(*v)),
            Self::UInt32(v) => Some(i128::from(*v)),
            Self::Int64(v) => Some(i128::from(*v)),
            Self::UInt64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.unwrapped() {
            Self::Double(v) => Some(*v),
            other => other.as_integer().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrapped() {
            Self::Str(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unwrapped() {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Equality that ignores integer width and string flavour.
    pub fn loose_eq(&self, other: &BusValue) -> bool {
        let (left, right) = (self.unwrapped(), other.unwrapped());
        if let (Some(a), Some(b)) = (left.as_integer(), right.as_integer()) {
            return a == b;
        }
        if matches!(left, Self::Double(_)) || matches!(right, Self::Double(_)) {
            return match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
        }
        if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
            return a == b;
        }
        match (left, right) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Bytes(bytes), Self::Array(items)) | (Self::Array(items), Self::Bytes(bytes)) => {
                bytes.len() == items.len()
                    && bytes
                        .iter()
                        .zip(items)
                        .all(|(byte, item)| Self::Byte(*byte).loose_eq(item))
            }
            (Self::Array(a), Self::Array(b)) | (Self::Struct(a), Self::Struct(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Self::Dict(a), Self::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.get(key).is_some_and(|other| value.loose_eq(other)))
            }
            _ => false,
        }
    }

    /// Ordering for numbers and strings; anything else is incomparable.
    pub fn compare(&self, other: &BusValue) -> Result<Ordering, HarnessError> {
        let (left, right) = (self.unwrapped(), other.unwrapped());
        if let (Some(a), Some(b)) = (left.as_integer(), right.as_integer()) {
            return Ok(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
            return a.partial_cmp(&b).ok_or_else(|| {
                HarnessError::Assertion(format!("{left} and {right} are unordered"))
            });
        }
        if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
            return Ok(a.cmp(b));
        }
        Err(HarnessError::Assertion(format!(
            "cannot order {} against {}",
            left.type_name(),
            right.type_name()
        )))
    }

    /// Zero, empty and false are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self.unwrapped() {
            Self::Bool(v) => *v,
            Self::Double(v) => *v != 0.0,
            Self::Str(s) | Self::ObjectPath(s) | Self::Signature(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Array(items) | Self::Struct(items) => !items.is_empty(),
            Self::Dict(entries) => !entries.is_empty(),
            other => other.as_integer().is_some_and(|v| v != 0),
        }
    }

    /// Element count for sized values; `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self.unwrapped() {
            Self::Str(s) | Self::ObjectPath(s) | Self::Signature(s) => Some(s.chars().count()),
            Self::Bytes(b) => Some(b.len()),
            Self::Array(items) | Self::Struct(items) => Some(items.len()),
            Self::Dict(entries) => Some(entries.len()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BusValue> {
        match self.unwrapped() {
            Self::Dict(entries) => entries.get(key).map(BusValue::unwrapped),
            _ => None,
        }
    }

    /// Best guess at a typed value for a command-line literal.
    pub fn parse_literal(text: &str) -> Self {
        match text {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(v) = text.parse::<i64>() {
            return Self::Int64(v);
        }
        if let Ok(v) = text.parse::<u64>() {
            return Self::UInt64(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return Self::Double(v);
        }
        if text.starts_with('/') {
            return Self::ObjectPath(text.to_string());
        }
        Self::Str(text.to_string())
    }

    /// Decodes busctl's `--json` rendering of a value of signature `sig`.
    pub fn from_busctl_json(sig: &str, data: &Value) -> Result<Self, HarnessError> {
        let bad = || HarnessError::Bus(format!("value {data} does not match signature {sig}"));
        let int = || data.as_i64().ok_or_else(bad);
        let uint = || data.as_u64().ok_or_else(bad);
        let string = || data.as_str().map(str::to_string).ok_or_else(bad);

        let value = match sig {
            "b" => Self::Bool(data.as_bool().ok_or_else(bad)?),
            "y" => Self::Byte(u8::try_from(uint()?).map_err(|_| bad())?),
            "n" => Self::Int16(i16::try_from(int()?).map_err(|_| bad())?),
            "q" => Self::UInt16(u16::try_from(uint()?).map_err(|_| bad())?),
            "i" => Self::Int32(i32::try_from(int()?).map_err(|_| bad())?),
            "u" | "h" => Self::UInt32(u32::try_from(uint()?).map_err(|_| bad())?),
            "x" => Self::Int64(int()?),
            "t" => Self::UInt64(uint()?),
            "d" => Self::Double(data.as_f64().ok_or_else(bad)?),
            "s" => Self::Str(string()?),
            "o" => Self::ObjectPath(string()?),
            "g" => Self::Signature(string()?),
            "v" => {
                let inner_sig = data
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(bad)?;
                let inner = data.get("data").ok_or_else(bad)?;
                Self::Variant(Box::new(Self::from_busctl_json(inner_sig, inner)?))
            }
            "ay" => {
                let items = data.as_array().ok_or_else(bad)?;
                let bytes = items
                    .iter()
                    .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(bad)?;
                Self::Bytes(bytes)
            }
            _ if sig.starts_with("a{") => {
                let entry = sig
                    .strip_prefix("a{")
                    .and_then(|rest| rest.strip_suffix('}'))
                    .ok_or_else(bad)?;
                let (key_sig, value_sig) = split_complete_type(entry)?;
                let object = data.as_object().ok_or_else(bad)?;
                let mut entries = BTreeMap::new();
                for (key, raw) in object {
                    if key_sig.is_empty() {
                        return Err(bad());
                    }
                    entries.insert(key.clone(), Self::from_busctl_json(value_sig, raw)?);
                }
                Self::Dict(entries)
            }
            _ if sig.starts_with('a') => {
                let element = &sig[1..];
                let items = data.as_array().ok_or_else(bad)?;
                Self::Array(
                    items
                        .iter()
                        .map(|item| Self::from_busctl_json(element, item))
                        .collect::<Result<_, _>>()?,
                )
            }
            _ if sig.starts_with('(') => {
                let body = sig
                    .strip_prefix('(')
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(bad)?;
                let fields = split_signature(body)?;
                let items = data.as_array().ok_or_else(bad)?;
                if fields.len() != items.len() {
                    return Err(bad());
                }
                Self::Struct(
                    fields
                        .iter()
                        .zip(items)
                        .map(|(field, item)| Self::from_busctl_json(field, item))
                        .collect::<Result<_, _>>()?,
                )
            }
            _ => {
                return Err(HarnessError::Bus(format!("unsupported signature {sig}")));
            }
        };
        Ok(value)
    }

    /// Appends this value in busctl's positional argument syntax.
    pub fn push_busctl_args(&self, out: &mut Vec<String>) {
        match self {
            Self::Bool(v) => out.push(v.to_string()),
            Self::Byte(v) => out.push(v.to_string()),
            Self::Int16(v) => out.push(v.to_string()),
            Self::UInt16(v) => out.push(v.to_string()),
            Self::Int32(v) => out.push(v.to_string()),
            Self::UInt32(v) => out.push(v.to_string()),
            Self::Int64(v) => out.push(v.to_string()),
            Self::UInt64(v) => out.push(v.to_string()),
            Self::Double(v) => out.push(v.to_string()),
            Self::Str(s) | Self::ObjectPath(s) | Self::Signature(s) => out.push(s.clone()),
            Self::Bytes(bytes) => {
                out.push(bytes.len().to_string());
                out.extend(bytes.iter().map(u8::to_string));
            }
            Self::Array(items) => {
                out.push(items.len().to_string());
                for item in items {
                    item.push_busctl_args(out);
                }
            }
            Self::Dict(entries) => {
                out.push(entries.len().to_string());
                for (key, value) in entries {
                    out.push(key.clone());
                    let inner = value.unwrapped();
                    out.push(inner.signature());
                    inner.push_busctl_args(out);
                }
            }
            Self::Struct(fields) => {
                for field in fields {
                    field.push_busctl_args(out);
                }
            }
            Self::Variant(inner) => {
                out.push(inner.signature());
                inner.push_busctl_args(out);
            }
        }
    }
}

/// Splits the first complete type off a signature: `"a{sv}s"` → `("a{sv}", "s")`.
pub fn split_complete_type(sig: &str) -> Result<(&str, &str), HarnessError> {
    if !sig.is_ascii() {
        return Err(HarnessError::Bus(format!("invalid signature {sig}")));
    }
    let bytes = sig.as_bytes();
    let Some(&first) = bytes.first() else {
        return Ok(("", ""));
    };
    let end = match first {
        b'a' => {
            let (element, _) = split_complete_type(&sig[1..])?;
            if element.is_empty() {
                return Err(HarnessError::Bus(format!("truncated array signature {sig}")));
            }
            1 + element.len()
        }
        b'(' | b'{' => {
            let close = if first == b'(' { b')' } else { b'}' };
            let mut depth = 0usize;
            let mut end = None;
            for (index, byte) in bytes.iter().enumerate() {
                if *byte == first {
                    depth += 1;
                } else if *byte == close {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(index + 1);
                        break;
                    }
                }
            }
            end.ok_or_else(|| HarnessError::Bus(format!("unbalanced signature {sig}")))?
        }
        _ => 1,
    };
    Ok(sig.split_at(end))
}

pub fn split_signature(sig: &str) -> Result<Vec<&str>, HarnessError> {
    let mut types = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        let (head, tail) = split_complete_type(rest)?;
        types.push(head);
        rest = tail;
    }
    Ok(types)
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[BusValue]) -> fmt::Result {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Byte(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Str(s) | Self::ObjectPath(s) | Self::Signature(s) => f.write_str(s),
            Self::Bytes(bytes) => {
                f.write_str("[")?;
                for (index, byte) in bytes.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{byte}")?;
                }
                f.write_str("]")
            }
            Self::Array(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Self::Dict(entries) => {
                f.write_str("{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Struct(fields) => {
                f.write_str("(")?;
                write_joined(f, fields)?;
                f.write_str(")")
            }
            Self::Variant(inner) => write!(f, "{inner}"),
        }
    }
}

impl From<bool> for BusValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u8> for BusValue {
    fn from(value: u8) -> Self {
        Self::Byte(value)
    }
}

impl From<i32> for BusValue {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<u32> for BusValue {
    fn from(value: u32) -> Self {
        Self::UInt32(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<u64> for BusValue {
    fn from(value: u64) -> Self {
        Self::UInt64(value)
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<BusValue>> for BusValue {
    fn from(value: Vec<BusValue>) -> Self {
        Self::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{split_signature, BusValue};
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn integers_compare_across_widths() {
        assert!(BusValue::UInt32(5).loose_eq(&BusValue::Int64(5)));
        assert!(BusValue::Byte(7).loose_eq(&BusValue::Variant(Box::new(BusValue::UInt64(7)))));
        assert!(BusValue::Int32(2).loose_eq(&BusValue::Double(2.0)));
        assert!(!BusValue::Int32(2).loose_eq(&BusValue::Str("2".to_string())));
        assert!(BusValue::ObjectPath("/a".to_string()).loose_eq(&BusValue::from("/a")));
    }

    #[test]
    fn ordering_rejects_mixed_kinds() {
        assert_eq!(
            BusValue::UInt64(10).compare(&BusValue::Int32(3)).expect("ordered"),
            Ordering::Greater
        );
        assert!(BusValue::Bool(true).compare(&BusValue::Int32(3)).is_err());
        assert!(BusValue::Array(vec![]).compare(&BusValue::from("a")).is_err());
    }

    #[test]
    fn scalars_have_no_length() {
        assert_eq!(BusValue::UInt64(10).len(), None);
        assert_eq!(BusValue::from("héllo").len(), Some(5));
        assert_eq!(BusValue::Bytes(vec![1, 2, 0]).len(), Some(3));
    }

    #[test]
    fn truthiness_follows_emptiness_and_zero() {
        assert!(!BusValue::UInt32(0).is_truthy());
        assert!(BusValue::UInt32(3).is_truthy());
        assert!(!BusValue::from("").is_truthy());
        assert!(!BusValue::empty_options().is_truthy());
        assert!(BusValue::Bool(true).is_truthy());
    }

    #[test]
    fn decodes_busctl_json_shapes() {
        let value = BusValue::from_busctl_json(
            "a{sv}",
            &json!({"size": {"type": "t", "data": 1024}, "label": {"type": "s", "data": "x"}}),
        )
        .expect("dict");
        assert!(value.get("size").expect("size").loose_eq(&BusValue::UInt64(1024)));

        let value = BusValue::from_busctl_json("a(sa{sv})", &json!([["a", {}], ["b", {}]]))
            .expect("array of struct");
        assert_eq!(value.len(), Some(2));

        let value = BusValue::from_busctl_json("ay", &json!([104, 105, 0])).expect("bytes");
        assert_eq!(value, BusValue::Bytes(vec![104, 105, 0]));

        assert!(BusValue::from_busctl_json("u", &json!("nope")).is_err());
    }

    #[test]
    fn malformed_signatures_are_bus_errors() {
        for sig in ["a{", "(", "a(", "a{s", "(ou", "a", "é"] {
            let err = BusValue::from_busctl_json(sig, &json!({})).expect_err(sig);
            assert!(matches!(err, crate::errors::HarnessError::Bus(_)), "{sig}");
        }
        assert!(BusValue::from_busctl_json("(", &json!([])).is_err());
        assert!(BusValue::from_busctl_json("a(", &json!([[1]])).is_err());
    }

    #[test]
    fn encodes_busctl_arguments() {
        let mut args = Vec::new();
        BusValue::Bool(true).push_busctl_args(&mut args);
        let mut options = std::collections::BTreeMap::new();
        options.insert("force".to_string(), BusValue::Bool(true));
        BusValue::Dict(options).push_busctl_args(&mut args);
        BusValue::Bytes(vec![65, 0]).push_busctl_args(&mut args);
        assert_eq!(args, ["true", "1", "force", "b", "true", "2", "65", "0"]);
    }

    #[test]
    fn splits_signatures_into_complete_types() {
        assert_eq!(
            split_signature("sa{sv}(ou)ay").expect("split"),
            ["s", "a{sv}", "(ou)", "ay"]
        );
        assert!(split_signature("(ou").is_err());
    }

    #[test]
    fn parses_cli_literals() {
        assert_eq!(BusValue::parse_literal("true"), BusValue::Bool(true));
        assert_eq!(BusValue::parse_literal("-3"), BusValue::Int64(-3));
        assert_eq!(BusValue::parse_literal("1.5"), BusValue::Double(1.5));
        assert_eq!(
            BusValue::parse_literal("/org/x"),
            BusValue::ObjectPath("/org/x".to_string())
        );
        assert_eq!(BusValue::parse_literal("ext4"), BusValue::from("ext4"));
    }
}
