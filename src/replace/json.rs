// JSON codec for payloads stored as JSON objects or arrays

use std::str::FromStr;

use serde_json::{Map, Number};

use super::value::{Key, Value};
use super::PayloadCodec;
use crate::error::{MigratorError, Result};

pub const CODEC_NAME: &str = "json";

/// Only objects and arrays are treated as payloads; a bare JSON scalar is
/// indistinguishable from ordinary text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn looks_serialized(&self, raw: &str) -> bool {
        let trimmed = raw.trim();
        (trimmed.starts_with('{') && trimmed.ends_with('}')) || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    }

    fn decode(&self, raw: &str) -> Result<Value> {
        let parsed: serde_json::Value = serde_json::from_str(raw)?;
        Ok(from_json(parsed))
    }

    fn encode(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(&to_json(value)?)?)
    }
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.to_string()),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::Seq(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Map(map.into_iter().map(|(k, v)| (Key::Str(k), from_json(v))).collect())
        }
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Value::Number(
            Number::from_str(f).map_err(|_| MigratorError::Codec(format!("json: '{}' is not a JSON number", f)))?,
        ),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Serialized(inner) => serde_json::Value::String(inner.raw.clone()),
        Value::Seq(items) => serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_>>()?),
        Value::Map(entries) | Value::Object { fields: entries, .. } => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.to_string(), to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_roundtrip_keeps_key_order() {
        let raw = r#"{"zeta":1,"alpha":["https://site/a.jpg",2.5,null,true]}"#;
        let codec = JsonCodec;
        assert!(codec.looks_serialized(raw));
        let value = codec.decode(raw).unwrap();
        assert_eq!(codec.encode(&value).unwrap(), raw);
    }

    #[test]
    fn test_scalars_are_not_payloads() {
        let codec = JsonCodec;
        assert!(!codec.looks_serialized("\"https://site/a.jpg\""));
        assert!(!codec.looks_serialized("42"));
    }

    #[test]
    fn test_invalid_json_fails() {
        assert!(JsonCodec.decode("{not json}").is_err());
    }
}
