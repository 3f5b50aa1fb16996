// Typed tree for structured payloads found in the store

use std::fmt;

/// Key of a map entry. PHP arrays distinguish integer and string keys and
/// both must survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

/// A nested payload kept in its original byte form alongside its decoded tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Serialized {
    /// Name of the codec that produced `inner` (see `PayloadCodec::name`).
    pub codec: String,
    pub raw: String,
    pub inner: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Lexical form as it appeared in the payload, so re-encoding is exact.
    Float(String),
    Str(String),
    Seq(Vec<Value>),
    Map(Vec<(Key, Value)>),
    /// PHP object: class name plus ordered properties.
    Object { class: String, fields: Vec<(Key, Value)> },
    Serialized(Box<Serialized>),
}

/// Structural fingerprint of a value: every node's kind, container lengths,
/// map keys and non-string scalars, with string contents left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Null,
    Bool(bool),
    Int(i64),
    Float(String),
    Str,
    Seq(Vec<Shape>),
    Map(Vec<(Key, Shape)>),
    Object { class: String, fields: Vec<(Key, Shape)> },
    Serialized { codec: String, inner: Box<Shape> },
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Raw string form of a top-level value, if it has one.
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Serialized(s) => Some(&s.raw),
            _ => None,
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Null => Shape::Null,
            Value::Bool(b) => Shape::Bool(*b),
            Value::Int(i) => Shape::Int(*i),
            Value::Float(f) => Shape::Float(f.clone()),
            Value::Str(_) => Shape::Str,
            Value::Seq(items) => Shape::Seq(items.iter().map(Value::shape).collect()),
            Value::Map(entries) => Shape::Map(entries.iter().map(|(k, v)| (k.clone(), v.shape())).collect()),
            Value::Object { class, fields } => Shape::Object {
                class: class.clone(),
                fields: fields.iter().map(|(k, v)| (k.clone(), v.shape())).collect(),
            },
            Value::Serialized(s) => Shape::Serialized {
                codec: s.codec.clone(),
                inner: Box::new(s.inner.shape()),
            },
        }
    }

    /// Every string leaf with its path, depth first.
    pub fn string_leaves(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        collect_leaves(self, "$".to_string(), &mut out);
        out
    }
}

fn collect_leaves<'a>(value: &'a Value, path: String, out: &mut Vec<(String, &'a str)>) {
    match value {
        Value::Str(s) => out.push((path, s)),
        Value::Seq(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_leaves(item, format!("{}[{}]", path, i), out);
            }
        }
        Value::Map(entries) | Value::Object { fields: entries, .. } => {
            for (k, v) in entries {
                collect_leaves(v, child_path(&path, k), out);
            }
        }
        Value::Serialized(s) => collect_leaves(&s.inner, format!("{}<{}>", path, s.codec), out),
        _ => {}
    }
}

pub(crate) fn child_path(parent: &str, key: &Key) -> String {
    match key {
        Key::Int(i) => format!("{}[{}]", parent, i),
        Key::Str(s) => format!("{}.{}", parent, s),
    }
}
