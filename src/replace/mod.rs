// Deep replacement of references inside structured values
//
// Values stored by the host may be plain strings or serialized payloads
// (PHP serialize, JSON), possibly nested inside each other. The replacer
// walks the decoded tree, substitutes leaf strings that exactly equal a map
// key, and re-encodes only the payloads whose content changed. Map keys,
// scalars and container shapes are never touched.

pub mod json;
pub mod php;
pub mod value;


use crate::constants::MAX_PAYLOAD_DEPTH;
use crate::error::{MigratorError, Result};
use crate::urlmap::UrlMap;

pub use json::JsonCodec;
pub use php::PhpCodec;
pub use value::{Key, Serialized, Shape, Value};

/// Decoder/encoder pair for one serialization format.
pub trait PayloadCodec {
    fn name(&self) -> &'static str;

    /// Cheap syntactic check run before attempting a full decode.
    fn looks_serialized(&self, raw: &str) -> bool;

    fn decode(&self, raw: &str) -> Result<Value>;

    fn encode(&self, value: &Value) -> Result<String>;
}

/// Codecs tried in order when a string might be a payload.
pub fn default_codecs() -> Vec<Box<dyn PayloadCodec>> {
    vec![Box::new(PhpCodec), Box::new(JsonCodec)]
}

/// Substrings that indicate a raw value may reference one of the map's keys.
/// JSON writers commonly escape `/` as `\/`, so both forms are included.
pub fn needles(map: &UrlMap) -> Vec<String> {
    let mut out = Vec::new();
    for (key, _) in map.iter() {
        out.push(key.to_string());
        let escaped = key.replace('/', "\\/");
        if escaped != key {
            out.push(escaped);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    pub value: Value,
    pub count: usize,
    pub paths: Vec<String>,
}

/// Result of replacing inside a raw stored string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReplacement {
    pub raw: String,
    pub count: usize,
    pub paths: Vec<String>,
}

pub struct DeepReplacer<'a> {
    map: &'a UrlMap,
    codecs: &'a [Box<dyn PayloadCodec>],
    needles: Vec<String>,
}

impl<'a> DeepReplacer<'a> {
    pub fn new(map: &'a UrlMap, codecs: &'a [Box<dyn PayloadCodec>]) -> Self {
        Self { map, codecs, needles: needles(map) }
    }

    fn codec(&self, name: &str) -> Result<&dyn PayloadCodec> {
        self.codecs
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
            .ok_or_else(|| MigratorError::Codec(format!("no codec named '{}'", name)))
    }

    fn try_decode(&self, raw: &str) -> Option<Serialized> {
        self.codecs.iter().find_map(|codec| {
            if !codec.looks_serialized(raw) {
                return None;
            }
            codec.decode(raw).ok().map(|inner| Serialized {
                codec: codec.name().to_string(),
                raw: raw.to_string(),
                inner,
            })
        })
    }

    /// Decode a raw stored value; strings no codec accepts stay plain.
    pub fn decode_raw(&self, raw: &str) -> Value {
        match self.try_decode(raw) {
            Some(serialized) => Value::Serialized(Box::new(serialized)),
            None => Value::Str(raw.to_string()),
        }
    }

    pub fn apply(&self, value: &Value) -> Result<Replaced> {
        let mut count = 0;
        let mut paths = Vec::new();
        let value = self.walk(value, "$", 0, &mut count, &mut paths)?;
        Ok(Replaced { value, count, paths })
    }

    /// Replace inside a raw stored string. `None` when nothing matched.
    pub fn apply_raw(&self, raw: &str) -> Result<Option<RawReplacement>> {
        if !self.mentions_key(raw) {
            return Ok(None);
        }
        let out = self.apply(&Value::Str(raw.to_string()))?;
        if out.count == 0 {
            return Ok(None);
        }
        let raw = match out.value {
            Value::Str(s) => s,
            other => return Err(MigratorError::Codec(format!("unexpected top-level value {:?}", other.shape()))),
        };
        Ok(Some(RawReplacement { raw, count: out.count, paths: out.paths }))
    }

    fn mentions_key(&self, s: &str) -> bool {
        self.needles.iter().any(|n| s.contains(n.as_str()))
    }

    fn walk(&self, value: &Value, path: &str, depth: usize, count: &mut usize, paths: &mut Vec<String>) -> Result<Value> {
        if depth > MAX_PAYLOAD_DEPTH {
            return Ok(value.clone());
        }
        Ok(match value {
            Value::Str(s) => {
                if let Some(new) = self.map.get(s) {
                    *count += 1;
                    paths.push(path.to_string());
                    Value::Str(new.to_string())
                } else if self.mentions_key(s) {
                    // A string leaf may itself hold a nested payload
                    match self.try_decode(s) {
                        Some(nested) => {
                            let before = *count;
                            let replaced = self.walk_serialized(&nested, path, depth + 1, count, paths)?;
                            if *count > before {
                                Value::Str(replaced.raw)
                            } else {
                                value.clone()
                            }
                        }
                        None => value.clone(),
                    }
                } else {
                    value.clone()
                }
            }
            Value::Seq(items) => Value::Seq(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.walk(item, &format!("{}[{}]", path, i), depth + 1, count, paths))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(entries) => Value::Map(self.walk_entries(entries, path, depth + 1, count, paths)?),
            Value::Object { class, fields } => Value::Object {
                class: class.clone(),
                fields: self.walk_entries(fields, path, depth + 1, count, paths)?,
            },
            Value::Serialized(s) => Value::Serialized(Box::new(self.walk_serialized(s, path, depth + 1, count, paths)?)),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => value.clone(),
        })
    }

    fn walk_entries(
        &self,
        entries: &[(Key, Value)],
        path: &str,
        depth: usize,
        count: &mut usize,
        paths: &mut Vec<String>,
    ) -> Result<Vec<(Key, Value)>> {
        entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.walk(v, &value::child_path(path, k), depth, count, paths)?)))
            .collect()
    }

    /// Recurse into a payload; unchanged payloads keep their original bytes.
    fn walk_serialized(
        &self,
        serialized: &Serialized,
        path: &str,
        depth: usize,
        count: &mut usize,
        paths: &mut Vec<String>,
    ) -> Result<Serialized> {
        let before = *count;
        let inner = self.walk(&serialized.inner, &format!("{}<{}>", path, serialized.codec), depth, count, paths)?;
        if *count == before {
            return Ok(serialized.clone());
        }
        let raw = self.codec(&serialized.codec)?.encode(&inner)?;
        Ok(Serialized { codec: serialized.codec.clone(), raw, inner })
    }
}
