// PHP serialize() codec
//
// Supports the subset the CMS writes into metadata: N; b: i: d: s: a: O:.
// String lengths are byte counts. Anything else (references, custom
// serializers, enums) is refused so the payload stays an opaque string.

use super::value::{Key, Value};
use super::PayloadCodec;
use crate::constants::MAX_PAYLOAD_DEPTH;
use crate::error::{MigratorError, Result};

pub const CODEC_NAME: &str = "php";

#[derive(Debug, Clone, Copy, Default)]
pub struct PhpCodec;

impl PayloadCodec for PhpCodec {
    fn name(&self) -> &'static str {
        CODEC_NAME
    }

    fn looks_serialized(&self, raw: &str) -> bool {
        if raw == "N;" {
            return true;
        }
        let bytes = raw.as_bytes();
        if bytes.len() < 4 || bytes[1] != b':' {
            return false;
        }
        match bytes[0] {
            b's' | b'i' | b'd' | b'b' => raw.ends_with(';'),
            b'a' | b'O' => raw.ends_with('}'),
            _ => false,
        }
    }

    fn decode(&self, raw: &str) -> Result<Value> {
        let mut parser = Parser { bytes: raw.as_bytes(), pos: 0, depth: 0 };
        let value = parser.value()?;
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing bytes"));
        }
        Ok(value)
    }

    fn encode(&self, value: &Value) -> Result<String> {
        let mut out = String::new();
        write_value(&mut out, value)?;
        Ok(out)
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> MigratorError {
        MigratorError::Codec(format!("php: {} at byte {}", what, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() != Some(byte) {
            return Err(self.error(&format!("expected '{}'", byte as char)));
        }
        self.pos += 1;
        Ok(())
    }

    /// Bytes up to (not including) `terminator`, consuming the terminator.
    fn until(&mut self, terminator: u8) -> Result<&'a str> {
        let start = self.pos;
        let rel = self.bytes[start..]
            .iter()
            .position(|b| *b == terminator)
            .ok_or_else(|| self.error(&format!("missing '{}'", terminator as char)))?;
        self.pos = start + rel + 1;
        std::str::from_utf8(&self.bytes[start..start + rel]).map_err(|_| self.error("invalid utf-8"))
    }

    fn int_until(&mut self, terminator: u8) -> Result<i64> {
        let text = self.until(terminator)?;
        text.parse::<i64>().map_err(|_| self.error("bad integer"))
    }

    fn len_until(&mut self, terminator: u8) -> Result<usize> {
        let text = self.until(terminator)?;
        text.parse::<usize>().map_err(|_| self.error("bad length"))
    }

    /// `<len>:"<bytes>"` with an exact byte length.
    fn quoted(&mut self) -> Result<String> {
        let len = self.len_until(b':')?;
        self.expect(b'"')?;
        let end = self.pos.checked_add(len).filter(|e| *e <= self.bytes.len()).ok_or_else(|| self.error("string overruns payload"))?;
        let text = std::str::from_utf8(&self.bytes[self.pos..end]).map_err(|_| self.error("invalid utf-8"))?;
        self.pos = end;
        self.expect(b'"')?;
        Ok(text.to_string())
    }

    fn value(&mut self) -> Result<Value> {
        let tag = self.peek().ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(Value::Null);
        }
        self.expect(b':')?;
        match tag {
            b'b' => match self.until(b';')? {
                "0" => Ok(Value::Bool(false)),
                "1" => Ok(Value::Bool(true)),
                _ => Err(self.error("bad boolean")),
            },
            b'i' => Ok(Value::Int(self.int_until(b';')?)),
            b'd' => {
                let text = self.until(b';')?;
                let valid = matches!(text, "INF" | "-INF" | "NAN") || text.parse::<f64>().is_ok();
                if !valid {
                    return Err(self.error("bad float"));
                }
                Ok(Value::Float(text.to_string()))
            }
            b's' => {
                let s = self.quoted()?;
                self.expect(b';')?;
                Ok(Value::Str(s))
            }
            b'a' => {
                let count = self.len_until(b':')?;
                let entries = self.entries(count)?;
                let sequential = entries
                    .iter()
                    .enumerate()
                    .all(|(i, (k, _))| *k == Key::Int(i as i64));
                if sequential {
                    Ok(Value::Seq(entries.into_iter().map(|(_, v)| v).collect()))
                } else {
                    Ok(Value::Map(entries))
                }
            }
            b'O' => {
                let class = self.quoted()?;
                self.expect(b':')?;
                let count = self.len_until(b':')?;
                let fields = self.entries(count)?;
                Ok(Value::Object { class, fields })
            }
            _ => Err(self.error("unsupported type")),
        }
    }

    fn entries(&mut self, count: usize) -> Result<Vec<(Key, Value)>> {
        if self.depth >= MAX_PAYLOAD_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let entries = self.entries_inner(count);
        self.depth -= 1;
        entries
    }

    fn entries_inner(&mut self, count: usize) -> Result<Vec<(Key, Value)>> {
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = match self.value()? {
                Value::Int(i) => Key::Int(i),
                Value::Str(s) => Key::Str(s),
                _ => return Err(self.error("bad array key")),
            };
            let value = self.value()?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        Ok(entries)
    }
}

fn write_str(out: &mut String, s: &str) {
    out.push_str(&format!("s:{}:\"{}\";", s.len(), s));
}

fn write_key(out: &mut String, key: &Key) {
    match key {
        Key::Int(i) => out.push_str(&format!("i:{};", i)),
        Key::Str(s) => write_str(out, s),
    }
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("N;"),
        Value::Bool(b) => out.push_str(if *b { "b:1;" } else { "b:0;" }),
        Value::Int(i) => out.push_str(&format!("i:{};", i)),
        Value::Float(f) => out.push_str(&format!("d:{};", f)),
        Value::Str(s) => write_str(out, s),
        Value::Serialized(inner) => write_str(out, &inner.raw),
        Value::Seq(items) => {
            out.push_str(&format!("a:{}:{{", items.len()));
            for (i, item) in items.iter().enumerate() {
                out.push_str(&format!("i:{};", i));
                write_value(out, item)?;
            }
            out.push('}');
        }
        Value::Map(entries) => {
            out.push_str(&format!("a:{}:{{", entries.len()));
            for (k, v) in entries {
                write_key(out, k);
                write_value(out, v)?;
            }
            out.push('}');
        }
        Value::Object { class, fields } => {
            out.push_str(&format!("O:{}:\"{}\":{}:{{", class.len(), class, fields.len()));
            for (k, v) in fields {
                write_key(out, k);
                write_value(out, v)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(raw: &str) -> Value {
        let codec = PhpCodec;
        assert!(codec.looks_serialized(raw), "not recognized: {}", raw);
        let value = codec.decode(raw).unwrap();
        assert_eq!(codec.encode(&value).unwrap(), raw);
        value
    }

    #[test]
    fn test_scalars() {
        assert_eq!(roundtrip("N;"), Value::Null);
        assert_eq!(roundtrip("b:1;"), Value::Bool(true));
        assert_eq!(roundtrip("i:-42;"), Value::Int(-42));
        assert_eq!(roundtrip("d:0.5;"), Value::Float("0.5".to_string()));
        assert_eq!(roundtrip("s:5:\"hello\";"), Value::str("hello"));
    }

    #[test]
    fn test_string_length_is_bytes() {
        assert_eq!(roundtrip("s:6:\"caf\u{e9};\";"), Value::str("caf\u{e9};"));
        assert!(PhpCodec.decode("s:4:\"caf\u{e9};\";").is_err());
    }

    #[test]
    fn test_sequential_array_is_seq() {
        let v = roundtrip("a:2:{i:0;s:1:\"a\";i:1;s:1:\"b\";}");
        assert_eq!(v, Value::Seq(vec![Value::str("a"), Value::str("b")]));
    }

    #[test]
    fn test_keyed_array_keeps_order() {
        let v = roundtrip("a:2:{s:4:\"file\";s:7:\"pic.jpg\";i:5;b:0;}");
        assert_eq!(
            v,
            Value::Map(vec![
                (Key::Str("file".to_string()), Value::str("pic.jpg")),
                (Key::Int(5), Value::Bool(false)),
            ])
        );
    }

    #[test]
    fn test_object() {
        let v = roundtrip("O:8:\"stdClass\":1:{s:3:\"url\";s:3:\"x/y\";}");
        assert!(matches!(v, Value::Object { ref class, .. } if class == "stdClass"));
    }

    #[test]
    fn test_malformed_is_rejected() {
        let codec = PhpCodec;
        assert!(codec.decode("a:2:{i:0;s:1:\"a\";}").is_err());
        assert!(codec.decode("s:10:\"short\";").is_err());
        assert!(codec.decode("i:1;extra").is_err());
        assert!(codec.decode("r:1;").is_err());
        assert!(!codec.looks_serialized("https://site/pic.jpg"));
        assert!(!codec.looks_serialized("plain text;"));
    }

    #[test]
    fn test_deep_nesting_is_refused() {
        let depth = MAX_PAYLOAD_DEPTH + 1;
        let raw = format!("{}s:1:\"x\";{}", "a:1:{i:0;".repeat(depth), "}".repeat(depth));
        assert!(PhpCodec.decode(&raw).is_err());

        let depth = MAX_PAYLOAD_DEPTH;
        let raw = format!("{}s:1:\"x\";{}", "a:1:{i:0;".repeat(depth), "}".repeat(depth));
        assert!(PhpCodec.decode(&raw).is_ok());
    }
}
