use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Outcome of decoding an inbound payload for one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Canonical textual value for the field.
    Value(String),
    /// Payload was recognizable but invalid for this binding.
    Bad,
    /// Payload is not addressed to this binding; drop silently.
    Ignore,
}

/// Per-binding value translation, selected at configuration load.
///
/// One variant per supported payload shape. `decode` turns broker payload
/// bytes into the platform's canonical text form, `encode` does the reverse
/// for outbound writes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValueCodec {
    /// Two-token boolean. `on`/`off` are the wire payloads; the canonical
    /// field values are "True" and "False".
    Bool {
        #[serde(default = "ValueCodec::on_default")]
        on: String,
        #[serde(default = "ValueCodec::off_default")]
        off: String,
    },
    /// Decimal number, optionally range-checked.
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Raw UTF-8 text, passed through unchanged.
    Text,
    /// Text embedded in a fixed template, `${value}` marking the payload slot.
    /// Inbound payloads that do not match the template are ignored.
    Pattern { template: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("unrecognized value")]
    Unrecognized,
    #[error("value out of range")]
    OutOfRange,
}

impl ValueCodec {
    fn on_default() -> String {
        "1".into()
    }

    fn off_default() -> String {
        "0".into()
    }

    pub fn decode(&self, payload: &[u8]) -> Decoded {
        let text = match std::str::from_utf8(payload) {
            Ok(t) => t.trim(),
            Err(_) => return Decoded::Bad,
        };
        match self {
            ValueCodec::Bool { on, off } => {
                if text.eq_ignore_ascii_case(on) || is_truthy(text) {
                    Decoded::Value("True".into())
                } else if text.eq_ignore_ascii_case(off) || is_falsy(text) {
                    Decoded::Value("False".into())
                } else {
                    Decoded::Bad
                }
            }
            ValueCodec::Number { min, max } => match text.parse::<f64>() {
                Ok(v) if in_range(v, *min, *max) => Decoded::Value(render_number(v)),
                _ => Decoded::Bad,
            },
            ValueCodec::Text => Decoded::Value(text.to_owned()),
            ValueCodec::Pattern { template } => {
                let (prefix, suffix) = match template.split_once("${value}") {
                    Some(parts) => parts,
                    None => return Decoded::Ignore,
                };
                match text.strip_prefix(prefix).and_then(|rest| rest.strip_suffix(suffix)) {
                    Some(inner) => Decoded::Value(inner.to_owned()),
                    None => Decoded::Ignore,
                }
            }
        }
    }

    pub fn encode(&self, value: &str) -> Result<Bytes, ValueError> {
        let value = value.trim();
        match self {
            ValueCodec::Bool { on, off } => {
                if value.eq_ignore_ascii_case(on) || is_truthy(value) {
                    Ok(Bytes::from(on.clone()))
                } else if value.eq_ignore_ascii_case(off) || is_falsy(value) {
                    Ok(Bytes::from(off.clone()))
                } else {
                    Err(ValueError::Unrecognized)
                }
            }
            ValueCodec::Number { min, max } => {
                let v = value.parse::<f64>().map_err(|_| ValueError::Unrecognized)?;
                if !in_range(v, *min, *max) {
                    return Err(ValueError::OutOfRange);
                }
                Ok(Bytes::from(render_number(v)))
            }
            ValueCodec::Text => Ok(Bytes::from(value.to_owned())),
            ValueCodec::Pattern { template } => Ok(Bytes::from(template.replace("${value}", value))),
        }
    }
}

fn is_truthy(s: &str) -> bool {
    s == "1" || s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("on")
}

fn is_falsy(s: &str) -> bool {
    s == "0" || s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("off")
}

fn in_range(v: f64, min: Option<f64>, max: Option<f64>) -> bool {
    v.is_finite() && min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
}

fn render_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bool_codec(on: &str, off: &str) -> ValueCodec {
        ValueCodec::Bool { on: on.into(), off: off.into() }
    }

    #[test]
    fn test_bool_decode() {
        let c = bool_codec("1", "0");
        assert_eq!(c.decode(b"1"), Decoded::Value("True".into()));
        assert_eq!(c.decode(b"0"), Decoded::Value("False".into()));
        assert_eq!(c.decode(b"ON"), Decoded::Value("True".into()));
        assert_eq!(c.decode(b"maybe"), Decoded::Bad);
        assert_eq!(c.decode(b"\xff\xfe"), Decoded::Bad);
    }

    #[test]
    fn test_bool_encode() {
        let c = bool_codec("ON", "OFF");
        assert_eq!(c.encode("On").unwrap(), Bytes::from_static(b"ON"));
        assert_eq!(c.encode("True").unwrap(), Bytes::from_static(b"ON"));
        assert_eq!(c.encode("false").unwrap(), Bytes::from_static(b"OFF"));
        assert_eq!(c.encode("dim"), Err(ValueError::Unrecognized));
    }

    #[test]
    fn test_number() {
        let c = ValueCodec::Number { min: Some(0.0), max: Some(100.0) };
        assert_eq!(c.decode(b"42"), Decoded::Value("42".into()));
        assert_eq!(c.decode(b"42.5"), Decoded::Value("42.5".into()));
        assert_eq!(c.decode(b"142"), Decoded::Bad);
        assert_eq!(c.decode(b"abc"), Decoded::Bad);
        assert_eq!(c.encode("17.0").unwrap(), Bytes::from_static(b"17"));
        assert_eq!(c.encode("-1"), Err(ValueError::OutOfRange));
        assert_eq!(c.encode("abc"), Err(ValueError::Unrecognized));
    }

    #[test]
    fn test_text() {
        assert_eq!(ValueCodec::Text.decode(b"  hello "), Decoded::Value("hello".into()));
        assert_eq!(ValueCodec::Text.encode("hello").unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_pattern() {
        let c = ValueCodec::Pattern { template: "SET ${value};".into() };
        assert_eq!(c.decode(b"SET 21;"), Decoded::Value("21".into()));
        assert_eq!(c.decode(b"GET 21;"), Decoded::Ignore);
        assert_eq!(c.encode("21").unwrap(), Bytes::from_static(b"SET 21;"));
    }

    #[test]
    fn test_codec_from_toml() {
        let c: ValueCodec = toml::from_str(r#"type = "bool"
on = "ON"
off = "OFF""#)
            .unwrap();
        assert_eq!(c, bool_codec("ON", "OFF"));

        let c: ValueCodec = toml::from_str(r#"type = "number"
min = 0.0"#).unwrap();
        assert_eq!(c, ValueCodec::Number { min: Some(0.0), max: None });
    }
}
