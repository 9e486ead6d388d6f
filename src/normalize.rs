//! Boundary normalisation for backend payloads.
//!
//! The API is inconsistent about field-name casing (`IMP_DEU`, `Imp_Deu`,
//! `imp_deu`) and about scalar types (amounts arrive as numbers, numeric
//! strings, `"-"` or `null`). Everything is lower-cased and coerced here, once,
//! so the rest of the crate works with typed records only.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ConsultaError, Result};

/// Recursively lower-case every object key. On collision the last key wins.
pub fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.to_lowercase(), lowercase_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Normalise keys, then deserialise into a typed record.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(lowercase_keys(value))?)
}

/// Normalise keys and deserialise a list. `null` is an empty list.
pub fn decode_list<T: DeserializeOwned>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => decode(value),
        other => Err(ConsultaError::Other(format!(
            "expected a list from the server, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Backend identifier, kept as the JSON scalar it arrived as so it can be sent
/// back verbatim (some sources key on numbers, others on strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(Value);

impl Ident {
    pub fn new(value: impl Into<Value>) -> Self {
        Ident(value.into())
    }

    /// Parse a user-typed identifier. Only canonical integers become numbers;
    /// anything else, `007` included, stays a string so it goes back as typed.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.parse::<i64>() {
            Ok(n) if n.to_string() == raw => Ident(Value::from(n)),
            _ => Ident(Value::from(raw)),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Textual form used as a map key and in URL path segments.
    pub fn key(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ---------------------------------------------------------------------------
// Lenient scalar coercion (used via `deserialize_with`)
// ---------------------------------------------------------------------------

pub mod lenient {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    /// Parse a currency-ish value. Missing or non-numeric values are zero.
    pub fn amount_of(value: &Value) -> f64 {
        match value {
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn amount<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(amount_of(&v))
    }

    /// `1`, `"1"` and `true` are set; everything else is clear.
    pub fn flag_of(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_i64() == Some(1) || n.as_f64() == Some(1.0),
            Value::String(s) => s.trim() == "1",
            _ => false,
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(flag_of(&v))
    }

    /// Like `flag`, but `null` stays unknown instead of reading as clear.
    pub fn opt_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok((!v.is_null()).then(|| flag_of(&v)))
    }

    /// Write flags back in the backend's 0/1 form.
    pub fn ser_flag<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn ser_opt_flag<S: Serializer>(value: &Option<bool>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(flag) => ser_flag(flag, s),
            None => s.serialize_none(),
        }
    }

    pub fn text_of(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(text_of(&v).unwrap_or_default())
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(text_of(&v))
    }
}

// ---------------------------------------------------------------------------
// Response envelopes
// ---------------------------------------------------------------------------

/// Shapes the receipts endpoint has been observed to return.
#[derive(Debug, PartialEq)]
pub enum ReceiptsEnvelope {
    /// `[{...}, ...]`
    Plain(Vec<Value>),
    /// `[[{...}, ...]]`
    Nested(Vec<Value>),
    /// `["[{...}, ...]"]`
    EncodedInArray(String),
    /// `"[{...}, ...]"`
    Encoded(String),
    /// `null` or an empty body.
    Empty,
}

const MAX_UNWRAP_DEPTH: usize = 4;

impl ReceiptsEnvelope {
    pub fn classify(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(ReceiptsEnvelope::Empty),
            Value::String(s) if s.trim().is_empty() => Ok(ReceiptsEnvelope::Empty),
            Value::String(s) => Ok(ReceiptsEnvelope::Encoded(s)),
            Value::Array(mut items) => {
                if items.len() == 1 {
                    match items.pop() {
                        Some(Value::Array(inner)) => return Ok(ReceiptsEnvelope::Nested(inner)),
                        Some(Value::String(s)) => return Ok(ReceiptsEnvelope::EncodedInArray(s)),
                        Some(other) => items.push(other),
                        None => {}
                    }
                }
                Ok(ReceiptsEnvelope::Plain(items))
            }
            Value::Object(_) => Ok(ReceiptsEnvelope::Plain(vec![value])),
            other => Err(ConsultaError::Other(format!(
                "unrecognised receipts response: {}",
                kind_of(&other)
            ))),
        }
    }

    /// Flatten to the plain list of receipt groups.
    pub fn into_groups(self) -> Result<Vec<Value>> {
        self.unwrap_at(0)
    }

    fn unwrap_at(self, depth: usize) -> Result<Vec<Value>> {
        if depth > MAX_UNWRAP_DEPTH {
            return Err(ConsultaError::Other(
                "receipts response is wrapped too deeply".to_string(),
            ));
        }
        match self {
            ReceiptsEnvelope::Plain(items) => Ok(items),
            ReceiptsEnvelope::Empty => Ok(Vec::new()),
            ReceiptsEnvelope::Nested(inner) => {
                ReceiptsEnvelope::classify(Value::Array(inner))?.unwrap_at(depth + 1)
            }
            ReceiptsEnvelope::EncodedInArray(s) | ReceiptsEnvelope::Encoded(s) => {
                let decoded: Value = serde_json::from_str(&s).map_err(|e| {
                    warn!(error = %e, "receipts payload string is not JSON");
                    ConsultaError::Other("receipts response could not be decoded".to_string())
                })?;
                ReceiptsEnvelope::classify(decoded)?.unwrap_at(depth + 1)
            }
        }
    }
}

/// Search results arrive as a list, as `{ "result": [...] }`, or as a single row.
pub fn search_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let result_key = map.keys().find(|k| k.eq_ignore_ascii_case("result")).cloned();
            if let Some(key) = result_key {
                if let Some(Value::Array(items)) = map.remove(&key) {
                    return items;
                }
            }
            if map.is_empty() {
                Vec::new()
            } else {
                vec![Value::Object(map)]
            }
        }
        _ => Vec::new(),
    }
}
