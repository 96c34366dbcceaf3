//! Shaping host values into what the tracing backend accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FormatError;

/// A score value ready for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreShape {
    Scalar(Value),
    Mapping(serde_json::Map<String, Value>),
}

impl ScoreShape {
    fn wrapped(value: Value) -> Self {
        let mut map = serde_json::Map::new();
        map.insert("score".to_string(), value);
        ScoreShape::Mapping(map)
    }

    pub fn into_value(self) -> Value {
        match self {
            ScoreShape::Scalar(v) => v,
            ScoreShape::Mapping(m) => Value::Object(m),
        }
    }
}

/// Format a raw score value.
///
/// Strings become `{"score": s}`, integers and booleans become floats, a one-element
/// list becomes `{"score": element}`, mappings are copied and anything else
/// passes through. Lists of any other length are rejected.
pub fn format_score(value: &Value) -> Result<ScoreShape, FormatError> {
    match value {
        Value::String(_) => Ok(ScoreShape::wrapped(value.clone())),
        Value::Bool(b) => Ok(ScoreShape::Scalar(Value::from(if *b { 1.0 } else { 0.0 }))),
        Value::Number(n) if n.is_i64() || n.is_u64() => match n.as_f64() {
            Some(f) => Ok(ScoreShape::Scalar(Value::from(f))),
            None => Ok(ScoreShape::Scalar(value.clone())),
        },
        Value::Array(items) => match items.as_slice() {
            [only] => Ok(ScoreShape::wrapped(only.clone())),
            _ => Err(FormatError::SequenceLength { len: items.len() }),
        },
        Value::Object(map) => Ok(ScoreShape::Mapping(map.clone())),
        _ => Ok(ScoreShape::Scalar(value.clone())),
    }
}

/// Turn a host model name into a backend-safe label.
///
/// `openai/gpt-4.1-mini` becomes `openai__gpt_4__1_mini`.
pub fn format_model_name(model: &str) -> String {
    let mut label = String::with_capacity(model.len());
    for c in model.chars() {
        match c {
            '/' | '.' | ':' | '@' => label.push_str("__"),
            '-' => label.push('_'),
            _ => label.push(c),
        }
    }
    label
}

/// Render a metadata value as a string attribute.
///
/// Strings are kept verbatim; everything else is rendered as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
