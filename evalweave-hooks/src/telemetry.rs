//! Best-effort per-sample telemetry.
//!
//! Each extractor reads one optional value out of a finished sample. The
//! payload is loosely typed, so every extractor may fail; callers run them
//! independently and never let one failure affect another.

use serde_json::Value;

use crate::events::EvalSample;
use crate::format::stringify;

/// Metadata table the host's annotators write tool usage into.
pub const ANNOTATOR_METADATA: &str = "Annotator Metadata";
pub const TOOL_COUNT_KEY: &str = "Number of tools";
pub const TOOL_LIST_KEY: &str = "Tools";
/// Prediction attribute carrying the tool list.
pub const TOOL_LIST_ATTRIBUTE: &str = "Which tools";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TelemetryError {
    #[error("expected {expected} at {path}, found {found}")]
    UnexpectedType {
        path: String,
        expected: &'static str,
        found: String,
    },
}

/// One value pulled from a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEntry {
    /// Logged as a score on the prediction.
    Score { scorer: &'static str, value: Value },
    /// Set as an attribute on the prediction.
    Attribute { name: &'static str, value: String },
}

pub type ExtractFn = fn(&EvalSample) -> Result<Option<TelemetryEntry>, TelemetryError>;

/// A named lookup over a sample.
#[derive(Clone, Copy)]
pub struct Extractor {
    pub name: &'static str,
    pub extract: ExtractFn,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor").field("name", &self.name).finish()
    }
}

/// The extractors run for every sample, in order.
pub const SAMPLE_TELEMETRY: &[Extractor] = &[
    Extractor {
        name: "total_time",
        extract: total_time,
    },
    Extractor {
        name: "total_tokens",
        extract: total_tokens,
    },
    Extractor {
        name: "num_tool_calls",
        extract: num_tool_calls,
    },
    Extractor {
        name: "tool_list",
        extract: tool_list,
    },
];

fn total_time(sample: &EvalSample) -> Result<Option<TelemetryEntry>, TelemetryError> {
    Ok(sample.total_time.map(|secs| TelemetryEntry::Score {
        scorer: "total_time",
        value: Value::from(secs),
    }))
}

/// Only the first model that reports a total is used.
fn total_tokens(sample: &EvalSample) -> Result<Option<TelemetryEntry>, TelemetryError> {
    Ok(sample
        .model_usage
        .values()
        .find_map(|usage| usage.total_tokens)
        .map(|tokens| TelemetryEntry::Score {
            scorer: "total_tokens",
            value: Value::from(tokens),
        }))
}

fn num_tool_calls(sample: &EvalSample) -> Result<Option<TelemetryEntry>, TelemetryError> {
    let Some(raw) = lookup(&sample.metadata, &[ANNOTATOR_METADATA, TOOL_COUNT_KEY])? else {
        return Ok(None);
    };
    let count = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match count {
        Some(count) => Ok(Some(TelemetryEntry::Score {
            scorer: "num_tool_calls",
            value: Value::from(count),
        })),
        None => Err(TelemetryError::UnexpectedType {
            path: path_label(&[ANNOTATOR_METADATA, TOOL_COUNT_KEY]),
            expected: "an integer",
            found: raw.to_string(),
        }),
    }
}

fn tool_list(sample: &EvalSample) -> Result<Option<TelemetryEntry>, TelemetryError> {
    Ok(
        lookup(&sample.metadata, &[ANNOTATOR_METADATA, TOOL_LIST_KEY])?.map(|tools| {
            TelemetryEntry::Attribute {
                name: TOOL_LIST_ATTRIBUTE,
                value: stringify(tools),
            }
        }),
    )
}

/// Walk `path` through nested mappings.
///
/// A missing key anywhere yields `None`; a non-mapping in the middle of the
/// path is an error.
fn lookup<'a>(
    root: &'a serde_json::Map<String, Value>,
    path: &[&str],
) -> Result<Option<&'a Value>, TelemetryError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(None);
    };
    let mut current = root;
    for (depth, key) in parents.iter().enumerate() {
        match current.get(*key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(next)) => current = next,
            Some(other) => {
                return Err(TelemetryError::UnexpectedType {
                    path: path_label(&path[..=depth]),
                    expected: "a mapping",
                    found: other.to_string(),
                });
            }
        }
    }
    Ok(current.get(*last).filter(|v| !v.is_null()))
}

fn path_label(path: &[&str]) -> String {
    path.iter()
        .map(|key| format!("[{key:?}]"))
        .collect::<String>()
}
