//! Lenient deserializers for server payloads.
//!
//! The progress stream is produced by a different codebase and does not
//! always honour its own contract: percentages arrive as strings, as
//! floats, as `"NaN"` or outside `0..=100`, ids arrive as numbers. These
//! helpers normalise such values instead of rejecting the whole message.

use std::collections::HashMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::fields::FieldValue;
use crate::progress::{JobStatus, Stage};
use crate::types::FieldId;

/// Clamp a raw percentage into `0..=100`, mapping `NaN` to `0`.
pub fn clamp_progress(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, 100.0).round() as u8
}

/// Coerce an arbitrary JSON value into a percentage.
///
/// Returns `None` only for JSON `null`; every other shape yields a value
/// in `0..=100` (unparseable strings and non-scalars become `0`).
pub fn coerce_progress(value: &Value) -> Option<u8> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(n.as_f64().map(clamp_progress).unwrap_or(0)),
        Value::String(s) => Some(s.trim().parse::<f64>().map(clamp_progress).unwrap_or(0)),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => Some(0),
    }
}

/// Percentage that defaults to `0` when null.
pub fn progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_progress(&value).unwrap_or(0))
}

/// Percentage that stays `None` when null (persisted snapshots).
pub fn progress_opt<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_progress(&value))
}

/// Job status with unknown spellings mapped via [`JobStatus::from_wire`].
pub fn status<'de, D>(deserializer: D) -> Result<JobStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => JobStatus::from_wire(&s),
        _ => JobStatus::default(),
    })
}

/// Stage name, normalised; empty and non-string values become `None`.
pub fn stage_opt<'de, D>(deserializer: D) -> Result<Option<Stage>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Stage::new(s),
        _ => None,
    })
}

/// Required opaque identifier; accepts strings and integers.
pub fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| D::Error::custom(format!("invalid identifier: {value}")))
}

/// Optional opaque identifier; null, empty and non-scalar values become `None`.
pub fn opaque_id_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(id_from_value(&value))
}

/// Free-form text where `null` means empty.
pub fn string_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Optional free-form text; null and blank strings become `None`.
pub fn text_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Field map that keeps scalar values and skips anything else.
pub fn scalar_fields<'de, D>(deserializer: D) -> Result<HashMap<FieldId, FieldValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<HashMap<FieldId, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(id, value)| FieldValue::from_json(&value).map(|v| (id, v)))
        .collect())
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
