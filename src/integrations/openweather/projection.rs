//! Field path evaluation against a One Call payload.
//!
//! A path is a dot-separated list of segments. Object segments are keys,
//! array segments are non-negative indices. Any step that does not fit the
//! shape of the payload yields `None`, never an error.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;

/// Post-traversal conversion applied to a resolved raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    None,
    /// 0..1 fraction exposed as a percentage.
    Percentage,
    /// Unix epoch seconds (UTC).
    Timestamp,
}

/// Walk `path` through `payload`.
pub fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get(idx)),
        _ => None,
    })
}

/// Resolve `path` and apply `transform`. JSON `null` counts as absent.
pub fn evaluate(payload: &Value, path: &str, transform: Transform) -> Option<Value> {
    let raw = resolve_path(payload, path)?;
    if raw.is_null() {
        return None;
    }
    match transform {
        Transform::None => Some(raw.clone()),
        Transform::Percentage => {
            let pct = round_to(raw.as_f64()? * 100.0, 2);
            serde_json::Number::from_f64(pct).map(Value::Number)
        }
        Transform::Timestamp => epoch_to_utc(raw).map(|ts| Value::String(ts.to_rfc3339())),
    }
}

/// Interpret a numeric JSON value as epoch seconds.
pub fn epoch_to_utc(raw: &Value) -> Option<DateTime<Utc>> {
    let secs = match raw.as_i64() {
        Some(secs) => secs,
        None => raw.as_f64()? as i64,
    };
    DateTime::from_timestamp(secs, 0)
}

/// `HH:MM` of an epoch value in the viewer's time zone.
pub fn local_time_of_day(raw: &Value, tz: Tz) -> Option<String> {
    epoch_to_utc(raw).map(|ts| ts.with_timezone(&tz).format("%H:%M").to_string())
}

/// Render a projected value as an entity state string.
pub fn state_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        other => other.to_string(),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
