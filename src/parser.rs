//! JSON parser for train position batches.
//!
//! Upstream payloads are loose: numbers arrive as strings, timestamps as
//! RFC 3339 text or epoch values, and whole fields go missing. Parsing is
//! lenient per field so that one odd record degrades to a partial
//! [`Observation`] instead of failing the batch.

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::model::Observation;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawObservation {
    #[serde(alias = "train", alias = "id")]
    train_number: Option<Value>,
    departure_date: Option<Value>,
    #[serde(alias = "operator")]
    product: Option<Value>,
    destination: Option<Value>,
    #[serde(alias = "lat")]
    latitude: Option<Value>,
    #[serde(alias = "lon", alias = "lng")]
    longitude: Option<Value>,
    #[serde(alias = "course", alias = "heading")]
    bearing: Option<Value>,
    #[serde(alias = "reportedSpeed", alias = "speedKmh")]
    speed: Option<Value>,
    #[serde(alias = "ts", alias = "time")]
    timestamp: Option<Value>,
    canceled: Option<Value>,
    active: Option<Value>,
}

impl From<RawObservation> for Observation {
    fn from(raw: RawObservation) -> Self {
        Observation {
            train_number: raw.train_number.as_ref().and_then(as_text).unwrap_or_default(),
            departure_date: raw.departure_date.as_ref().and_then(as_text),
            product: raw.product.as_ref().and_then(as_label),
            destination: raw.destination.as_ref().and_then(as_label),
            latitude: raw.latitude.as_ref().and_then(as_number).unwrap_or(f64::NAN),
            longitude: raw.longitude.as_ref().and_then(as_number).unwrap_or(f64::NAN),
            bearing: raw
                .bearing
                .as_ref()
                .and_then(as_number)
                .map(|b| b.rem_euclid(360.0)),
            reported_speed: raw.speed.as_ref().and_then(as_number).filter(|s| *s >= 0.0),
            timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
            canceled: raw.canceled.as_ref().and_then(as_flag).unwrap_or(false),
            active: raw.active.as_ref().and_then(as_flag).unwrap_or(true),
        }
    }
}

/// Decodes a batch: either a JSON array of observations or an object with a
/// `trains` array.
///
/// # Errors
///
/// Returns an error if the bytes are not JSON or have neither shape.
/// Individual entries that are not objects are skipped.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<Observation>> {
    let value: Value = serde_json::from_slice(bytes)?;
    batch_from_value(value)
}

/// Decodes one line of an NDJSON stream, which may hold a single observation
/// or a whole batch.
pub fn parse_line(line: &str) -> Result<Vec<Observation>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(line)?;
    let single = matches!(&value, Value::Object(map) if !map.contains_key("trains"));
    if !single {
        return batch_from_value(value);
    }
    match parse_value(value) {
        Some(obs) => Ok(vec![obs]),
        None => bail!("observation is not an object"),
    }
}

fn batch_from_value(value: Value) -> Result<Vec<Observation>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("trains") {
            Some(Value::Array(items)) => items,
            _ => bail!("batch object has no `trains` array"),
        },
        other => bail!("unexpected batch type: {}", type_name(&other)),
    };

    let total = items.len();
    let observations: Vec<Observation> = items.into_iter().filter_map(parse_value).collect();
    if observations.len() < total {
        debug!(
            skipped = total - observations.len(),
            "non-object entries skipped"
        );
    }

    Ok(observations)
}

fn parse_value(value: Value) -> Option<Observation> {
    if !value.is_object() {
        return None;
    }
    // an unreadable object stays in the batch without identity, so the
    // registry counts it as malformed
    let obs = serde_json::from_value::<RawObservation>(value)
        .map(Observation::from)
        .unwrap_or_else(|e| {
            debug!(error = %e, "observation fields unreadable");
            Observation::default()
        });
    Some(obs)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Free-text fields only accept strings; anything structured is dropped.
fn as_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 0.0 => Some(false),
            Some(x) if x == 1.0 => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC, or epoch
/// seconds / milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            s.parse::<f64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    // anything past year 5138 in seconds is really milliseconds
    let millis = if value < 1e11 { value * 1000.0 } else { value };
    Utc.timestamp_millis_opt(millis as i64).single()
}
