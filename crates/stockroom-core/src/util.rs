//! Shared utility functions used across multiple modules.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Prefix carried by ids minted on the device before the remote store assigns one.
pub const PROVISIONAL_ID_PREFIX: &str = "id-";

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Mint a provisional local id (`id-<uuid v7>`).
pub fn provisional_id() -> String {
    format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::now_v7().simple())
}

/// Whether `id` was minted locally and has not been replaced by a remote id.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_ID_PREFIX)
}

/// Whether `id` looks like an id assigned by the remote store.
///
/// Remote ids never carry the provisional prefix and are longer than ten characters.
pub fn is_remote_id_shaped(id: &str) -> bool {
    !is_provisional_id(id) && id.len() > 10
}

/// Parse the timestamp encodings found in stored and remote documents.
///
/// Accepts RFC 3339 strings, unix-millisecond integers and
/// `{ "seconds": .., "nanoseconds": .. }` objects.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = map
                .get("nanoseconds")
                .or_else(|| map.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .and_then(|nanos| u32::try_from(nanos).ok())
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos).single()
        }
        _ => None,
    }
}

/// Render a timestamp the way documents store it.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current time as a document timestamp value.
pub fn timestamp_now() -> Value {
    Value::String(format_timestamp(Utc::now()))
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}
