//! Null sanitization for station payloads

use serde_json::Value;

/// Drop every `null` at every depth.
///
/// Object members holding `null` are removed and `null` array entries are
/// filtered out. Everything else, empty containers included, is kept as is.
/// A bare top-level `null` has nowhere to be removed from and stays `null`.
pub fn sanitize_ocpp_payload(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, sanitize_ocpp_payload(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(sanitize_ocpp_payload)
                .collect(),
        ),
        other => other,
    }
}
