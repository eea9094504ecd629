use serde_json::Value;
use turnstile_kernel_protocol::EventEnvelope;

use crate::ModelError;

const DONE_SENTINEL: &str = "[DONE]";
const DEFAULT_SSE_EVENT: &str = "message";

/// Turns one SSE frame into an envelope. Blank frames yield `None`.
///
/// Relaying proxies wrap provider events as `{"event": ..., "data": ...}`;
/// those are taken as-is. Raw provider events are tagged by their `type`
/// field, falling back to the SSE `event:` line.
pub(crate) fn decode_sse_frame(
    event_name: &str,
    data: &str,
) -> Result<Option<EventEnvelope>, ModelError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_SENTINEL {
        return Ok(Some(EventEnvelope::end_of_stream()));
    }

    let mut value = serde_json::from_str::<Value>(data)?;
    if let Some(envelope) = take_wrapped_envelope(&mut value) {
        return Ok(Some(envelope));
    }

    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            let name = event_name.trim();
            (!name.is_empty() && name != DEFAULT_SSE_EVENT).then(|| name.to_string())
        })
        .ok_or_else(|| ModelError::MissingEventType {
            data: data.to_string(),
        })?;

    Ok(Some(EventEnvelope::new(event_type, value)))
}

fn take_wrapped_envelope(value: &mut Value) -> Option<EventEnvelope> {
    let map = value.as_object_mut()?;
    if map.contains_key("type") || !map.contains_key("data") {
        return None;
    }
    let event = map.get("event").and_then(Value::as_str)?.to_string();
    let data = map.remove("data").unwrap_or(Value::Null);
    Some(EventEnvelope { event, data })
}
