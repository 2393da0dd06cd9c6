use fabric_p2p::EnvelopePayload;
use serde::Serialize;

/// Flattens a `Serialize` value into an envelope payload map. Every type
/// handed to this helper serializes to a JSON object.
pub fn to_payload<T: Serialize>(value: &T) -> EnvelopePayload {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => EnvelopePayload::new(),
    }
}
