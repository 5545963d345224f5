//! Builds the downstream envelope from a raw stream entry.
//!
//! The embedding rule: a field named `object` whose trimmed value starts with
//! `{` or `[` is parsed as JSON and inlined verbatim; every other field is
//! emitted as a plain JSON string. This lets producers ship a pre-serialized
//! object without the bridge re-escaping it into a string-of-JSON.

use bridge_domain::{Envelope, MessagePayload, RedisPayload, RedisRef, StreamEntry};
use serde_json::{Map, Value};

/// Builds the envelope for a single entry, ready to publish on the bus.
pub fn build_envelope(entry: &StreamEntry) -> Envelope {
    let mut fields = Map::with_capacity(entry.fields.len());

    for (key, value) in &entry.fields {
        let json_value = if key == "object" && looks_like_json(value) {
            serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.clone()))
        } else {
            Value::String(value.clone())
        };
        fields.insert(key.clone(), json_value);
    }

    Envelope {
        message: MessagePayload {
            payload: Value::Object(fields),
        },
        redis: RedisPayload {
            payload: RedisRef {
                id: entry.id.clone(),
                stream: entry.stream.clone(),
                ack: true,
            },
        },
    }
}

fn looks_like_json(value: &str) -> bool {
    matches!(value.trim_start().as_bytes().first(), Some(b'{') | Some(b'['))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_fields_become_strings() {
        let entry = StreamEntry::new("1-0", "orders").with_field("kind", "created");
        let envelope = build_envelope(&entry);
        assert_eq!(envelope.message.payload["kind"], "created");
    }

    #[test]
    fn test_object_field_is_inlined_as_json() {
        let entry = StreamEntry::new("1-0", "orders")
            .with_field("object", r#"{"sku":"abc","qty":3}"#);
        let envelope = build_envelope(&entry);
        assert_eq!(envelope.message.payload["object"]["sku"], "abc");
        assert_eq!(envelope.message.payload["object"]["qty"], 3);
    }

    #[test]
    fn test_object_field_with_leading_whitespace_still_inlined() {
        let entry = StreamEntry::new("1-0", "orders").with_field("object", "  [1,2,3]");
        let envelope = build_envelope(&entry);
        assert!(envelope.message.payload["object"].is_array());
    }

    #[test]
    fn test_object_field_with_malformed_json_falls_back_to_string() {
        let entry = StreamEntry::new("1-0", "orders").with_field("object", "{not json");
        let envelope = build_envelope(&entry);
        assert_eq!(envelope.message.payload["object"], "{not json");
    }

    #[test]
    fn test_object_field_not_json_like_stays_a_string() {
        let entry = StreamEntry::new("1-0", "orders").with_field("object", "plain text");
        let envelope = build_envelope(&entry);
        assert_eq!(envelope.message.payload["object"], "plain text");
    }

    #[test]
    fn test_redis_ref_carries_id_and_stream() {
        let entry = StreamEntry::new("5-2", "orders").with_field("kind", "created");
        let envelope = build_envelope(&entry);
        assert_eq!(envelope.redis.payload.id, "5-2");
        assert_eq!(envelope.redis.payload.stream, "orders");
        assert!(envelope.redis.payload.ack);
    }
}
