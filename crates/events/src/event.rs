use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

/// A closed, versioned set of events for one aggregate type.
///
/// Implementors are enums serialized with
/// `#[serde(tag = "type", content = "payload")]` where every variant is
/// renamed to its stable event type (e.g. `"session.added"`). The tag is
/// stored in the `event_type` column and only the content is stored as the
/// payload, so the two halves are split on write and re-joined on read.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **append-only**
/// - decoded by exhaustive `match`, so adding a variant is a compile-time change
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Aggregate type all variants belong to (e.g. `"session"`).
    const AGGREGATE_TYPE: &'static str;

    /// Every event type string this enum can decode.
    const EVENT_TYPES: &'static [&'static str];

    /// Stable event type identifier of this variant.
    fn event_type(&self) -> &'static str;

    /// Payload without the type tag. Variants without data yield `null`.
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        let tagged = serde_json::to_value(self)?;
        Ok(match tagged {
            JsonValue::Object(mut map) => map.remove("payload").unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        })
    }

    /// Rebuild a variant from its stored type and payload.
    fn from_parts(event_type: &str, payload: &JsonValue) -> Result<Self, serde_json::Error> {
        let mut map = Map::new();
        map.insert("type".to_string(), JsonValue::String(event_type.to_string()));
        if !payload.is_null() {
            map.insert("payload".to_string(), payload.clone());
        }
        serde_json::from_value(JsonValue::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "payload")]
    enum DoorEvent {
        #[serde(rename = "door.opened")]
        Opened { by: String },
        #[serde(rename = "door.closed")]
        Closed,
    }

    impl DomainEvent for DoorEvent {
        const AGGREGATE_TYPE: &'static str = "door";
        const EVENT_TYPES: &'static [&'static str] = &["door.opened", "door.closed"];

        fn event_type(&self) -> &'static str {
            match self {
                DoorEvent::Opened { .. } => "door.opened",
                DoorEvent::Closed => "door.closed",
            }
        }
    }

    #[test]
    fn payload_excludes_the_type_tag() {
        let payload = DoorEvent::Opened { by: "u1".into() }.to_payload().unwrap();
        assert_eq!(payload, serde_json::json!({ "by": "u1" }));
        assert_eq!(DoorEvent::Closed.to_payload().unwrap(), JsonValue::Null);
    }

    #[test]
    fn parts_rebuild_the_variant() {
        let opened = DoorEvent::from_parts("door.opened", &serde_json::json!({ "by": "u1" })).unwrap();
        assert_eq!(opened, DoorEvent::Opened { by: "u1".into() });
        let closed = DoorEvent::from_parts("door.closed", &JsonValue::Null).unwrap();
        assert_eq!(closed, DoorEvent::Closed);
        assert!(DoorEvent::from_parts("door.slammed", &JsonValue::Null).is_err());
    }
}
