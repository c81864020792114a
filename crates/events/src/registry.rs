//! Event type registry.
//!
//! Built once at startup and handed to the event store. Multiple stores (and
//! tests) can hold independent registries.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::DomainEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown event type {event_type} for aggregate type {aggregate_type}")]
    UnknownEventType {
        aggregate_type: String,
        event_type: String,
    },

    #[error("payload of {event_type} does not decode: {message}")]
    InvalidPayload { event_type: String, message: String },
}

type Validator = fn(&str, &JsonValue) -> Result<(), serde_json::Error>;

fn validate_as<E: DomainEvent>(event_type: &str, payload: &JsonValue) -> Result<(), serde_json::Error> {
    E::from_parts(event_type, payload).map(|_| ())
}

/// Maps `(aggregate_type, event_type)` to a payload validator.
#[derive(Clone, Default)]
pub struct EventRegistry {
    validators: Arc<HashMap<(String, String), Validator>>,
}

impl core::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.validators.keys().collect();
        keys.sort();
        f.debug_struct("EventRegistry").field("event_types", &keys).finish()
    }
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    pub fn is_registered(&self, aggregate_type: &str, event_type: &str) -> bool {
        self.validators
            .contains_key(&(aggregate_type.to_string(), event_type.to_string()))
    }

    /// Check that the payload decodes as the registered event.
    pub fn validate(
        &self,
        aggregate_type: &str,
        event_type: &str,
        payload: &JsonValue,
    ) -> Result<(), RegistryError> {
        let validator = self
            .validators
            .get(&(aggregate_type.to_string(), event_type.to_string()))
            .ok_or_else(|| RegistryError::UnknownEventType {
                aggregate_type: aggregate_type.to_string(),
                event_type: event_type.to_string(),
            })?;
        validator(event_type, payload).map_err(|e| RegistryError::InvalidPayload {
            event_type: event_type.to_string(),
            message: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[derive(Default)]
pub struct EventRegistryBuilder {
    validators: HashMap<(String, String), Validator>,
}

impl EventRegistryBuilder {
    /// Register every event type of a closed event enum.
    pub fn register<E: DomainEvent>(mut self) -> Self {
        for event_type in E::EVENT_TYPES {
            self.validators.insert(
                (E::AGGREGATE_TYPE.to_string(), (*event_type).to_string()),
                validate_as::<E>,
            );
        }
        self
    }

    pub fn build(self) -> EventRegistry {
        EventRegistry {
            validators: Arc::new(self.validators),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", content = "payload")]
    enum LampEvent {
        #[serde(rename = "lamp.switched")]
        Switched { on: bool },
    }

    impl DomainEvent for LampEvent {
        const AGGREGATE_TYPE: &'static str = "lamp";
        const EVENT_TYPES: &'static [&'static str] = &["lamp.switched"];

        fn event_type(&self) -> &'static str {
            "lamp.switched"
        }
    }

    #[test]
    fn registries_are_isolated() {
        let with_lamp = EventRegistry::builder().register::<LampEvent>().build();
        let empty = EventRegistry::builder().build();
        assert!(with_lamp.is_registered("lamp", "lamp.switched"));
        assert!(!empty.is_registered("lamp", "lamp.switched"));
    }

    #[test]
    fn validate_rejects_unknown_types_and_bad_payloads() {
        let registry = EventRegistry::builder().register::<LampEvent>().build();
        assert!(registry
            .validate("lamp", "lamp.switched", &serde_json::json!({ "on": true }))
            .is_ok());
        assert!(matches!(
            registry.validate("lamp", "lamp.broken", &JsonValue::Null),
            Err(RegistryError::UnknownEventType { .. })
        ));
        assert!(matches!(
            registry.validate("lamp", "lamp.switched", &serde_json::json!({ "on": "yes" })),
            Err(RegistryError::InvalidPayload { .. })
        ));
    }
}
