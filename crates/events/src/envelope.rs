use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use keyward_core::{AggregateId, AggregateRef, DomainError, ExpectedSequence, TenantId};

use crate::DomainEvent;

/// Reservation of a tenant-wide unique value, applied atomically with the
/// event that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniqueConstraint {
    /// Reserve `(unique_type, unique_field)`; fails the push if already taken.
    Add {
        unique_type: String,
        unique_field: String,
        /// Message of the `AlreadyExists` error returned on a clash.
        error_message: String,
    },
    /// Release a previous reservation. Releasing a missing value is a no-op.
    Remove {
        unique_type: String,
        unique_field: String,
    },
}

impl UniqueConstraint {
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self::Add {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            error_message: error_message.into(),
        }
    }

    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self::Remove {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        match self {
            Self::Add {
                unique_type,
                unique_field,
                ..
            }
            | Self::Remove {
                unique_type,
                unique_field,
            } => (unique_type, unique_field),
        }
    }
}

/// An event ready to be pushed to the log (no sequence assigned yet).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by a command from a loaded write model
/// 2. **UncommittedEvent**: wrapped with aggregate identity, editor and precondition
/// 3. **StoredEvent**: persisted with its assigned `sequence` and `position`
///
/// Use [`UncommittedEvent::from_typed`] to build one from a [`DomainEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub aggregate: AggregateRef,
    pub event_type: String,
    pub payload: JsonValue,
    /// Id of the user (or system component) that caused the event.
    pub editor: String,
    pub expected: ExpectedSequence,
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl UncommittedEvent {
    pub fn from_typed<E: DomainEvent>(
        aggregate: &AggregateRef,
        editor: impl Into<String>,
        event: &E,
    ) -> Result<Self, DomainError> {
        if aggregate.aggregate_type != E::AGGREGATE_TYPE {
            return Err(DomainError::internal(format!(
                "event {} belongs to aggregate type {}, not {}",
                event.event_type(),
                E::AGGREGATE_TYPE,
                aggregate.aggregate_type
            )));
        }
        let payload = event
            .to_payload()
            .map_err(|e| DomainError::internal(format!("payload serialization failed: {e}")))?;
        Ok(Self {
            aggregate: aggregate.clone(),
            event_type: event.event_type().to_string(),
            payload,
            editor: editor.into(),
            expected: ExpectedSequence::Any,
            unique_constraints: Vec::new(),
        })
    }

    pub fn expect_sequence(mut self, expected: ExpectedSequence) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }
}

/// A persisted, immutable event.
///
/// ## Ordering
///
/// - `sequence` is per aggregate (1, 2, 3, ...) and is the concurrency token
/// - `position` is log-wide and strictly increasing in commit-visible order;
///   projections track their progress in positions
///
/// A position is never smaller than the event's sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub resource_owner: String,
    pub sequence: u64,
    pub position: u64,
    pub event_type: String,
    pub payload: JsonValue,
    pub editor: String,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Decode the payload into the aggregate's closed event enum.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, DomainError> {
        if self.aggregate_type != E::AGGREGATE_TYPE {
            return Err(DomainError::internal(format!(
                "cannot decode {} event as {}",
                self.aggregate_type,
                E::AGGREGATE_TYPE
            )));
        }
        E::from_parts(&self.event_type, &self.payload).map_err(|e| {
            DomainError::internal(format!(
                "failed to decode {} at sequence {}: {e}",
                self.event_type, self.sequence
            ))
        })
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef::new(
            self.tenant_id,
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.resource_owner.clone(),
        )
    }
}
