use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use keyward_core::{AggregateId, DomainError, ExpectedSequence, TenantId};
use keyward_events::{EventQuery, EventRegistry, InvalidQuery, RegistryError, StoredEvent, UncommittedEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, schema) as
/// opposed to domain errors. Every variant maps onto exactly one
/// [`DomainError`] kind, so callers above the store only see the domain
/// taxonomy.
///
/// | Variant | DomainError |
/// |---------|-------------|
/// | `InvalidQuery` | `InvalidArgument` |
/// | `Concurrency` | `ConcurrencyConflict` |
/// | `UniqueConstraint` | `AlreadyExists` |
/// | `InvalidAppend` | `InvalidArgument` |
/// | `UnknownEventType` | `InvalidArgument` |
/// | `Serialization` | `Internal` |
/// | `Unavailable` | `Unavailable` |
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(transparent)]
    InvalidQuery(#[from] InvalidQuery),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    /// A unique constraint clash; carries the constraint's error message.
    #[error("{0}")]
    UniqueConstraint(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl From<RegistryError> for EventStoreError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownEventType { .. } => EventStoreError::UnknownEventType(value.to_string()),
            RegistryError::InvalidPayload { .. } => EventStoreError::InvalidAppend(value.to_string()),
        }
    }
}

impl From<EventStoreError> for DomainError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::InvalidQuery(q) => q.into(),
            EventStoreError::Concurrency(msg) => DomainError::conflict(msg),
            EventStoreError::UniqueConstraint(msg) => DomainError::already_exists(msg),
            EventStoreError::InvalidAppend(msg) | EventStoreError::UnknownEventType(msg) => {
                DomainError::invalid_argument(msg)
            }
            EventStoreError::Serialization(msg) => DomainError::internal(msg),
            EventStoreError::Unavailable(msg) => DomainError::unavailable(msg),
        }
    }
}

/// Append-only, tenant-scoped event log.
///
/// ## Push Semantics
///
/// `push()`:
/// - Validates every event against the registry (known type, decodable payload)
/// - Checks each aggregate's precondition against its current sequence
/// - Applies unique constraints in order (`Add` clashes fail the push)
/// - Assigns per-aggregate sequences and log-wide positions
/// - Persists the batch atomically (all or nothing)
///
/// A batch may span several aggregates. The precondition of an aggregate is
/// taken from its first event in the batch; later events of the same
/// aggregate may repeat it or use `Any`.
///
/// ## Filter Semantics
///
/// `filter()` returns the events matching an [`EventQuery`], ordered as the
/// query requests. Reading never blocks on in-flight appends.
///
/// ## Watermark
///
/// `committed_position()` is the highest position `p` such that every event
/// with a position `<= p` is committed and visible. Projections never read
/// past it, so they cannot skip an event that commits late.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn push(&self, events: Vec<UncommittedEvent>) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn filter(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Current sequence of one aggregate (0 if it has no events).
    async fn latest_sequence(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, EventStoreError>;

    async fn committed_position(&self) -> Result<u64, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn push(&self, events: Vec<UncommittedEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).push(events).await
    }

    async fn filter(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).filter(query).await
    }

    async fn latest_sequence(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, EventStoreError> {
        (**self).latest_sequence(tenant_id, aggregate_type, aggregate_id).await
    }

    async fn committed_position(&self) -> Result<u64, EventStoreError> {
        (**self).committed_position().await
    }
}

/// Stream identity used by the backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StreamKey {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
}

impl StreamKey {
    pub fn of(event: &UncommittedEvent) -> Self {
        Self {
            tenant_id: event.aggregate.tenant_id,
            aggregate_type: event.aggregate.aggregate_type.clone(),
            aggregate_id: event.aggregate.aggregate_id.clone(),
        }
    }
}

/// Validate a batch before it touches storage.
///
/// Returns the precondition of every aggregate in the batch, in order of
/// first appearance.
pub(crate) fn plan_batch(
    registry: &EventRegistry,
    events: &[UncommittedEvent],
) -> Result<Vec<(StreamKey, ExpectedSequence)>, EventStoreError> {
    let mut plan: Vec<(StreamKey, ExpectedSequence)> = Vec::new();
    let mut index: HashMap<StreamKey, usize> = HashMap::new();

    for (idx, event) in events.iter().enumerate() {
        registry.validate(&event.aggregate.aggregate_type, &event.event_type, &event.payload)?;
        if event.editor.trim().is_empty() {
            return Err(EventStoreError::InvalidAppend(format!("event {idx} has no editor")));
        }

        let key = StreamKey::of(event);
        match index.get(&key) {
            None => {
                index.insert(key.clone(), plan.len());
                plan.push((key, event.expected));
            }
            Some(&at) => {
                let first = plan[at].1;
                if let (ExpectedSequence::Exact(a), ExpectedSequence::Exact(b)) = (first, event.expected) {
                    if a != b {
                        return Err(EventStoreError::InvalidAppend(format!(
                            "event {idx} expects sequence {b} but the batch already expects {a} for {}",
                            key.aggregate_id
                        )));
                    }
                }
            }
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use keyward_core::AggregateRef;
    use keyward_events::DomainEvent;
    use keyward_auth::SessionEvent;

    use super::*;

    fn event(id: &str, expected: ExpectedSequence) -> UncommittedEvent {
        let aggregate = AggregateRef::new(
            TenantId::new(),
            SessionEvent::AGGREGATE_TYPE,
            AggregateId::parse(id).unwrap(),
            "org1",
        );
        UncommittedEvent::from_typed(&aggregate, "u1", &SessionEvent::Added)
            .unwrap()
            .expect_sequence(expected)
    }

    #[test]
    fn conflicting_preconditions_in_one_batch_are_rejected() {
        let registry = keyward_auth::event_registry();
        let first = event("s1", ExpectedSequence::Exact(0));
        let mut second = first.clone().expect_sequence(ExpectedSequence::Exact(4));
        second.event_type = "session.terminated".into();
        assert!(matches!(
            plan_batch(&registry, &[first, second]),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[test]
    fn later_events_may_relax_the_precondition() {
        let registry = keyward_auth::event_registry();
        let first = event("s1", ExpectedSequence::Exact(0));
        let second = first.clone().expect_sequence(ExpectedSequence::Any);
        let plan = plan_batch(&registry, &[first, second]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].1, ExpectedSequence::Exact(0));
    }

    #[test]
    fn unregistered_event_types_are_rejected() {
        let mut unknown = event("s1", ExpectedSequence::Any);
        unknown.event_type = "session.exploded".into();
        let err = plan_batch(&keyward_auth::event_registry(), &[unknown]).unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownEventType(_)));
        assert!(matches!(DomainError::from(err), DomainError::InvalidArgument(_)));
    }

    #[test]
    fn store_errors_map_onto_the_domain_taxonomy() {
        assert!(DomainError::from(EventStoreError::Concurrency("stale".into())).is_retryable());
        assert_eq!(
            DomainError::from(EventStoreError::UniqueConstraint("username already taken".into())),
            DomainError::already_exists("username already taken")
        );
        assert!(matches!(
            DomainError::from(EventStoreError::Unavailable("down".into())),
            DomainError::Unavailable(_)
        ));
    }
}
