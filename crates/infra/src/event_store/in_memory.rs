use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use keyward_core::{AggregateId, Clock, SystemClock, TenantId};
use keyward_events::{EventQuery, EventRegistry, StoredEvent, UncommittedEvent, UniqueConstraint};

use super::r#trait::{EventStore, EventStoreError, StreamKey, plan_batch};

type UniqueKey = (TenantId, String, String);

#[derive(Debug, Default)]
struct Log {
    events: Vec<StoredEvent>,
    sequences: HashMap<StreamKey, u64>,
    unique: HashSet<UniqueKey>,
}

/// In-memory event log for tests and local development.
///
/// A push is validated and staged completely before anything becomes
/// visible, so a failing batch leaves no trace. Every committed event is
/// immediately visible, which makes `committed_position()` the last position.
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    registry: EventRegistry,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl InMemoryEventStore {
    pub fn new(registry: EventRegistry) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    /// Creation times of pushed events are read from `clock`.
    pub fn with_clock(registry: EventRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            log: RwLock::new(Log::default()),
            registry,
            clock,
        }
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn push(&self, events: Vec<UncommittedEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        let plan = plan_batch(&self.registry, &events)?;

        let mut log = self.log.write().map_err(|_| poisoned())?;

        let mut sequences: HashMap<StreamKey, u64> = HashMap::with_capacity(plan.len());
        for (key, expected) in plan {
            let current = log.sequences.get(&key).copied().unwrap_or(0);
            if !expected.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "{} {}: expected {expected:?}, found {current}",
                    key.aggregate_type, key.aggregate_id
                )));
            }
            sequences.insert(key, current);
        }

        // Unique constraints are staged so a clash late in the batch leaves
        // the reservations untouched.
        let mut staged: HashMap<UniqueKey, bool> = HashMap::new();
        for event in &events {
            let tenant_id = event.aggregate.tenant_id;
            for constraint in &event.unique_constraints {
                let (unique_type, unique_field) = constraint.key();
                let key = (tenant_id, unique_type.to_string(), unique_field.to_string());
                let taken = staged
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| log.unique.contains(&key));
                match constraint {
                    UniqueConstraint::Add { error_message, .. } => {
                        if taken {
                            return Err(EventStoreError::UniqueConstraint(error_message.clone()));
                        }
                        staged.insert(key, true);
                    }
                    UniqueConstraint::Remove { .. } => {
                        staged.insert(key, false);
                    }
                }
            }
        }

        let created_at = self.clock.now();
        let mut position = log.events.len() as u64;
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            let key = StreamKey::of(&event);
            let sequence = sequences.entry(key).or_insert(0);
            *sequence += 1;
            position += 1;
            committed.push(StoredEvent {
                event_id: Uuid::now_v7(),
                tenant_id: event.aggregate.tenant_id,
                aggregate_type: event.aggregate.aggregate_type,
                aggregate_id: event.aggregate.aggregate_id,
                resource_owner: event.aggregate.resource_owner,
                sequence: *sequence,
                position,
                event_type: event.event_type,
                payload: event.payload,
                editor: event.editor,
                created_at,
            });
        }

        log.sequences.extend(sequences);
        for (key, present) in staged {
            if present {
                log.unique.insert(key);
            } else {
                log.unique.remove(&key);
            }
        }
        log.events.extend(committed.iter().cloned());

        debug!(count = committed.len(), position, "pushed events");
        Ok(committed)
    }

    async fn filter(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        let matched: Vec<StoredEvent> = log
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        Ok(query.arrange(matched))
    }

    async fn latest_sequence(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        let key = StreamKey {
            tenant_id,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.clone(),
        };
        Ok(log.sequences.get(&key).copied().unwrap_or(0))
    }

    async fn committed_position(&self) -> Result<u64, EventStoreError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log.events.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use keyward_auth::user::{self, HumanEvent};
    use keyward_auth::SessionEvent;
    use keyward_core::{AggregateRef, ExpectedSequence};
    use proptest::prelude::*;

    use super::*;

    fn store() -> InMemoryEventStore {
        InMemoryEventStore::new(keyward_auth::event_registry())
    }

    fn session(tenant: TenantId, id: &str) -> AggregateRef {
        AggregateRef::new(tenant, "session", AggregateId::parse(id).unwrap(), "org1")
    }

    fn added(aggregate: &AggregateRef, expected: ExpectedSequence) -> UncommittedEvent {
        UncommittedEvent::from_typed(aggregate, "u1", &SessionEvent::Added)
            .unwrap()
            .expect_sequence(expected)
    }

    fn terminated(aggregate: &AggregateRef) -> UncommittedEvent {
        UncommittedEvent::from_typed(aggregate, "u1", &SessionEvent::Terminated).unwrap()
    }

    fn human_added(tenant: TenantId, id: &str, username: &str) -> UncommittedEvent {
        let aggregate = AggregateRef::new(tenant, "user", AggregateId::parse(id).unwrap(), "org1");
        let event = HumanEvent::Added {
            username: username.into(),
            email: format!("{username}@example.com"),
            encoded_hash: None,
        };
        UncommittedEvent::from_typed(&aggregate, "admin", &event)
            .unwrap()
            .with_unique_constraint(user::add_username_constraint(username))
    }

    fn all_of(tenant: TenantId) -> EventQuery {
        EventQuery::builder()
            .tenant(tenant)
            .add_query()
            .aggregate_types(["session", "user"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn push_assigns_sequences_per_aggregate_and_positions_log_wide() {
        let store = store();
        let tenant = TenantId::new();
        let s1 = session(tenant, "s1");
        let s2 = session(tenant, "s2");

        let pushed = store
            .push(vec![
                added(&s1, ExpectedSequence::Exact(0)),
                added(&s2, ExpectedSequence::Exact(0)),
                terminated(&s1),
            ])
            .await
            .unwrap();
        let seqs: Vec<(&str, u64, u64)> = pushed
            .iter()
            .map(|e| (e.aggregate_id.as_str(), e.sequence, e.position))
            .collect();
        assert_eq!(seqs, vec![("s1", 1, 1), ("s2", 1, 2), ("s1", 2, 3)]);
        assert_eq!(store.latest_sequence(tenant, "session", &s1.aggregate_id).await.unwrap(), 2);
        assert_eq!(store.committed_position().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stale_precondition_is_a_concurrency_error() {
        let store = store();
        let tenant = TenantId::new();
        let s1 = session(tenant, "s1");
        store.push(vec![added(&s1, ExpectedSequence::Exact(0))]).await.unwrap();

        let err = store
            .push(vec![terminated(&s1).expect_sequence(ExpectedSequence::Exact(0))])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_mid_batch_leaves_no_trace() {
        let store = store();
        let tenant = TenantId::new();
        let s1 = session(tenant, "s1");
        let mut broken = terminated(&s1);
        broken.event_type = "session.exploded".into();

        let err = store.push(vec![added(&s1, ExpectedSequence::Any), broken]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownEventType(_)));
        assert!(store.filter(&all_of(tenant)).await.unwrap().is_empty());
        assert_eq!(store.latest_sequence(tenant, "session", &s1.aggregate_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unique_clash_fails_the_whole_batch() {
        let store = store();
        let tenant = TenantId::new();
        store.push(vec![human_added(tenant, "u1", "alice")]).await.unwrap();

        let err = store
            .push(vec![human_added(tenant, "u2", "bob"), human_added(tenant, "u3", "alice")])
            .await
            .unwrap_err();
        assert!(matches!(&err, EventStoreError::UniqueConstraint(msg) if msg == "username already taken"));
        assert_eq!(store.len(), 1);

        // "bob" was never reserved.
        store.push(vec![human_added(tenant, "u4", "bob")]).await.unwrap();
        // Other tenants have their own namespace.
        store.push(vec![human_added(TenantId::new(), "u1", "alice")]).await.unwrap();
    }

    #[tokio::test]
    async fn removed_constraint_frees_the_value() {
        let store = store();
        let tenant = TenantId::new();
        store.push(vec![human_added(tenant, "u1", "alice")]).await.unwrap();
        let aggregate = AggregateRef::new(tenant, "user", AggregateId::parse("u1").unwrap(), "org1");
        let removed = UncommittedEvent::from_typed(&aggregate, "admin", &HumanEvent::Removed { username: "alice".into() })
            .unwrap()
            .with_unique_constraint(user::remove_username_constraint("alice"));
        store.push(vec![removed]).await.unwrap();
        store.push(vec![human_added(tenant, "u2", "alice")]).await.unwrap();
    }

    #[tokio::test]
    async fn filter_isolates_tenants_and_honours_order_and_limit() {
        let store = store();
        let tenant = TenantId::new();
        let other = TenantId::new();
        let s1 = session(tenant, "s1");
        store.push(vec![added(&s1, ExpectedSequence::Any), terminated(&s1)]).await.unwrap();
        store.push(vec![added(&session(other, "s1"), ExpectedSequence::Any)]).await.unwrap();

        let query = EventQuery::builder()
            .tenant(tenant)
            .order_desc()
            .limit(1)
            .add_query()
            .aggregate_types(["session"])
            .aggregate_ids(["s1"])
            .build()
            .unwrap();
        let events = store.filter(&query).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "session.terminated");
        assert!(store.filter(&all_of(tenant)).await.unwrap().iter().all(|e| e.tenant_id == tenant));
    }

    proptest! {
        #[test]
        fn positions_strictly_increase_and_sequences_are_contiguous(batches in prop::collection::vec(prop::collection::vec(0usize..3, 1..4), 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = store();
            let tenant = TenantId::new();
            let ids = ["a", "b", "c"];

            runtime.block_on(async {
                for batch in &batches {
                    let events = batch.iter().map(|i| added(&session(tenant, ids[*i]), ExpectedSequence::Any)).collect();
                    store.push(events).await.unwrap();
                }
            });
            let events = runtime.block_on(store.filter(&all_of(tenant))).unwrap();
            let mut by_position = events.clone();
            by_position.sort_by_key(|e| e.position);
            prop_assert!(by_position.windows(2).all(|w| w[0].position < w[1].position));

            for id in ids {
                let seqs: Vec<u64> = by_position.iter().filter(|e| e.aggregate_id.as_str() == id).map(|e| e.sequence).collect();
                prop_assert_eq!(seqs.clone(), (1..=seqs.len() as u64).collect::<Vec<_>>());
            }
        }
    }
}
