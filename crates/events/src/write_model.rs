//! Write models: transient folds of one aggregate's events.
//!
//! A write model is built per command invocation. It describes which events it
//! needs ([`WriteModel::query`]), folds them one at a time
//! ([`WriteModel::reduce`]) and records how far it got. Folding is pure: two
//! write models built from the same event prefix are identical.

use chrono::{DateTime, Utc};

use keyward_core::{AggregateId, AggregateRef, DomainError, ObjectDetails, TenantId};

use crate::{EventQuery, StoredEvent};

/// Bookkeeping shared by every write model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteModelState {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub resource_owner: String,
    pub processed_sequence: u64,
    pub creation_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModelState {
    pub fn new(tenant_id: TenantId, aggregate_id: AggregateId, resource_owner: impl Into<String>) -> Self {
        Self {
            tenant_id,
            aggregate_id,
            resource_owner: resource_owner.into(),
            processed_sequence: 0,
            creation_date: None,
            change_date: None,
        }
    }

    fn track(&mut self, event: &StoredEvent) {
        if self.resource_owner.is_empty() {
            self.resource_owner = event.resource_owner.clone();
        }
        if self.creation_date.is_none() {
            self.creation_date = Some(event.created_at);
        }
        self.processed_sequence = event.sequence;
        self.change_date = Some(event.created_at);
    }

    pub fn aggregate(&self, aggregate_type: &str) -> AggregateRef {
        AggregateRef::new(
            self.tenant_id,
            aggregate_type,
            self.aggregate_id.clone(),
            self.resource_owner.clone(),
        )
    }

    pub fn details(&self) -> ObjectDetails {
        ObjectDetails {
            sequence: self.processed_sequence,
            change_date: self.change_date,
            resource_owner: self.resource_owner.clone(),
        }
    }
}

pub trait WriteModel: Send {
    /// Events this model consumes (identity + event type whitelist).
    fn query(&self) -> Result<EventQuery, DomainError>;

    /// Fold a single event into typed fields. Must not read the clock.
    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError>;

    fn state(&self) -> &WriteModelState;

    fn state_mut(&mut self) -> &mut WriteModelState;

    fn processed_sequence(&self) -> u64 {
        self.state().processed_sequence
    }
}

/// Fold events in order, tracking `processed_sequence`.
///
/// Events of the model's own aggregate already folded are skipped so a
/// re-fold after a push never applies an event twice.
pub fn fold<W: WriteModel + ?Sized>(model: &mut W, events: &[StoredEvent]) -> Result<(), DomainError> {
    for event in events {
        let own = event.aggregate_id == model.state().aggregate_id;
        if own && event.sequence <= model.state().processed_sequence {
            continue;
        }
        model.reduce(event)?;
        if own {
            model.state_mut().track(event);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct CounterModel {
        state: WriteModelState,
        count: u64,
    }

    impl WriteModel for CounterModel {
        fn query(&self) -> Result<EventQuery, DomainError> {
            Ok(EventQuery::builder()
                .add_query()
                .aggregate_ids([self.state.aggregate_id.as_str()])
                .build()?)
        }

        fn reduce(&mut self, _event: &StoredEvent) -> Result<(), DomainError> {
            self.count += 1;
            Ok(())
        }

        fn state(&self) -> &WriteModelState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut WriteModelState {
            &mut self.state
        }
    }

    fn stored(tenant: TenantId, sequence: u64) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::now_v7(),
            tenant_id: tenant,
            aggregate_type: "counter".into(),
            aggregate_id: AggregateId::parse("c1").unwrap(),
            resource_owner: "org1".into(),
            sequence,
            position: sequence,
            event_type: "counter.incremented".into(),
            payload: JsonValue::Null,
            editor: "u1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn refolding_the_same_events_is_a_no_op() {
        let tenant = TenantId::new();
        let mut model = CounterModel {
            state: WriteModelState::new(tenant, AggregateId::parse("c1").unwrap(), ""),
            count: 0,
        };
        let events = vec![stored(tenant, 1), stored(tenant, 2)];
        fold(&mut model, &events).unwrap();
        fold(&mut model, &events).unwrap();
        assert_eq!(model.count, 2);
        assert_eq!(model.processed_sequence(), 2);
        assert_eq!(model.state.resource_owner, "org1");
        assert_eq!(model.state.details().sequence, 2);
    }
}
