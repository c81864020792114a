//! Compositional event filters.
//!
//! A query is a list of sub-queries that are OR-combined. Inside a sub-query
//! every set filter must match (AND). Builder-level filters (tenant, resource
//! owner, position bounds) are ANDed into every sub-query.
//!
//! ```text
//! EventQuery::builder()
//!     .tenant(tenant)
//!     .add_query()
//!         .aggregate_types(["session"])
//!         .aggregate_ids(["s1"])
//!     .build()?
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keyward_core::{DomainError, TenantId};

use crate::StoredEvent;

/// A query was rejected before touching storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid query: {0}")]
pub struct InvalidQuery(pub String);

impl From<InvalidQuery> for DomainError {
    fn from(value: InvalidQuery) -> Self {
        DomainError::InvalidArgument(value.to_string())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderBy {
    /// Aggregate sequence, ties broken by insertion position.
    #[default]
    Sequence,
    /// Log position only (projection catch-up order).
    Position,
}

/// One AND-combined group of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    pub aggregate_types: Vec<String>,
    pub aggregate_ids: Vec<String>,
    pub event_types: Vec<String>,
    /// Exclusive lower sequence bound.
    pub sequence_greater: Option<u64>,
    /// Exclusive upper sequence bound.
    pub sequence_less: Option<u64>,
}

impl SubQuery {
    fn matches(&self, event: &StoredEvent) -> bool {
        if !self.aggregate_types.is_empty()
            && !self.aggregate_types.iter().any(|t| *t == event.aggregate_type)
        {
            return false;
        }
        if !self.aggregate_ids.is_empty()
            && !self
                .aggregate_ids
                .iter()
                .any(|id| id == event.aggregate_id.as_str())
        {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        if let Some(greater) = self.sequence_greater {
            if event.sequence <= greater {
                return false;
            }
        }
        if let Some(less) = self.sequence_less {
            if event.sequence >= less {
                return false;
            }
        }
        true
    }

    fn validate(&self, index: usize) -> Result<(), InvalidQuery> {
        let lists = [
            ("aggregate type", &self.aggregate_types),
            ("aggregate id", &self.aggregate_ids),
            ("event type", &self.event_types),
        ];
        for (what, values) in lists {
            if values.iter().any(|v| v.trim().is_empty()) {
                return Err(InvalidQuery(format!("sub-query {index}: empty {what}")));
            }
        }
        if let (Some(greater), Some(less)) = (self.sequence_greater, self.sequence_less) {
            if greater >= less {
                return Err(InvalidQuery(format!(
                    "sub-query {index}: sequence range ({greater}, {less}) is empty"
                )));
            }
        }
        Ok(())
    }
}

/// A validated, storage-independent event filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    sub_queries: Vec<SubQuery>,
    tenant: Option<TenantId>,
    resource_owner: Option<String>,
    position_greater: Option<u64>,
    position_at_most: Option<u64>,
    limit: Option<u64>,
    order_by: OrderBy,
    desc: bool,
}

impl EventQuery {
    pub fn builder() -> EventQueryBuilder {
        EventQueryBuilder::default()
    }

    pub fn sub_queries(&self) -> &[SubQuery] {
        &self.sub_queries
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn resource_owner(&self) -> Option<&str> {
        self.resource_owner.as_deref()
    }

    pub fn position_greater(&self) -> Option<u64> {
        self.position_greater
    }

    pub fn position_at_most(&self) -> Option<u64> {
        self.position_at_most
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn order_by(&self) -> OrderBy {
        self.order_by
    }

    pub fn is_desc(&self) -> bool {
        self.desc
    }

    /// Predicate semantics shared by every backend.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(tenant) = self.tenant {
            if event.tenant_id != tenant {
                return false;
            }
        }
        if let Some(owner) = &self.resource_owner {
            if event.resource_owner != *owner {
                return false;
            }
        }
        if let Some(greater) = self.position_greater {
            if event.position <= greater {
                return false;
            }
        }
        if let Some(at_most) = self.position_at_most {
            if event.position > at_most {
                return false;
            }
        }
        self.sub_queries.iter().any(|q| q.matches(event))
    }

    /// Sort matched events into the order this query promises, then apply the limit.
    pub fn arrange(&self, mut events: Vec<StoredEvent>) -> Vec<StoredEvent> {
        match self.order_by {
            OrderBy::Sequence => events.sort_by_key(|e| (e.sequence, e.position)),
            OrderBy::Position => events.sort_by_key(|e| e.position),
        }
        if self.desc {
            events.reverse();
        }
        if let Some(limit) = self.limit {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        events
    }

    /// Same query, bounded to positions `<= position`.
    pub fn bounded_at(mut self, position: u64) -> Self {
        self.position_at_most = Some(position);
        self
    }
}

/// Accumulates sub-queries and builder-level filters.
#[derive(Debug, Clone, Default)]
pub struct EventQueryBuilder {
    sub_queries: Vec<SubQuery>,
    tenant: Option<TenantId>,
    resource_owner: Option<String>,
    position_greater: Option<u64>,
    limit: Option<u64>,
    order_by: OrderBy,
    desc: bool,
}

impl EventQueryBuilder {
    pub fn tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn resource_owner(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = Some(resource_owner.into());
        self
    }

    pub fn position_greater(mut self, position: u64) -> Self {
        self.position_greater = Some(position);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by_position(mut self) -> Self {
        self.order_by = OrderBy::Position;
        self
    }

    pub fn order_desc(mut self) -> Self {
        self.desc = true;
        self
    }

    /// Start a new sub-query (OR-combined with the others).
    pub fn add_query(self) -> SubQueryBuilder {
        SubQueryBuilder {
            builder: self,
            current: SubQuery::default(),
        }
    }

    pub fn build(self) -> Result<EventQuery, InvalidQuery> {
        if self.sub_queries.is_empty() {
            return Err(InvalidQuery("at least one sub-query is required".to_string()));
        }
        if self.limit == Some(0) {
            return Err(InvalidQuery("limit must be greater than zero".to_string()));
        }
        if let Some(owner) = &self.resource_owner {
            if owner.trim().is_empty() {
                return Err(InvalidQuery("empty resource owner".to_string()));
            }
        }
        for (index, sub) in self.sub_queries.iter().enumerate() {
            sub.validate(index)?;
        }
        Ok(EventQuery {
            sub_queries: self.sub_queries,
            tenant: self.tenant,
            resource_owner: self.resource_owner,
            position_greater: self.position_greater,
            position_at_most: None,
            limit: self.limit,
            order_by: self.order_by,
            desc: self.desc,
        })
    }
}

/// Builder for a single sub-query.
#[derive(Debug, Clone)]
pub struct SubQueryBuilder {
    builder: EventQueryBuilder,
    current: SubQuery,
}

impl SubQueryBuilder {
    pub fn aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.current.aggregate_ids = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn sequence_greater(mut self, sequence: u64) -> Self {
        self.current.sequence_greater = Some(sequence);
        self
    }

    pub fn sequence_less(mut self, sequence: u64) -> Self {
        self.current.sequence_less = Some(sequence);
        self
    }

    /// Close this sub-query and start another one.
    pub fn or(self) -> SubQueryBuilder {
        self.builder().add_query()
    }

    /// Close this sub-query and return to the builder.
    pub fn builder(mut self) -> EventQueryBuilder {
        self.builder.sub_queries.push(self.current);
        self.builder
    }

    pub fn build(self) -> Result<EventQuery, InvalidQuery> {
        self.builder().build()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use keyward_core::AggregateId;
    use proptest::prelude::*;
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use super::*;

    fn event(tenant: TenantId, agg_type: &str, id: &str, sequence: u64, position: u64, event_type: &str) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::now_v7(),
            tenant_id: tenant,
            aggregate_type: agg_type.to_string(),
            aggregate_id: AggregateId::parse(id).unwrap(),
            resource_owner: "org1".to_string(),
            sequence,
            position,
            event_type: event_type.to_string(),
            payload: JsonValue::Null,
            editor: "system".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn query_without_sub_queries_is_rejected() {
        let err = EventQuery::builder().build().unwrap_err();
        assert!(err.0.contains("sub-query"));
        let domain: DomainError = err.into();
        assert!(matches!(domain, DomainError::InvalidArgument(_)));
    }

    #[test]
    fn empty_filter_values_and_ranges_are_rejected() {
        assert!(EventQuery::builder().add_query().aggregate_types([""]).build().is_err());
        assert!(EventQuery::builder()
            .add_query()
            .sequence_greater(5)
            .sequence_less(5)
            .build()
            .is_err());
        assert!(EventQuery::builder().limit(0).add_query().build().is_err());
    }

    #[test]
    fn sub_queries_are_or_combined_and_filters_and_combined() {
        let tenant = TenantId::new();
        let query = EventQuery::builder()
            .tenant(tenant)
            .add_query()
            .aggregate_types(["session"])
            .aggregate_ids(["s1"])
            .or()
            .aggregate_types(["user"])
            .event_types(["user.human.added"])
            .build()
            .unwrap();

        assert!(query.matches(&event(tenant, "session", "s1", 1, 1, "session.added")));
        assert!(!query.matches(&event(tenant, "session", "s2", 1, 2, "session.added")));
        assert!(query.matches(&event(tenant, "user", "u1", 1, 3, "user.human.added")));
        assert!(!query.matches(&event(tenant, "user", "u1", 2, 4, "user.removed")));
        assert!(!query.matches(&event(TenantId::new(), "session", "s1", 1, 5, "session.added")));
    }

    #[test]
    fn sequence_bounds_are_exclusive() {
        let tenant = TenantId::new();
        let query = EventQuery::builder()
            .add_query()
            .sequence_greater(1)
            .sequence_less(3)
            .build()
            .unwrap();
        assert!(!query.matches(&event(tenant, "session", "s1", 1, 1, "x")));
        assert!(query.matches(&event(tenant, "session", "s1", 2, 2, "x")));
        assert!(!query.matches(&event(tenant, "session", "s1", 3, 3, "x")));
    }

    #[test]
    fn position_bounds_apply_to_every_sub_query() {
        let tenant = TenantId::new();
        let query = EventQuery::builder()
            .position_greater(10)
            .add_query()
            .aggregate_types(["session"])
            .or()
            .aggregate_types(["user"])
            .build()
            .unwrap()
            .bounded_at(20);
        assert!(!query.matches(&event(tenant, "user", "u1", 1, 10, "x")));
        assert!(query.matches(&event(tenant, "user", "u1", 2, 11, "x")));
        assert!(query.matches(&event(tenant, "session", "s1", 1, 20, "x")));
        assert!(!query.matches(&event(tenant, "session", "s1", 2, 21, "x")));
    }

    proptest! {
        /// Arranged output is sorted by (sequence, position) and respects the limit.
        #[test]
        fn arrange_orders_by_sequence_then_position(
            seqs in prop::collection::vec(1u64..20, 0..40),
            limit in 1u64..50,
        ) {
            let tenant = TenantId::new();
            let events: Vec<StoredEvent> = seqs
                .iter()
                .enumerate()
                .map(|(i, s)| event(tenant, "session", &format!("s{}", i % 3), *s, i as u64 + 1, "x"))
                .collect();
            let query = EventQuery::builder().limit(limit).add_query().build().unwrap();
            let arranged = query.arrange(events.clone());

            prop_assert!(arranged.len() as u64 <= limit);
            prop_assert_eq!(arranged.len(), events.len().min(limit as usize));
            for pair in arranged.windows(2) {
                prop_assert!((pair[0].sequence, pair[0].position) < (pair[1].sequence, pair[1].position));
            }
        }
    }
}
