//! Storage contract of the projection engine.
//!
//! A projection store owns three things per projection: the read model
//! tables, the cursor (last applied log position) and the failed-event
//! records. The engine only ever talks to this trait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keyward_core::TenantId;
use keyward_events::{Condition, ProjectionError, SqlValue, Statement, Table};

/// One read model row, keyed by column name.
pub type Row = BTreeMap<&'static str, SqlValue>;

/// An event a projection could not apply.
///
/// The record stays after the event has been skipped, so operators can see
/// what was lost and acknowledge it with `remove_failed_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub projection_name: String,
    pub failed_position: u64,
    pub failure_count: u32,
    pub last_error: String,
    pub tenant_id: TenantId,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedEventFilter {
    pub projection_name: Option<String>,
    pub tenant_id: Option<TenantId>,
}

impl FailedEventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn projection(mut self, name: impl Into<String>) -> Self {
        self.projection_name = Some(name.into());
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn matches(&self, event: &FailedEvent) -> bool {
        self.projection_name
            .as_deref()
            .is_none_or(|name| name == event.projection_name)
            && self.tenant_id.is_none_or(|tenant| tenant == event.tenant_id)
    }
}

/// Persistence for read models, cursors, leases and failed events.
///
/// ## Atomicity
///
/// `apply` executes the statement and moves the cursor in one unit: either
/// both happen or neither does. A crash between two events therefore never
/// leaves a statement applied without its cursor (or the reverse).
///
/// ## Leases
///
/// `try_lock` succeeds when nobody holds the projection, the previous lease
/// expired, or `holder` already holds it (which renews the lease).
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Create the table and its indexes if missing.
    async fn init_schema(&self, table: &Table) -> Result<(), ProjectionError>;

    async fn try_lock(&self, projection: &str, holder: &str, lease: Duration) -> Result<bool, ProjectionError>;

    /// Release the lease if `holder` still owns it.
    async fn unlock(&self, projection: &str, holder: &str) -> Result<(), ProjectionError>;

    /// Last applied position, 0 for a new projection.
    async fn current_position(&self, projection: &str) -> Result<u64, ProjectionError>;

    async fn apply(&self, projection: &str, statement: &Statement, position: u64) -> Result<(), ProjectionError>;

    /// Count one more failure of the event at `position` and return the total.
    async fn record_failure(
        &self,
        projection: &str,
        position: u64,
        tenant_id: TenantId,
        error: &str,
    ) -> Result<u32, ProjectionError>;

    /// Move the cursor to `position` without touching the read model.
    /// The cursor never moves backwards.
    async fn skip(&self, projection: &str, position: u64) -> Result<(), ProjectionError>;

    async fn failed_events(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>, ProjectionError>;

    /// Returns whether a record was removed.
    async fn remove_failed_event(&self, projection: &str, position: u64) -> Result<bool, ProjectionError>;

    /// Rows of `table` matching every condition. A `Null` condition matches
    /// `NULL` values.
    async fn select(&self, table: &Table, conditions: &[Condition]) -> Result<Vec<Row>, ProjectionError>;
}

#[async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn init_schema(&self, table: &Table) -> Result<(), ProjectionError> {
        (**self).init_schema(table).await
    }

    async fn try_lock(&self, projection: &str, holder: &str, lease: Duration) -> Result<bool, ProjectionError> {
        (**self).try_lock(projection, holder, lease).await
    }

    async fn unlock(&self, projection: &str, holder: &str) -> Result<(), ProjectionError> {
        (**self).unlock(projection, holder).await
    }

    async fn current_position(&self, projection: &str) -> Result<u64, ProjectionError> {
        (**self).current_position(projection).await
    }

    async fn apply(&self, projection: &str, statement: &Statement, position: u64) -> Result<(), ProjectionError> {
        (**self).apply(projection, statement, position).await
    }

    async fn record_failure(
        &self,
        projection: &str,
        position: u64,
        tenant_id: TenantId,
        error: &str,
    ) -> Result<u32, ProjectionError> {
        (**self).record_failure(projection, position, tenant_id, error).await
    }

    async fn skip(&self, projection: &str, position: u64) -> Result<(), ProjectionError> {
        (**self).skip(projection, position).await
    }

    async fn failed_events(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>, ProjectionError> {
        (**self).failed_events(filter).await
    }

    async fn remove_failed_event(&self, projection: &str, position: u64) -> Result<bool, ProjectionError> {
        (**self).remove_failed_event(projection, position).await
    }

    async fn select(&self, table: &Table, conditions: &[Condition]) -> Result<Vec<Row>, ProjectionError> {
        (**self).select(table, conditions).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn failed(name: &str, tenant_id: TenantId) -> FailedEvent {
        FailedEvent {
            projection_name: name.into(),
            failed_position: 4,
            failure_count: 1,
            last_error: "boom".into(),
            tenant_id,
            last_failed_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn filter_narrows_by_projection_and_tenant() {
        let tenant = TenantId::new();
        let other = TenantId::new();
        let event = failed("sessions", tenant);

        assert!(FailedEventFilter::all().matches(&event));
        assert!(FailedEventFilter::all().projection("sessions").matches(&event));
        assert!(!FailedEventFilter::all().projection("users").matches(&event));
        assert!(FailedEventFilter::all().tenant(tenant).matches(&event));
        assert!(!FailedEventFilter::all().projection("sessions").tenant(other).matches(&event));
    }
}
