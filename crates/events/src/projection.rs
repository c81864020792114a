use thiserror::Error;

use keyward_core::DomainError;

use crate::{Statement, StoredEvent, Table};

/// Aggregate type plus the event types a projection consumes from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub aggregate_type: &'static str,
    pub event_types: Vec<&'static str>,
}

impl Subscription {
    pub fn new(aggregate_type: &'static str, event_types: &[&'static str]) -> Self {
        Self {
            aggregate_type,
            event_types: event_types.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// The reducer could not interpret the event.
    #[error("failed to reduce {event_type} at position {position}: {message}")]
    Reduce {
        event_type: String,
        position: u64,
        message: String,
    },

    /// The statement could not be executed against the read model.
    #[error("statement execution failed: {0}")]
    Execution(String),

    /// Cursor, lock or failed-event bookkeeping failed.
    #[error("projection store failed: {0}")]
    Store(String),
}

impl From<ProjectionError> for DomainError {
    fn from(value: ProjectionError) -> Self {
        match value {
            ProjectionError::Store(msg) => DomainError::unavailable(msg),
            other => DomainError::internal(other.to_string()),
        }
    }
}

impl ProjectionError {
    pub fn reduce(event: &StoredEvent, message: impl core::fmt::Display) -> Self {
        Self::Reduce {
            event_type: event.event_type.clone(),
            position: event.position,
            message: message.to_string(),
        }
    }
}

/// A projection builds a relational read model from the event log.
///
/// Projections implement the **CQRS read model pattern**. The engine feeds
/// them events in log position order and executes the returned statement
/// atomically with the projection's cursor.
///
/// ## Reducers
///
/// `reduce` decodes the event into the aggregate's closed event enum and
/// matches exhaustively. Combinations the projection does not care about
/// return [`Statement::NoOp`].
///
/// ## Idempotency
///
/// Delivery is at-least-once from the reducer's point of view (a failed
/// statement is retried on the next tick), so statements should be safe to
/// re-execute after a rollback.
///
/// ## Disposability
///
/// Read models can be dropped and rebuilt from the log at any time by
/// resetting the cursor.
pub trait Projection: Send + Sync + 'static {
    /// Unique projection name; keys the cursor, lock and failed events.
    fn name(&self) -> &'static str;

    fn schema(&self) -> Table;

    /// Events the engine should feed this projection.
    fn subscriptions(&self) -> Vec<Subscription>;

    fn reduce(&self, event: &StoredEvent) -> Result<Statement, ProjectionError>;
}
