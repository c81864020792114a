//! `keyward-events`: event records, queries, write models and projection contracts.
//!
//! Storage-independent: backends live in `keyward-infra`.

mod envelope;
mod event;
pub mod projection;
pub mod query;
pub mod registry;
pub mod statement;
pub mod write_model;

pub use envelope::{StoredEvent, UncommittedEvent, UniqueConstraint};
pub use event::DomainEvent;
pub use projection::{Projection, ProjectionError, Subscription};
pub use query::{EventQuery, EventQueryBuilder, InvalidQuery, OrderBy, SubQuery, SubQueryBuilder};
pub use registry::{EventRegistry, EventRegistryBuilder, RegistryError};
pub use statement::{Column, ColumnDef, ColumnType, Condition, Index, SqlValue, Statement, Table};
pub use write_model::{WriteModel, WriteModelState, fold};
