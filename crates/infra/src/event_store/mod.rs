//! Append-only event log.
//!
//! This module defines the storage-facing abstraction for pushing and
//! filtering tenant-scoped events, with an in-memory and a Postgres backend.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError};
