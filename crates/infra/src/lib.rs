//! Infrastructure layer: event log, command service, projections, queries
//! and configuration.

pub mod command;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod query;
pub mod workers;


pub use command::{CommandContext, Commands, CommandsBuilder, RetryPolicy};
pub use config::{ConfigError, KeywardConfig};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, PostgresEventStore};
pub use projections::{ProjectionEngine, ProjectionStore, TickReport};
pub use query::Queries;
pub use workers::{ProjectionWorker, WorkerHandle};
