//! `keyward-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRef, ExpectedSequence, ObjectDetails};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{AggregateId, IdGenerator, SequentialIdGenerator, TenantId, UserId, UuidGenerator};
