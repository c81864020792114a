//! Aggregate identity, optimistic concurrency and command results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AggregateId, TenantId};

/// Identity of one aggregate instance within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    /// Organization (or instance) that owns the aggregate.
    pub resource_owner: String,
}

impl AggregateRef {
    pub fn new(
        tenant_id: TenantId,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        resource_owner: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            resource_owner: resource_owner.into(),
        }
    }
}

/// Optimistic concurrency expectation on an aggregate's sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpectedSequence {
    /// Skip sequence checking.
    #[default]
    Any,
    /// Require the aggregate to be at exactly this sequence (0 = no events yet).
    Exact(u64),
}

impl ExpectedSequence {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedSequence::Any => true,
            ExpectedSequence::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Audit details returned by every successful command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDetails {
    pub sequence: u64,
    pub change_date: Option<DateTime<Utc>>,
    pub resource_owner: String,
}
