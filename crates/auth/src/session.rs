//! Login sessions (event-sourced).
//!
//! A session starts Active, accumulates checks (user, password) and metadata,
//! carries an encrypted session token, and ends Terminated. Terminated is
//! terminal: every further update fails with `PreconditionFailed`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keyward_core::{AggregateId, AggregateRef, DomainError, TenantId, UserId};
use keyward_events::{DomainEvent, EventQuery, StoredEvent, WriteModel, WriteModelState};

use crate::crypto::CryptoValue;

pub const AGGREGATE_TYPE: &str = "session";

pub type Metadata = BTreeMap<String, Vec<u8>>;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "session.added")]
    Added,

    #[serde(rename = "session.user.checked")]
    UserChecked {
        user_id: UserId,
        checked_at: DateTime<Utc>,
    },

    #[serde(rename = "session.password.checked")]
    PasswordChecked { checked_at: DateTime<Utc> },

    #[serde(rename = "session.token.set")]
    TokenSet { token: CryptoValue },

    /// Carries the complete metadata map after the change.
    #[serde(rename = "session.metadata.set")]
    MetadataSet { metadata: Metadata },

    #[serde(rename = "session.terminated")]
    Terminated,
}

impl DomainEvent for SessionEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[
        "session.added",
        "session.user.checked",
        "session.password.checked",
        "session.token.set",
        "session.metadata.set",
        "session.terminated",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::Added => "session.added",
            SessionEvent::UserChecked { .. } => "session.user.checked",
            SessionEvent::PasswordChecked { .. } => "session.password.checked",
            SessionEvent::TokenSet { .. } => "session.token.set",
            SessionEvent::MetadataSet { .. } => "session.metadata.set",
            SessionEvent::Terminated => "session.terminated",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Checks
// ─────────────────────────────────────────────────────────────────────────────

/// A verification requested as part of creating or updating a session.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionCheck {
    User(UserId),
    Password(String),
}

impl core::fmt::Debug for SessionCheck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SessionCheck::User(user_id) => f.debug_tuple("User").field(user_id).finish(),
            SessionCheck::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Unspecified,
    Active,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unspecified => "unspecified",
            SessionState::Active => "active",
            SessionState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWriteModel {
    base: WriteModelState,
    pub session_state: SessionState,
    pub user_id: Option<UserId>,
    pub user_checked_at: Option<DateTime<Utc>>,
    pub password_checked_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub token: Option<CryptoValue>,
}

impl SessionWriteModel {
    pub fn new(tenant_id: TenantId, session_id: AggregateId, resource_owner: impl Into<String>) -> Self {
        Self {
            base: WriteModelState::new(tenant_id, session_id, resource_owner),
            session_state: SessionState::Unspecified,
            user_id: None,
            user_checked_at: None,
            password_checked_at: None,
            metadata: Metadata::new(),
            token: None,
        }
    }

    pub fn session_id(&self) -> &AggregateId {
        &self.base.aggregate_id
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    pub fn check_is_active(&self) -> Result<(), DomainError> {
        if self.session_state != SessionState::Active {
            return Err(DomainError::precondition("session is not active"));
        }
        Ok(())
    }

    /// A session is bound to at most one user.
    pub fn check_user(&self, user_id: &UserId) -> Result<(), DomainError> {
        match &self.user_id {
            Some(bound) if bound != user_id => {
                Err(DomainError::invalid_argument("user change not possible"))
            }
            _ => Ok(()),
        }
    }

    /// Apply requested metadata changes and return the resulting map if
    /// anything changed.
    ///
    /// A non-empty value sets the key. An empty value removes the key if it
    /// exists.
    pub fn metadata_changes(&self, changes: &Metadata) -> Option<Metadata> {
        let mut metadata = self.metadata.clone();
        let mut changed = false;
        for (key, value) in changes {
            if value.is_empty() {
                changed |= metadata.remove(key).is_some();
            } else if metadata.get(key) != Some(value) {
                metadata.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed.then_some(metadata)
    }
}

impl WriteModel for SessionWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        let mut builder = EventQuery::builder().tenant(self.base.tenant_id);
        if !self.base.resource_owner.is_empty() {
            builder = builder.resource_owner(self.base.resource_owner.clone());
        }
        Ok(builder
            .add_query()
            .aggregate_types([AGGREGATE_TYPE])
            .aggregate_ids([self.base.aggregate_id.as_str()])
            .event_types(SessionEvent::EVENT_TYPES.iter().copied())
            .build()?)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<SessionEvent>()? {
            SessionEvent::Added => self.session_state = SessionState::Active,
            SessionEvent::UserChecked {
                user_id,
                checked_at,
            } => {
                self.user_id = Some(user_id);
                self.user_checked_at = Some(checked_at);
            }
            SessionEvent::PasswordChecked { checked_at } => {
                self.password_checked_at = Some(checked_at);
            }
            SessionEvent::TokenSet { token } => self.token = Some(token),
            SessionEvent::MetadataSet { metadata } => self.metadata = metadata,
            SessionEvent::Terminated => self.session_state = SessionState::Terminated,
        }
        Ok(())
    }

    fn state(&self) -> &WriteModelState {
        &self.base
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.base
    }
}
