//! Human users (event-sourced).
//!
//! Usernames are unique per tenant. The reservation travels with the event
//! as a unique constraint, so a clash fails the push with `AlreadyExists`.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use keyward_core::{AggregateRef, DomainError, TenantId, UserId};
use keyward_events::{DomainEvent, EventQuery, StoredEvent, UniqueConstraint, WriteModel, WriteModelState};

use crate::crypto::CryptoValue;

pub const AGGREGATE_TYPE: &str = "user";

/// Unique constraint type reserving usernames within a tenant.
pub const USERNAME_UNIQUE_TYPE: &str = "usernames";

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum HumanEvent {
    #[serde(rename = "user.human.added")]
    Added {
        username: String,
        email: String,
        /// Encoded password hash, if the user was created with a password.
        encoded_hash: Option<String>,
    },

    #[serde(rename = "user.human.email.changed")]
    EmailChanged { email: String },

    #[serde(rename = "user.human.email.verified")]
    EmailVerified,

    /// A verification code for the current, unverified address.
    #[serde(rename = "user.human.email.code.added")]
    EmailCodeAdded { code: CryptoValue, expiry_secs: i64 },

    #[serde(rename = "user.human.email.verification.failed")]
    EmailVerificationFailed,

    #[serde(rename = "user.human.password.changed")]
    PasswordChanged { encoded_hash: String },

    #[serde(rename = "user.metadata.set")]
    MetadataSet { key: String, value: Vec<u8> },

    #[serde(rename = "user.metadata.removed")]
    MetadataRemoved { key: String },

    #[serde(rename = "user.removed")]
    Removed { username: String },
}

impl DomainEvent for HumanEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[
        "user.human.added",
        "user.human.email.changed",
        "user.human.email.verified",
        "user.human.email.code.added",
        "user.human.email.verification.failed",
        "user.human.password.changed",
        "user.metadata.set",
        "user.metadata.removed",
        "user.removed",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            HumanEvent::Added { .. } => "user.human.added",
            HumanEvent::EmailChanged { .. } => "user.human.email.changed",
            HumanEvent::EmailVerified => "user.human.email.verified",
            HumanEvent::EmailCodeAdded { .. } => "user.human.email.code.added",
            HumanEvent::EmailVerificationFailed => "user.human.email.verification.failed",
            HumanEvent::PasswordChanged { .. } => "user.human.password.changed",
            HumanEvent::MetadataSet { .. } => "user.metadata.set",
            HumanEvent::MetadataRemoved { .. } => "user.metadata.removed",
            HumanEvent::Removed { .. } => "user.removed",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Trim and lowercase a username; rejects empty names and whitespace.
pub fn normalize_username(username: &str) -> Result<String, DomainError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(DomainError::invalid_argument("username is empty"));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(DomainError::invalid_argument("username must not contain whitespace"));
    }
    Ok(username.to_lowercase())
}

/// Basic `local@domain` shape check; returns the trimmed, lowercased address.
pub fn normalize_email(email: &str) -> Result<String, DomainError> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(DomainError::invalid_argument("invalid email format"));
    }
    Ok(email.to_lowercase())
}

pub fn add_username_constraint(username: &str) -> UniqueConstraint {
    UniqueConstraint::add(USERNAME_UNIQUE_TYPE, username, "username already taken")
}

pub fn remove_username_constraint(username: &str) -> UniqueConstraint {
    UniqueConstraint::remove(USERNAME_UNIQUE_TYPE, username)
}

// ─────────────────────────────────────────────────────────────────────────────
// Write models
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

impl UserState {
    pub fn exists(&self) -> bool {
        *self == UserState::Active
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::Unspecified => "unspecified",
            UserState::Active => "active",
            UserState::Removed => "removed",
        }
    }
}

fn user_query(base: &WriteModelState, event_types: &[&str]) -> Result<EventQuery, DomainError> {
    let mut builder = EventQuery::builder().tenant(base.tenant_id);
    if !base.resource_owner.is_empty() {
        builder = builder.resource_owner(base.resource_owner.clone());
    }
    Ok(builder
        .add_query()
        .aggregate_types([AGGREGATE_TYPE])
        .aggregate_ids([base.aggregate_id.as_str()])
        .event_types(event_types.iter().copied())
        .build()?)
}

/// Profile state of a human user: username, email and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanWriteModel {
    base: WriteModelState,
    pub user_state: UserState,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    /// Pending verification code of the current address.
    pub email_code: Option<EmailCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailCode {
    pub code: CryptoValue,
    pub created_at: DateTime<Utc>,
    pub expiry: Duration,
}

impl EmailCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.created_at + self.expiry
    }
}

impl HumanWriteModel {
    pub fn new(tenant_id: TenantId, user_id: UserId, resource_owner: impl Into<String>) -> Self {
        Self {
            base: WriteModelState::new(tenant_id, user_id.into(), resource_owner),
            user_state: UserState::Unspecified,
            username: String::new(),
            email: String::new(),
            email_verified: false,
            email_code: None,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.base.aggregate_id.clone().into()
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    pub fn check_exists(&self) -> Result<(), DomainError> {
        if !self.user_state.exists() {
            return Err(DomainError::not_found("user not found"));
        }
        Ok(())
    }
}

impl WriteModel for HumanWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        user_query(&self.base, HumanEvent::EVENT_TYPES)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<HumanEvent>()? {
            HumanEvent::Added {
                username, email, ..
            } => {
                self.user_state = UserState::Active;
                self.username = username;
                self.email = email;
                self.email_verified = false;
            }
            HumanEvent::EmailChanged { email } => {
                self.email = email;
                self.email_verified = false;
                self.email_code = None;
            }
            HumanEvent::EmailVerified => {
                self.email_verified = true;
                self.email_code = None;
            }
            HumanEvent::EmailCodeAdded { code, expiry_secs } => {
                self.email_code = Some(EmailCode {
                    code,
                    created_at: event.created_at,
                    expiry: Duration::seconds(expiry_secs),
                });
            }
            HumanEvent::Removed { .. } => {
                self.user_state = UserState::Removed;
                self.email_code = None;
            }
            HumanEvent::EmailVerificationFailed
            | HumanEvent::PasswordChanged { .. }
            | HumanEvent::MetadataSet { .. }
            | HumanEvent::MetadataRemoved { .. } => {}
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

/// Password state of a human user, loaded by the session password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanPasswordWriteModel {
    base: WriteModelState,
    pub user_state: UserState,
    pub encoded_hash: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
}

impl HumanPasswordWriteModel {
    pub fn new(tenant_id: TenantId, user_id: UserId, resource_owner: impl Into<String>) -> Self {
        Self {
            base: WriteModelState::new(tenant_id, user_id.into(), resource_owner),
            user_state: UserState::Unspecified,
            encoded_hash: None,
            password_changed_at: None,
        }
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }
}

impl WriteModel for HumanPasswordWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        // Profile events carry no password state but still advance the
        // sequence a password change must expect.
        user_query(&self.base, HumanEvent::EVENT_TYPES)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<HumanEvent>()? {
            HumanEvent::Added { encoded_hash, .. } => {
                self.user_state = UserState::Active;
                if encoded_hash.is_some() {
                    self.password_changed_at = Some(event.created_at);
                }
                self.encoded_hash = encoded_hash;
            }
            HumanEvent::PasswordChanged { encoded_hash } => {
                self.encoded_hash = Some(encoded_hash);
                self.password_changed_at = Some(event.created_at);
            }
            HumanEvent::Removed { .. } => {
                self.user_state = UserState::Removed;
                self.encoded_hash = None;
            }
            HumanEvent::EmailChanged { .. }
            | HumanEvent::EmailVerified
            | HumanEvent::EmailCodeAdded { .. }
            | HumanEvent::EmailVerificationFailed
            | HumanEvent::MetadataSet { .. }
            | HumanEvent::MetadataRemoved { .. } => {}
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

/// Metadata entries of a user, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMetadataWriteModel {
    base: WriteModelState,
    pub user_state: UserState,
    pub metadata: BTreeMap<String, Vec<u8>>,
}

impl UserMetadataWriteModel {
    pub fn new(tenant_id: TenantId, user_id: UserId, resource_owner: impl Into<String>) -> Self {
        Self {
            base: WriteModelState::new(tenant_id, user_id.into(), resource_owner),
            user_state: UserState::Unspecified,
            metadata: BTreeMap::new(),
        }
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    pub fn check_exists(&self) -> Result<(), DomainError> {
        if !self.user_state.exists() {
            return Err(DomainError::not_found("user not found"));
        }
        Ok(())
    }

    /// Event setting `key` to `value`, or `None` if it already holds it.
    pub fn set_event(&self, key: &str, value: &[u8]) -> Result<Option<HumanEvent>, DomainError> {
        check_metadata_entry(key, value)?;
        if self.metadata.get(key).is_some_and(|current| current.as_slice() == value) {
            return Ok(None);
        }
        Ok(Some(HumanEvent::MetadataSet {
            key: key.to_string(),
            value: value.to_vec(),
        }))
    }

    pub fn remove_event(&self, key: &str) -> Result<HumanEvent, DomainError> {
        if key.is_empty() {
            return Err(DomainError::invalid_argument("metadata key is empty"));
        }
        if !self.metadata.contains_key(key) {
            return Err(DomainError::not_found(format!("metadata {key} not found")));
        }
        Ok(HumanEvent::MetadataRemoved { key: key.to_string() })
    }
}

fn check_metadata_entry(key: &str, value: &[u8]) -> Result<(), DomainError> {
    if key.is_empty() {
        return Err(DomainError::invalid_argument("metadata key is empty"));
    }
    if value.is_empty() {
        return Err(DomainError::invalid_argument(format!("metadata {key} has no value")));
    }
    Ok(())
}

impl WriteModel for UserMetadataWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        user_query(&self.base, HumanEvent::EVENT_TYPES)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        match event.decode::<HumanEvent>()? {
            HumanEvent::Added { .. } => self.user_state = UserState::Active,
            HumanEvent::MetadataSet { key, value } => {
                self.metadata.insert(key, value);
            }
            HumanEvent::MetadataRemoved { key } => {
                self.metadata.remove(&key);
            }
            HumanEvent::Removed { .. } => {
                self.user_state = UserState::Removed;
                self.metadata.clear();
            }
            _ => {}
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

#[cfg(test)]
mod tests {
    use keyward_events::fold;

    use super::*;
    use crate::testing::stored;

    fn added(hash: Option<&str>) -> HumanEvent {
        HumanEvent::Added {
            username: "alice".into(),
            email: "alice@example.com".into(),
            encoded_hash: hash.map(str::to_string),
        }
    }

    #[test]
    fn usernames_are_normalized() {
        assert_eq!(normalize_username("  Alice ").unwrap(), "alice");
        assert!(normalize_username("").is_err());
        assert!(normalize_username("al ice").is_err());
    }

    #[test]
    fn email_format_is_checked() {
        assert_eq!(normalize_email(" Bob@Example.com ").unwrap(), "bob@example.com");
        for bad in ["", "bob", "@example.com", "bob@", "b@b@c", "b ob@x.io"] {
            assert!(matches!(
                normalize_email(bad),
                Err(DomainError::InvalidArgument(_))
            ), "{bad}");
        }
    }

    #[test]
    fn human_write_model_tracks_email_and_removal() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut model = HumanWriteModel::new(tenant, UserId::parse("u1").unwrap(), "");
        assert!(model.check_exists().is_err());
        fold(
            &mut model,
            &[
                stored(tenant, "u1", 1, &added(None), now),
                stored(tenant, "u1", 2, &HumanEvent::EmailChanged { email: "a@b.io".into() }, now),
                stored(tenant, "u1", 3, &HumanEvent::EmailVerified, now),
            ],
        )
        .unwrap();
        assert!(model.check_exists().is_ok());
        assert_eq!(model.email, "a@b.io");
        assert!(model.email_verified);

        fold(
            &mut model,
            &[stored(tenant, "u1", 4, &HumanEvent::Removed { username: "alice".into() }, now)],
        )
        .unwrap();
        assert!(matches!(model.check_exists(), Err(DomainError::NotFound(_))));
    }

    #[test]
    fn password_write_model_follows_hash_changes() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut model = HumanPasswordWriteModel::new(tenant, UserId::parse("u1").unwrap(), "");
        fold(&mut model, &[stored(tenant, "u1", 1, &added(None), now)]).unwrap();
        assert_eq!(model.user_state, UserState::Active);
        assert_eq!(model.encoded_hash, None);

        fold(
            &mut model,
            &[stored(
                tenant,
                "u1",
                2,
                &HumanEvent::PasswordChanged { encoded_hash: "$h".into() },
                now,
            )],
        )
        .unwrap();
        assert_eq!(model.encoded_hash.as_deref(), Some("$h"));
        assert_eq!(model.password_changed_at, Some(now));
    }

    #[test]
    fn username_constraints_share_a_key() {
        assert_eq!(
            add_username_constraint("alice").key(),
            remove_username_constraint("alice").key()
        );
    }

    #[test]
    fn password_model_tracks_the_whole_user_sequence() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut model = HumanPasswordWriteModel::new(tenant, UserId::parse("u1").unwrap(), "");
        let changed = HumanEvent::EmailChanged { email: "new@example.com".into() };
        fold(
            &mut model,
            &[stored(tenant, "u1", 1, &added(Some("$h")), now), stored(tenant, "u1", 2, &changed, now)],
        )
        .unwrap();
        assert_eq!(model.processed_sequence(), 2);
        assert_eq!(model.encoded_hash.as_deref(), Some("$h"));
    }

    #[test]
    fn email_codes_are_cleared_by_change_and_verification() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let code = CryptoValue {
            algorithm: "aes-256-gcm".into(),
            key_id: "k1".into(),
            crypted: "Y29kZQ==".into(),
        };
        let code_added = HumanEvent::EmailCodeAdded { code: code.clone(), expiry_secs: 3600 };
        let mut model = HumanWriteModel::new(tenant, UserId::parse("u1").unwrap(), "");
        fold(
            &mut model,
            &[stored(tenant, "u1", 1, &added(None), now), stored(tenant, "u1", 2, &code_added, now)],
        )
        .unwrap();
        let pending = model.email_code.clone().unwrap();
        assert_eq!(pending.code, code);
        assert!(!pending.is_expired(now + Duration::minutes(59)));
        assert!(pending.is_expired(now + Duration::minutes(61)));

        fold(&mut model, &[stored(tenant, "u1", 3, &HumanEvent::EmailVerified, now)]).unwrap();
        assert_eq!(model.email_code, None);
        fold(
            &mut model,
            &[
                stored(tenant, "u1", 4, &code_added, now),
                stored(tenant, "u1", 5, &HumanEvent::EmailChanged { email: "x@y.io".into() }, now),
            ],
        )
        .unwrap();
        assert_eq!(model.email_code, None);
        assert!(!model.email_verified);
    }

    #[test]
    fn metadata_model_diffs_values_and_requires_existing_keys() {
        let tenant = TenantId::new();
        let now = Utc::now();
        let mut model = UserMetadataWriteModel::new(tenant, UserId::parse("u1").unwrap(), "");
        let set = HumanEvent::MetadataSet { key: "team".into(), value: b"blue".to_vec() };
        fold(
            &mut model,
            &[stored(tenant, "u1", 1, &added(None), now), stored(tenant, "u1", 2, &set, now)],
        )
        .unwrap();
        assert!(model.check_exists().is_ok());
        assert_eq!(model.set_event("team", b"blue").unwrap(), None);
        assert!(matches!(
            model.set_event("team", b"red").unwrap(),
            Some(HumanEvent::MetadataSet { .. })
        ));
        assert!(matches!(model.set_event("", b"x"), Err(DomainError::InvalidArgument(_))));
        assert!(matches!(model.set_event("team", b""), Err(DomainError::InvalidArgument(_))));
        assert!(matches!(model.remove_event("missing"), Err(DomainError::NotFound(_))));
        assert!(matches!(model.remove_event(""), Err(DomainError::InvalidArgument(_))));
        assert_eq!(
            model.remove_event("team").unwrap(),
            HumanEvent::MetadataRemoved { key: "team".into() }
        );

        fold(
            &mut model,
            &[stored(tenant, "u1", 3, &HumanEvent::Removed { username: "alice".into() }, now)],
        )
        .unwrap();
        assert!(model.metadata.is_empty());
        assert!(matches!(model.check_exists(), Err(DomainError::NotFound(_))));
    }

    proptest::proptest! {
        #[test]
        fn normalized_usernames_are_stable(name in "[A-Za-z0-9._]{1,16}", pad in " {0,3}") {
            let normalized = normalize_username(&format!("{pad}{name}{pad}")).unwrap();
            proptest::prop_assert_eq!(&normalized, &name.to_lowercase());
            proptest::prop_assert_eq!(normalize_username(&normalized).unwrap(), normalized.clone());
            proptest::prop_assert_eq!(normalize_username(&name.to_uppercase()).unwrap(), normalized);
        }
    }
}
