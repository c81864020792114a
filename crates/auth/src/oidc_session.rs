//! OIDC sessions: the token-issuing side of a login.
//!
//! One OIDC session holds at most one current access token and one current
//! refresh token. Both are independently revocable. Refresh tokens rotate
//! on every use; only the latest id is accepted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use keyward_core::{AggregateId, AggregateRef, DomainError, TenantId, UserId};
use keyward_events::{DomainEvent, EventQuery, StoredEvent, WriteModel, WriteModelState};

use crate::token::TOKEN_DELIMITER;

pub const AGGREGATE_TYPE: &str = "oidc_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    Passkey,
    Totp,
    OtpEmail,
    Idp,
}

/// Why an access token was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenReason {
    #[default]
    Unspecified,
    AuthRequest,
    Refresh,
    ClientCredentials,
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum OidcSessionEvent {
    #[serde(rename = "oidc_session.added")]
    Added {
        user_id: UserId,
        /// Login session this OIDC session was derived from, if any.
        session_id: Option<String>,
        client_id: String,
        audience: Vec<String>,
        scope: Vec<String>,
        auth_methods: Vec<AuthMethod>,
        auth_time: DateTime<Utc>,
    },

    #[serde(rename = "oidc_session.access_token.added")]
    AccessTokenAdded {
        id: String,
        scope: Vec<String>,
        lifetime_secs: i64,
        reason: TokenReason,
    },

    #[serde(rename = "oidc_session.access_token.revoked")]
    AccessTokenRevoked,

    #[serde(rename = "oidc_session.refresh_token.added")]
    RefreshTokenAdded {
        id: String,
        lifetime_secs: i64,
        idle_lifetime_secs: i64,
    },

    #[serde(rename = "oidc_session.refresh_token.renewed")]
    RefreshTokenRenewed { id: String, idle_lifetime_secs: i64 },

    #[serde(rename = "oidc_session.refresh_token.revoked")]
    RefreshTokenRevoked,
}

impl DomainEvent for OidcSessionEvent {
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;
    const EVENT_TYPES: &'static [&'static str] = &[
        "oidc_session.added",
        "oidc_session.access_token.added",
        "oidc_session.access_token.revoked",
        "oidc_session.refresh_token.added",
        "oidc_session.refresh_token.renewed",
        "oidc_session.refresh_token.revoked",
    ];

    fn event_type(&self) -> &'static str {
        match self {
            OidcSessionEvent::Added { .. } => "oidc_session.added",
            OidcSessionEvent::AccessTokenAdded { .. } => "oidc_session.access_token.added",
            OidcSessionEvent::AccessTokenRevoked => "oidc_session.access_token.revoked",
            OidcSessionEvent::RefreshTokenAdded { .. } => "oidc_session.refresh_token.added",
            OidcSessionEvent::RefreshTokenRenewed { .. } => "oidc_session.refresh_token.renewed",
            OidcSessionEvent::RefreshTokenRevoked => "oidc_session.refresh_token.revoked",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OidcSessionState {
    #[default]
    Unspecified,
    Active,
}

/// Expirations are derived from the event's creation time, never from the
/// clock, so the fold stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcSessionWriteModel {
    base: WriteModelState,
    pub session_state: OidcSessionState,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub client_id: String,
    pub audience: Vec<String>,
    pub scope: Vec<String>,
    pub auth_methods: Vec<AuthMethod>,
    pub auth_time: Option<DateTime<Utc>>,

    pub access_token_id: Option<String>,
    pub access_token_expiration: Option<DateTime<Utc>>,
    pub access_token_reason: TokenReason,

    pub refresh_token_id: Option<String>,
    pub refresh_token_expiration: Option<DateTime<Utc>>,
    pub refresh_token_idle_expiration: Option<DateTime<Utc>>,
}

impl OidcSessionWriteModel {
    pub fn new(tenant_id: TenantId, oidc_session_id: AggregateId, resource_owner: impl Into<String>) -> Self {
        Self {
            base: WriteModelState::new(tenant_id, oidc_session_id, resource_owner),
            session_state: OidcSessionState::Unspecified,
            user_id: None,
            session_id: None,
            client_id: String::new(),
            audience: Vec::new(),
            scope: Vec::new(),
            auth_methods: Vec::new(),
            auth_time: None,
            access_token_id: None,
            access_token_expiration: None,
            access_token_reason: TokenReason::Unspecified,
            refresh_token_id: None,
            refresh_token_expiration: None,
            refresh_token_idle_expiration: None,
        }
    }

    pub fn oidc_session_id(&self) -> &AggregateId {
        &self.base.aggregate_id
    }

    pub fn aggregate(&self) -> AggregateRef {
        self.base.aggregate(AGGREGATE_TYPE)
    }

    pub fn is_active(&self) -> bool {
        self.session_state == OidcSessionState::Active
    }

    /// `<oidcSessionID>-<refreshTokenID>`, the part of a refresh token
    /// before the subject.
    pub fn refresh_token_reference(&self, refresh_token_id: &str) -> String {
        format!("{}{TOKEN_DELIMITER}{refresh_token_id}", self.base.aggregate_id)
    }

    pub fn check_refresh_token(&self, refresh_token_id: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_active() || self.refresh_token_id.as_deref() != Some(refresh_token_id) {
            return Err(DomainError::RefreshTokenInvalid);
        }
        let expired = |at: Option<DateTime<Utc>>| at.is_none_or(|at| at <= now);
        if expired(self.refresh_token_expiration) || expired(self.refresh_token_idle_expiration) {
            return Err(DomainError::RefreshTokenInvalid);
        }
        Ok(())
    }

    pub fn check_access_token(&self, access_token_id: &str, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_active() || self.access_token_id.as_deref() != Some(access_token_id) {
            return Err(DomainError::precondition("access token is invalid"));
        }
        if self.access_token_expiration.is_none_or(|at| at <= now) {
            return Err(DomainError::precondition("access token is expired"));
        }
        Ok(())
    }

    /// The revoking client must be part of the session's audience.
    pub fn check_client(&self, client_id: &str) -> Result<(), DomainError> {
        if self.audience.iter().any(|aud| aud == client_id) {
            return Ok(());
        }
        Err(DomainError::permission_denied(
            "client is not part of the token audience",
        ))
    }
}

impl WriteModel for OidcSessionWriteModel {
    fn query(&self) -> Result<EventQuery, DomainError> {
        let mut builder = EventQuery::builder().tenant(self.base.tenant_id);
        if !self.base.resource_owner.is_empty() {
            builder = builder.resource_owner(self.base.resource_owner.clone());
        }
        Ok(builder
            .add_query()
            .aggregate_types([AGGREGATE_TYPE])
            .aggregate_ids([self.base.aggregate_id.as_str()])
            .event_types(OidcSessionEvent::EVENT_TYPES.iter().copied())
            .build()?)
    }

    fn reduce(&mut self, event: &StoredEvent) -> Result<(), DomainError> {
        let at = event.created_at;
        match event.decode::<OidcSessionEvent>()? {
            OidcSessionEvent::Added {
                user_id,
                session_id,
                client_id,
                audience,
                scope,
                auth_methods,
                auth_time,
            } => {
                self.session_state = OidcSessionState::Active;
                self.user_id = Some(user_id);
                self.session_id = session_id;
                self.client_id = client_id;
                self.audience = audience;
                self.scope = scope;
                self.auth_methods = auth_methods;
                self.auth_time = Some(auth_time);
            }
            OidcSessionEvent::AccessTokenAdded {
                id,
                scope,
                lifetime_secs,
                reason,
            } => {
                self.access_token_id = Some(id);
                self.access_token_expiration = Some(at + Duration::seconds(lifetime_secs));
                self.access_token_reason = reason;
                self.scope = scope;
            }
            OidcSessionEvent::AccessTokenRevoked => {
                self.access_token_id = None;
                self.access_token_expiration = None;
            }
            OidcSessionEvent::RefreshTokenAdded {
                id,
                lifetime_secs,
                idle_lifetime_secs,
            } => {
                self.refresh_token_id = Some(id);
                self.refresh_token_expiration = Some(at + Duration::seconds(lifetime_secs));
                self.refresh_token_idle_expiration = Some(at + Duration::seconds(idle_lifetime_secs));
            }
            OidcSessionEvent::RefreshTokenRenewed {
                id,
                idle_lifetime_secs,
            } => {
                self.refresh_token_id = Some(id);
                self.refresh_token_idle_expiration = Some(at + Duration::seconds(idle_lifetime_secs));
            }
            OidcSessionEvent::RefreshTokenRevoked => {
                self.refresh_token_id = None;
                self.refresh_token_expiration = None;
                self.refresh_token_idle_expiration = None;
            }
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
    use chrono::TimeZone;
    use keyward_events::fold;

    use super::*;
    use crate::testing::stored;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn added() -> OidcSessionEvent {
        OidcSessionEvent::Added {
            user_id: UserId::parse("u1").unwrap(),
            session_id: None,
            client_id: "app".into(),
            audience: vec!["app".into(), "api".into()],
            scope: vec!["openid".into()],
            auth_methods: vec![AuthMethod::Password],
            auth_time: t0(),
        }
    }

    fn model_with(tenant: TenantId, events: &[OidcSessionEvent]) -> OidcSessionWriteModel {
        let stored_events: Vec<_> = events
            .iter()
            .enumerate()
            .map(|(i, e)| stored(tenant, "V2_o1", i as u64 + 1, e, t0()))
            .collect();
        let mut model = OidcSessionWriteModel::new(tenant, AggregateId::parse("V2_o1").unwrap(), "");
        fold(&mut model, &stored_events).unwrap();
        model
    }

    #[test]
    fn access_token_expires_after_its_lifetime() {
        let tenant = TenantId::new();
        let model = model_with(
            tenant,
            &[
                added(),
                OidcSessionEvent::AccessTokenAdded {
                    id: "at_1".into(),
                    scope: vec!["openid".into()],
                    lifetime_secs: 3600,
                    reason: TokenReason::AuthRequest,
                },
            ],
        );
        assert_eq!(model.access_token_expiration, Some(t0() + Duration::hours(1)));
        assert!(model.check_access_token("at_1", t0()).is_ok());
        assert!(model.check_access_token("at_2", t0()).is_err());
        assert!(model.check_access_token("at_1", t0() + Duration::hours(1)).is_err());
    }

    #[test]
    fn renewed_refresh_token_invalidates_the_previous_id() {
        let tenant = TenantId::new();
        let model = model_with(
            tenant,
            &[
                added(),
                OidcSessionEvent::RefreshTokenAdded {
                    id: "rt_1".into(),
                    lifetime_secs: 7200,
                    idle_lifetime_secs: 600,
                },
                OidcSessionEvent::RefreshTokenRenewed {
                    id: "rt_2".into(),
                    idle_lifetime_secs: 600,
                },
            ],
        );
        assert_eq!(
            model.check_refresh_token("rt_1", t0()),
            Err(DomainError::RefreshTokenInvalid)
        );
        assert!(model.check_refresh_token("rt_2", t0()).is_ok());
        assert_eq!(
            model.check_refresh_token("rt_2", t0() + Duration::seconds(600)),
            Err(DomainError::RefreshTokenInvalid)
        );
    }

    #[test]
    fn revoked_tokens_fail_their_checks() {
        let tenant = TenantId::new();
        let model = model_with(
            tenant,
            &[
                added(),
                OidcSessionEvent::AccessTokenAdded {
                    id: "at_1".into(),
                    scope: vec![],
                    lifetime_secs: 60,
                    reason: TokenReason::AuthRequest,
                },
                OidcSessionEvent::RefreshTokenAdded {
                    id: "rt_1".into(),
                    lifetime_secs: 60,
                    idle_lifetime_secs: 60,
                },
                OidcSessionEvent::AccessTokenRevoked,
                OidcSessionEvent::RefreshTokenRevoked,
            ],
        );
        assert!(model.check_access_token("at_1", t0()).is_err());
        assert!(model.check_refresh_token("rt_1", t0()).is_err());
        assert!(model.is_active());
    }

    #[test]
    fn only_audience_members_pass_the_client_check() {
        let model = model_with(TenantId::new(), &[added()]);
        assert!(model.check_client("api").is_ok());
        assert!(matches!(
            model.check_client("other"),
            Err(DomainError::PermissionDenied(_))
        ));
        assert_eq!(model.refresh_token_reference("rt_9"), "V2_o1-rt_9");
    }

    #[test]
    fn unknown_session_rejects_refresh_tokens() {
        let model = model_with(TenantId::new(), &[]);
        assert!(!model.is_active());
        assert_eq!(
            model.check_refresh_token("rt_1", t0()),
            Err(DomainError::RefreshTokenInvalid)
        );
    }
}
