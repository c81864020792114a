//! Read side: typed views over the projected tables.
//!
//! Queries read whatever the projections have applied so far, so results may
//! lag behind the event log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use keyward_auth::user::normalize_username;
use keyward_auth::{Metadata, PasswordAgePolicy, SessionState, TokenLifetimes, UserState};
use keyward_core::{AggregateId, DomainError, DomainResult, TenantId, UserId};
use keyward_events::{Condition, Projection, SqlValue};

use crate::projections::{
    FailedEvent, FailedEventFilter, OidcSettingsProjection, PasswordAgePolicyProjection, ProjectionStore, Row,
    SessionProjection, UserMetadataProjection, UserProjection,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: AggregateId,
    pub resource_owner: String,
    pub state: SessionState,
    pub creation_date: DateTime<Utc>,
    pub change_date: DateTime<Utc>,
    pub sequence: u64,
    pub user_id: Option<UserId>,
    pub user_checked_at: Option<DateTime<Utc>>,
    pub password_checked_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub id: UserId,
    pub resource_owner: String,
    pub state: UserState,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub password_set: bool,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
    pub change_date: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OidcSettingsView {
    pub lifetimes: TokenLifetimes,
    pub change_date: DateTime<Utc>,
    pub sequence: u64,
}

/// Column accessors over a projected row.
struct Fields<'a>(&'a Row);

impl Fields<'_> {
    fn value(&self, column: &str) -> DomainResult<&SqlValue> {
        self.0
            .get(column)
            .ok_or_else(|| DomainError::internal(format!("read model row has no column {column}")))
    }

    fn malformed(column: &str) -> DomainError {
        DomainError::internal(format!("read model column {column} has an unexpected type"))
    }

    fn text(&self, column: &str) -> DomainResult<String> {
        self.value(column)?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| Self::malformed(column))
    }

    fn opt_text(&self, column: &str) -> DomainResult<Option<String>> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            _ => Err(Self::malformed(column)),
        }
    }

    fn int(&self, column: &str) -> DomainResult<i64> {
        self.value(column)?.as_int().ok_or_else(|| Self::malformed(column))
    }

    fn sequence(&self) -> DomainResult<u64> {
        Ok(self.int("sequence")?.max(0) as u64)
    }

    fn bool(&self, column: &str) -> DomainResult<bool> {
        self.value(column)?.as_bool().ok_or_else(|| Self::malformed(column))
    }

    fn timestamp(&self, column: &str) -> DomainResult<DateTime<Utc>> {
        self.value(column)?
            .as_timestamp()
            .ok_or_else(|| Self::malformed(column))
    }

    fn opt_timestamp(&self, column: &str) -> DomainResult<Option<DateTime<Utc>>> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(t) => Ok(Some(*t)),
            _ => Err(Self::malformed(column)),
        }
    }
}

fn session_state(value: &str) -> SessionState {
    match value {
        "active" => SessionState::Active,
        "terminated" => SessionState::Terminated,
        _ => SessionState::Unspecified,
    }
}

fn user_state(value: &str) -> UserState {
    match value {
        "active" => UserState::Active,
        "removed" => UserState::Removed,
        _ => UserState::Unspecified,
    }
}

impl TryFrom<&Row> for SessionView {
    type Error = DomainError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let fields = Fields(row);
        let metadata = match fields.value("metadata")? {
            SqlValue::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| DomainError::internal(format!("malformed session metadata: {e}")))?,
            _ => return Err(Fields::malformed("metadata")),
        };
        Ok(SessionView {
            id: AggregateId::parse(fields.text("id")?)?,
            resource_owner: fields.text("resource_owner")?,
            state: session_state(&fields.text("state")?),
            creation_date: fields.timestamp("creation_date")?,
            change_date: fields.timestamp("change_date")?,
            sequence: fields.sequence()?,
            user_id: fields.opt_text("user_id")?.map(UserId::parse).transpose()?,
            user_checked_at: fields.opt_timestamp("user_checked_at")?,
            password_checked_at: fields.opt_timestamp("password_checked_at")?,
            metadata,
        })
    }
}

impl TryFrom<&Row> for UserView {
    type Error = DomainError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let fields = Fields(row);
        Ok(UserView {
            id: UserId::parse(fields.text("id")?)?,
            resource_owner: fields.text("resource_owner")?,
            state: user_state(&fields.text("state")?),
            username: fields.text("username")?,
            email: fields.text("email")?,
            email_verified: fields.bool("email_verified")?,
            password_set: fields.bool("password_set")?,
            password_changed_at: fields.opt_timestamp("password_changed_at")?,
            creation_date: fields.timestamp("creation_date")?,
            change_date: fields.timestamp("change_date")?,
            sequence: fields.sequence()?,
        })
    }
}

impl TryFrom<&Row> for OidcSettingsView {
    type Error = DomainError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let fields = Fields(row);
        Ok(OidcSettingsView {
            lifetimes: TokenLifetimes {
                access_token: Duration::seconds(fields.int("access_token_lifetime_secs")?),
                refresh_token: Duration::seconds(fields.int("refresh_token_expiration_secs")?),
                refresh_token_idle: Duration::seconds(fields.int("refresh_token_idle_expiration_secs")?),
            },
            change_date: fields.timestamp("change_date")?,
            sequence: fields.sequence()?,
        })
    }
}

/// Read-only access to the identity read models.
#[derive(Debug, Clone)]
pub struct Queries<P> {
    store: P,
}

impl<P: ProjectionStore> Queries<P> {
    pub fn new(store: P) -> Self {
        Self { store }
    }

    pub async fn session_by_id(&self, tenant_id: TenantId, session_id: &AggregateId) -> DomainResult<SessionView> {
        let rows = self
            .store
            .select(&SessionProjection.schema(), &[
                Condition::new("instance_id", tenant_id.to_string()),
                Condition::new("id", session_id.as_str()),
            ])
            .await?;
        rows.first()
            .map(SessionView::try_from)
            .transpose()?
            .ok_or_else(|| DomainError::not_found("session not found"))
    }

    /// Sessions a user was checked on, oldest first.
    pub async fn sessions_by_user(&self, tenant_id: TenantId, user_id: &UserId) -> DomainResult<Vec<SessionView>> {
        let rows = self
            .store
            .select(&SessionProjection.schema(), &[
                Condition::new("instance_id", tenant_id.to_string()),
                Condition::new("user_id", user_id.as_str()),
            ])
            .await?;
        let mut sessions = rows.iter().map(SessionView::try_from).collect::<DomainResult<Vec<_>>>()?;
        sessions.sort_by(|a, b| a.creation_date.cmp(&b.creation_date).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub async fn user_by_id(&self, tenant_id: TenantId, user_id: &UserId) -> DomainResult<UserView> {
        self.single_user(&[
            Condition::new("instance_id", tenant_id.to_string()),
            Condition::new("id", user_id.as_str()),
        ])
        .await
    }

    /// Look a user up by username; the lookup is case-insensitive.
    pub async fn user_by_username(&self, tenant_id: TenantId, username: &str) -> DomainResult<UserView> {
        let username = normalize_username(username)?;
        self.single_user(&[
            Condition::new("instance_id", tenant_id.to_string()),
            Condition::new("username", username),
        ])
        .await
    }

    async fn single_user(&self, conditions: &[Condition]) -> DomainResult<UserView> {
        let rows = self.store.select(&UserProjection.schema(), conditions).await?;
        rows.first()
            .map(UserView::try_from)
            .transpose()?
            .ok_or_else(|| DomainError::not_found("user not found"))
    }

    /// Every metadata entry of a user.
    pub async fn user_metadata(&self, tenant_id: TenantId, user_id: &UserId) -> DomainResult<Metadata> {
        let rows = self
            .store
            .select(&UserMetadataProjection.schema(), &[
                Condition::new("instance_id", tenant_id.to_string()),
                Condition::new("user_id", user_id.as_str()),
            ])
            .await?;
        rows.iter()
            .map(|row| {
                let fields = Fields(row);
                let value = match fields.value("value")? {
                    SqlValue::Json(value) => serde_json::from_value(value.clone())
                        .map_err(|e| DomainError::internal(format!("malformed user metadata: {e}")))?,
                    _ => return Err(Fields::malformed("value")),
                };
                Ok((fields.text("key")?, value))
            })
            .collect()
    }

    /// Instance overrides of the token lifetimes, if any were set.
    pub async fn oidc_settings(&self, tenant_id: TenantId) -> DomainResult<Option<OidcSettingsView>> {
        let rows = self
            .store
            .select(&OidcSettingsProjection.schema(), &[Condition::new(
                "instance_id",
                tenant_id.to_string(),
            )])
            .await?;
        rows.first().map(OidcSettingsView::try_from).transpose()
    }

    /// The instance password-age policy, if one was set.
    pub async fn password_age_policy(&self, tenant_id: TenantId) -> DomainResult<Option<PasswordAgePolicy>> {
        let rows = self
            .store
            .select(&PasswordAgePolicyProjection.schema(), &[Condition::new(
                "instance_id",
                tenant_id.to_string(),
            )])
            .await?;
        rows.first()
            .map(|row| {
                let fields = Fields(row);
                Ok(PasswordAgePolicy {
                    expire_warn_days: fields.int("expire_warn_days")?.max(0) as u64,
                    max_age_days: fields.int("max_age_days")?.max(0) as u64,
                })
            })
            .transpose()
    }

    pub async fn search_failed_events(&self, filter: &FailedEventFilter) -> DomainResult<Vec<FailedEvent>> {
        Ok(self.store.failed_events(filter).await?)
    }

    /// Acknowledge a failed event.
    pub async fn remove_failed_event(&self, projection: &str, position: u64) -> DomainResult<()> {
        if self.store.remove_failed_event(projection, position).await? {
            Ok(())
        } else {
            Err(DomainError::not_found("failed event not found"))
        }
    }

    pub async fn current_position(&self, projection: &str) -> DomainResult<u64> {
        Ok(self.store.current_position(projection).await?)
    }
}
