//! OIDC session commands: token issuance, refresh rotation and revocation.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use keyward_auth::token::{
    ACCESS_TOKEN_PREFIX, ID_PREFIX_V2, REFRESH_TOKEN_PREFIX, access_token_id, decode_refresh_token,
    encode_refresh_token, token_ref_from_token,
};
use keyward_auth::{
    AuthMethod, OidcSessionEvent, OidcSessionWriteModel, SessionWriteModel, TokenLifetimes, TokenReason, TokenRef,
};
use keyward_core::{AggregateId, DomainError, DomainResult, ExpectedSequence, ObjectDetails, UserId};
use keyward_events::{UncommittedEvent, WriteModel};

use super::{CommandContext, Commands, append_and_reduce, load, retry_on_conflict};
use crate::event_store::EventStore;

/// Parameters of [`Commands::create_oidc_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOidcSession {
    pub user_id: UserId,
    /// Login session the tokens are derived from. When set it must be active
    /// and bound to `user_id`.
    pub session_id: Option<AggregateId>,
    pub client_id: String,
    pub audience: Vec<String>,
    pub scope: Vec<String>,
    pub auth_methods: Vec<AuthMethod>,
    pub auth_time: DateTime<Utc>,
    pub reason: TokenReason,
    pub need_refresh_token: bool,
}

/// Tokens issued by an OIDC session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcSession {
    pub details: ObjectDetails,
    pub oidc_session_id: AggregateId,
    /// `<oidcSessionID>-at_<id>`
    pub token_id: String,
    pub user_id: UserId,
    pub client_id: String,
    pub audience: Vec<String>,
    pub scope: Vec<String>,
    pub auth_methods: Vec<AuthMethod>,
    pub auth_time: Option<DateTime<Utc>>,
    pub access_token_expiration: DateTime<Utc>,
    /// Opaque refresh token, if one was minted.
    pub refresh_token: Option<String>,
}

impl<S: EventStore> Commands<S> {
    /// Open an OIDC session and mint its first access (and refresh) token.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, client_id = %params.client_id), err)]
    pub async fn create_oidc_session(
        &self,
        ctx: &CommandContext,
        params: CreateOidcSession,
    ) -> DomainResult<OidcSession> {
        if params.client_id.trim().is_empty() {
            return Err(DomainError::invalid_argument("client id is empty"));
        }
        let params = &params;
        retry_on_conflict(&self.retry, move || self.create_oidc_session_once(ctx, params)).await
    }

    async fn create_oidc_session_once(
        &self,
        ctx: &CommandContext,
        params: &CreateOidcSession,
    ) -> DomainResult<OidcSession> {
        if let Some(session_id) = &params.session_id {
            let mut session = SessionWriteModel::new(ctx.tenant_id, session_id.clone(), "");
            load(&self.store, &mut session).await?;
            session.check_is_active()?;
            if session.user_id.as_ref() != Some(&params.user_id) {
                return Err(DomainError::precondition("session is bound to another user"));
            }
        }
        self.check_user_not_removed(ctx, &params.user_id).await?;

        let lifetimes = self.token_lifetimes(ctx.tenant_id).await?;
        let oidc_session_id = AggregateId::parse(format!("{ID_PREFIX_V2}{}", self.next_id()))?;
        let mut model = OidcSessionWriteModel::new(ctx.tenant_id, oidc_session_id, ctx.resource_owner.clone());

        let mut audience = params.audience.clone();
        if !audience.contains(&params.client_id) {
            audience.push(params.client_id.clone());
        }

        let access_id = format!("{ACCESS_TOKEN_PREFIX}{}", self.next_id());
        let mut events = vec![
            OidcSessionEvent::Added {
                user_id: params.user_id.clone(),
                session_id: params.session_id.as_ref().map(|id| id.to_string()),
                client_id: params.client_id.clone(),
                audience,
                scope: params.scope.clone(),
                auth_methods: params.auth_methods.clone(),
                auth_time: params.auth_time,
            },
            OidcSessionEvent::AccessTokenAdded {
                id: access_id.clone(),
                scope: params.scope.clone(),
                lifetime_secs: lifetimes.access_token.num_seconds(),
                reason: params.reason,
            },
        ];
        let refresh_id = params.need_refresh_token.then(|| format!("{REFRESH_TOKEN_PREFIX}{}", self.next_id()));
        if let Some(id) = &refresh_id {
            events.push(OidcSessionEvent::RefreshTokenAdded {
                id: id.clone(),
                lifetime_secs: lifetimes.refresh_token.num_seconds(),
                idle_lifetime_secs: lifetimes.refresh_token_idle.num_seconds(),
            });
        }

        self.commit_oidc_changes(ctx, &mut model, events).await?;
        self.oidc_session_result(&model, &access_id, refresh_id.as_deref())
    }

    /// Rotate a refresh token: mint a new access token and a new refresh
    /// token id. The presented token becomes invalid.
    ///
    /// An empty `scope` keeps the session's scope; otherwise it must be a
    /// subset of it.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn exchange_oidc_session_refresh_and_access_token(
        &self,
        ctx: &CommandContext,
        refresh_token: &str,
        scope: Vec<String>,
    ) -> DomainResult<OidcSession> {
        let scope = &scope;
        retry_on_conflict(&self.retry, move || self.exchange_refresh_token_once(ctx, refresh_token, scope)).await
    }

    async fn exchange_refresh_token_once(
        &self,
        ctx: &CommandContext,
        refresh_token: &str,
        scope: &[String],
    ) -> DomainResult<OidcSession> {
        let mut model = self.load_by_refresh_token(ctx, refresh_token).await?;
        if let Some(user_id) = &model.user_id {
            self.check_user_not_removed(ctx, user_id).await?;
        }

        let scope = if scope.is_empty() {
            model.scope.clone()
        } else if scope.iter().all(|s| model.scope.contains(s)) {
            scope.to_vec()
        } else {
            return Err(DomainError::invalid_argument("scope exceeds the granted scope"));
        };

        let lifetimes = self.token_lifetimes(ctx.tenant_id).await?;
        let access_id = format!("{ACCESS_TOKEN_PREFIX}{}", self.next_id());
        let refresh_id = format!("{REFRESH_TOKEN_PREFIX}{}", self.next_id());
        let events = vec![
            OidcSessionEvent::AccessTokenAdded {
                id: access_id.clone(),
                scope,
                lifetime_secs: lifetimes.access_token.num_seconds(),
                reason: TokenReason::Refresh,
            },
            OidcSessionEvent::RefreshTokenRenewed {
                id: refresh_id.clone(),
                idle_lifetime_secs: lifetimes.refresh_token_idle.num_seconds(),
            },
        ];

        self.commit_oidc_changes(ctx, &mut model, events).await?;
        self.oidc_session_result(&model, &access_id, Some(&refresh_id))
    }

    /// Resolve and validate a refresh token without rotating it.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn oidc_session_by_refresh_token(
        &self,
        ctx: &CommandContext,
        refresh_token: &str,
    ) -> DomainResult<OidcSessionWriteModel> {
        self.load_by_refresh_token(ctx, refresh_token).await
    }

    async fn load_by_refresh_token(
        &self,
        ctx: &CommandContext,
        refresh_token: &str,
    ) -> DomainResult<OidcSessionWriteModel> {
        let (oidc_session_id, refresh_token_id) = decode_refresh_token(self.encryption.as_ref(), refresh_token)?;
        let oidc_session_id = AggregateId::parse(oidc_session_id).map_err(|_| DomainError::RefreshTokenInvalid)?;
        let mut model = OidcSessionWriteModel::new(ctx.tenant_id, oidc_session_id, "");
        load(&self.store, &mut model).await?;
        model.check_refresh_token(&refresh_token_id, self.now())?;
        Ok(model)
    }

    /// Revoke an access token (`<sid>-at_*`) or a refresh token (opaque or
    /// `<sid>-rt_*`).
    ///
    /// Unknown, malformed, expired or already revoked tokens are a silent
    /// success. Only a client outside the token audience is an error.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, client_id = %client_id), err)]
    pub async fn revoke_oidc_session_token(
        &self,
        ctx: &CommandContext,
        token: &str,
        client_id: &str,
    ) -> DomainResult<()> {
        retry_on_conflict(&self.retry, move || self.revoke_token_once(ctx, token, client_id)).await
    }

    async fn revoke_token_once(&self, ctx: &CommandContext, token: &str, client_id: &str) -> DomainResult<()> {
        let token_ref = match decode_refresh_token(self.encryption.as_ref(), token) {
            Ok((oidc_session_id, refresh_token_id)) => TokenRef::Refresh {
                oidc_session_id,
                refresh_token_id,
            },
            Err(_) => match token_ref_from_token(token) {
                Ok(token_ref) => token_ref,
                Err(err) => {
                    info!(error = %err, "token revocation ignored: unparsable token");
                    return Ok(());
                }
            },
        };
        let Ok(oidc_session_id) = AggregateId::parse(token_ref.oidc_session_id()) else {
            info!("token revocation ignored: invalid session id");
            return Ok(());
        };

        let mut model = OidcSessionWriteModel::new(ctx.tenant_id, oidc_session_id, "");
        load(&self.store, &mut model).await?;
        if !model.is_active() {
            info!("token revocation ignored: unknown oidc session");
            return Ok(());
        }
        model.check_client(client_id)?;

        let now = self.now();
        let (check, event) = match &token_ref {
            TokenRef::Access { access_token_id, .. } => (
                model.check_access_token(access_token_id, now),
                OidcSessionEvent::AccessTokenRevoked,
            ),
            TokenRef::Refresh { refresh_token_id, .. } => (
                model.check_refresh_token(refresh_token_id, now),
                OidcSessionEvent::RefreshTokenRevoked,
            ),
        };
        if let Err(err) = check {
            info!(error = %err, "token revocation ignored: token no longer valid");
            return Ok(());
        }
        self.commit_oidc_changes(ctx, &mut model, vec![event]).await
    }

    /// Instance overrides win over the system defaults when set.
    pub(crate) async fn token_lifetimes(&self, tenant_id: keyward_core::TenantId) -> DomainResult<TokenLifetimes> {
        let settings = self.load_oidc_settings(tenant_id).await?;
        Ok(settings.lifetimes.resolve(&self.token_defaults))
    }

    async fn commit_oidc_changes(
        &self,
        ctx: &CommandContext,
        model: &mut OidcSessionWriteModel,
        events: Vec<OidcSessionEvent>,
    ) -> DomainResult<()> {
        let aggregate = model.aggregate();
        let expected = ExpectedSequence::Exact(model.processed_sequence());
        let uncommitted = events
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(&aggregate, ctx.editor.clone(), event)
                    .map(|e| e.expect_sequence(expected))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let pushed = self.push(uncommitted).await?;
        append_and_reduce(model, &pushed)
    }

    fn oidc_session_result(
        &self,
        model: &OidcSessionWriteModel,
        access_id: &str,
        refresh_id: Option<&str>,
    ) -> DomainResult<OidcSession> {
        let user_id = model
            .user_id
            .clone()
            .ok_or_else(|| DomainError::internal("oidc session has no user"))?;
        let access_token_expiration = model
            .access_token_expiration
            .ok_or_else(|| DomainError::internal("access token was not recorded"))?;
        let refresh_token = refresh_id
            .map(|id| encode_refresh_token(self.encryption.as_ref(), model.oidc_session_id().as_str(), id, &user_id))
            .transpose()?;
        Ok(OidcSession {
            details: model.state().details(),
            oidc_session_id: model.oidc_session_id().clone(),
            token_id: access_token_id(model.oidc_session_id().as_str(), access_id),
            user_id,
            client_id: model.client_id.clone(),
            audience: model.audience.clone(),
            scope: model.scope.clone(),
            auth_methods: model.auth_methods.clone(),
            auth_time: model.auth_time,
            access_token_expiration,
            refresh_token,
        })
    }
}
