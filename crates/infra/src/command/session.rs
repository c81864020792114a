//! Session commands: create, update (checks + metadata) and terminate.

use keyward_auth::{
    HumanPasswordWriteModel, HumanWriteModel, Metadata, Permission, SESSION_DELETE, SESSION_WRITE,
    SessionCheck, SessionEvent, SessionState, SessionWriteModel, UserState,
};
use keyward_core::{AggregateId, DomainError, DomainResult, ExpectedSequence, ObjectDetails, UserId};
use keyward_events::{UncommittedEvent, WriteModel};
use tracing::instrument;

use super::{CommandContext, Commands, append_and_reduce, load, retry_on_conflict};
use crate::event_store::EventStore;

/// Result of a session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChanged {
    pub details: ObjectDetails,
    pub id: AggregateId,
    /// Plaintext session token, present whenever the command changed the
    /// session. It is never stored in this form.
    pub new_token: Option<String>,
}

impl<S: EventStore> Commands<S> {
    /// Start a session, run `checks` and attach `metadata`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn create_session(
        &self,
        ctx: &CommandContext,
        checks: Vec<SessionCheck>,
        metadata: Metadata,
    ) -> DomainResult<SessionChanged> {
        let (checks, metadata) = (&checks, &metadata);
        retry_on_conflict(&self.retry, move || self.create_session_once(ctx, checks, metadata)).await
    }

    async fn create_session_once(
        &self,
        ctx: &CommandContext,
        checks: &[SessionCheck],
        metadata: &Metadata,
    ) -> DomainResult<SessionChanged> {
        let session_id = AggregateId::parse(self.next_id())?;
        let mut model = SessionWriteModel::new(ctx.tenant_id, session_id, ctx.resource_owner.clone());

        let mut events = vec![SessionEvent::Added];
        events.extend(self.session_checks(ctx, None, checks).await?);
        if let Some(metadata) = model.metadata_changes(metadata) {
            events.push(SessionEvent::MetadataSet { metadata });
        }
        self.commit_session_changes(ctx, &mut model, events).await
    }

    /// Run additional checks and metadata changes on an active session.
    ///
    /// A non-empty `session_token` must match the session's current token.
    /// Without a token the caller needs the `session.write` permission.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %session_id), err)]
    pub async fn update_session(
        &self,
        ctx: &CommandContext,
        session_id: &AggregateId,
        session_token: &str,
        checks: Vec<SessionCheck>,
        metadata: Metadata,
    ) -> DomainResult<SessionChanged> {
        let (checks, metadata) = (&checks, &metadata);
        retry_on_conflict(&self.retry, move || {
            self.update_session_once(ctx, session_id, session_token, checks, metadata)
        })
        .await
    }

    async fn update_session_once(
        &self,
        ctx: &CommandContext,
        session_id: &AggregateId,
        session_token: &str,
        checks: &[SessionCheck],
        metadata: &Metadata,
    ) -> DomainResult<SessionChanged> {
        let mut model = SessionWriteModel::new(ctx.tenant_id, session_id.clone(), "");
        load(&self.store, &mut model).await?;
        self.check_session_token(ctx, &model, session_token, &SESSION_WRITE)?;
        if model.session_state == SessionState::Terminated {
            return Err(DomainError::precondition("session is terminated"));
        }
        model.check_is_active()?;
        if let Some(user_id) = &model.user_id {
            self.check_user_not_removed(ctx, user_id).await?;
        }

        let mut events = self.session_checks(ctx, model.user_id.clone(), checks).await?;
        if let Some(metadata) = model.metadata_changes(metadata) {
            events.push(SessionEvent::MetadataSet { metadata });
        }
        if events.is_empty() {
            return Ok(SessionChanged {
                details: model.state().details(),
                id: session_id.clone(),
                new_token: None,
            });
        }
        self.commit_session_changes(ctx, &mut model, events).await
    }

    /// Terminate a session. Terminating a session that is not active is a
    /// successful no-op.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %session_id), err)]
    pub async fn terminate_session(
        &self,
        ctx: &CommandContext,
        session_id: &AggregateId,
        session_token: &str,
    ) -> DomainResult<ObjectDetails> {
        retry_on_conflict(&self.retry, move || {
            self.terminate_session_once(ctx, session_id, session_token)
        })
        .await
    }

    async fn terminate_session_once(
        &self,
        ctx: &CommandContext,
        session_id: &AggregateId,
        session_token: &str,
    ) -> DomainResult<ObjectDetails> {
        let mut model = SessionWriteModel::new(ctx.tenant_id, session_id.clone(), "");
        load(&self.store, &mut model).await?;
        if model.session_state != SessionState::Active {
            return Ok(model.state().details());
        }
        self.check_session_token(ctx, &model, session_token, &SESSION_DELETE)?;

        let event = UncommittedEvent::from_typed(&model.aggregate(), ctx.editor.clone(), &SessionEvent::Terminated)?
            .expect_sequence(ExpectedSequence::Exact(model.processed_sequence()));
        let pushed = self.push(vec![event]).await?;
        append_and_reduce(&mut model, &pushed)?;
        Ok(model.state().details())
    }

    fn check_session_token(
        &self,
        ctx: &CommandContext,
        model: &SessionWriteModel,
        session_token: &str,
        permission: &Permission,
    ) -> DomainResult<()> {
        if session_token.is_empty() {
            return self.check_permission(ctx, permission);
        }
        let valid = model
            .token
            .as_ref()
            .is_some_and(|stored| self.session_tokens.verify(stored, session_token).unwrap_or(false));
        if !valid {
            return Err(DomainError::permission_denied("invalid session token"));
        }
        Ok(())
    }

    /// Translate requested checks into events, in order.
    ///
    /// `bound` is the user the session is already bound to. A user check
    /// earlier in the same request binds the user for later password checks.
    async fn session_checks(
        &self,
        ctx: &CommandContext,
        mut bound: Option<UserId>,
        checks: &[SessionCheck],
    ) -> DomainResult<Vec<SessionEvent>> {
        let mut events = Vec::with_capacity(checks.len());
        for check in checks {
            match check {
                SessionCheck::User(user_id) => {
                    if bound.as_ref().is_some_and(|b| b != user_id) {
                        return Err(DomainError::invalid_argument("user change not possible"));
                    }
                    let mut user = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
                    load(&self.store, &mut user).await?;
                    user.check_exists()?;
                    events.push(SessionEvent::UserChecked {
                        user_id: user_id.clone(),
                        checked_at: self.now(),
                    });
                    bound = Some(user_id.clone());
                }
                SessionCheck::Password(password) => {
                    let user_id = bound
                        .as_ref()
                        .ok_or_else(|| DomainError::precondition("no user checked"))?;
                    self.verify_password(ctx, user_id, password).await?;
                    events.push(SessionEvent::PasswordChecked {
                        checked_at: self.now(),
                    });
                }
            }
        }
        Ok(events)
    }

    /// Sessions and OIDC sessions bound to a removed user are dead.
    pub(super) async fn check_user_not_removed(&self, ctx: &CommandContext, user_id: &UserId) -> DomainResult<()> {
        let mut user = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
        load(&self.store, &mut user).await?;
        if user.user_state == UserState::Removed {
            return Err(DomainError::precondition("user removed"));
        }
        Ok(())
    }

    /// A wrong password fails with `InvalidArgument` and records nothing.
    async fn verify_password(&self, ctx: &CommandContext, user_id: &UserId, password: &str) -> DomainResult<()> {
        let mut model = HumanPasswordWriteModel::new(ctx.tenant_id, user_id.clone(), "");
        load(&self.store, &mut model).await?;
        if !model.user_state.exists() {
            return Err(DomainError::precondition("user not found"));
        }
        let encoded = model
            .encoded_hash
            .as_deref()
            .ok_or_else(|| DomainError::precondition("password not set"))?;
        if !self.hasher.verify(encoded, password)? {
            return Err(DomainError::invalid_argument("invalid password"));
        }
        Ok(())
    }

    /// Append a fresh session token to `events` and push them.
    async fn commit_session_changes(
        &self,
        ctx: &CommandContext,
        model: &mut SessionWriteModel,
        mut events: Vec<SessionEvent>,
    ) -> DomainResult<SessionChanged> {
        let (stored, token) = self.session_tokens.create()?;
        events.push(SessionEvent::TokenSet { token: stored });

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
        append_and_reduce(model, &pushed)?;

        Ok(SessionChanged {
            details: model.state().details(),
            id: model.session_id().clone(),
            new_token: Some(token),
        })
    }
}
