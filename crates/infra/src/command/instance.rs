//! Instance-level OIDC settings and password-age policy.

use chrono::Duration;
use tracing::instrument;

use keyward_auth::{
    InstanceOidcSettingsWriteModel, InstancePasswordAgePolicyWriteModel, PasswordAgePolicy, TokenLifetimes,
};
use keyward_core::{DomainError, DomainResult, ExpectedSequence, ObjectDetails, TenantId};
use keyward_events::{UncommittedEvent, WriteModel};

use super::{CommandContext, Commands, append_and_reduce, load, retry_on_conflict};
use crate::event_store::EventStore;

impl<S: EventStore> Commands<S> {
    /// Set the instance token lifetimes. A zero lifetime falls back to the
    /// system default. Setting the current values again is a
    /// `PreconditionFailed`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn set_oidc_settings(&self, ctx: &CommandContext, lifetimes: TokenLifetimes) -> DomainResult<ObjectDetails> {
        if [lifetimes.access_token, lifetimes.refresh_token, lifetimes.refresh_token_idle]
            .iter()
            .any(|d| *d < Duration::zero())
        {
            return Err(DomainError::invalid_argument("token lifetimes must not be negative"));
        }

        let lifetimes = &lifetimes;
        retry_on_conflict(&self.retry, move || async move {
            let mut model = self.load_oidc_settings(ctx.tenant_id).await?;
            let event = model
                .change_event(lifetimes)
                .ok_or_else(|| DomainError::precondition("oidc settings not changed"))?;
            let event = UncommittedEvent::from_typed(&model.aggregate(), ctx.editor.clone(), &event)?
                .expect_sequence(ExpectedSequence::Exact(model.processed_sequence()));
            let pushed = self.push(vec![event]).await?;
            append_and_reduce(&mut model, &pushed)?;
            Ok(model.state().details())
        })
        .await
    }

    /// Set the instance password-age policy. Setting the current values
    /// again is a `PreconditionFailed`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn set_password_age_policy(
        &self,
        ctx: &CommandContext,
        policy: PasswordAgePolicy,
    ) -> DomainResult<ObjectDetails> {
        let policy = &policy;
        retry_on_conflict(&self.retry, move || async move {
            let mut model = InstancePasswordAgePolicyWriteModel::new(ctx.tenant_id);
            load(&self.store, &mut model).await?;
            let event = model
                .change_event(policy)
                .ok_or_else(|| DomainError::precondition("password age policy not changed"))?;
            let event = UncommittedEvent::from_typed(&model.aggregate(), ctx.editor.clone(), &event)?
                .expect_sequence(ExpectedSequence::Exact(model.processed_sequence()));
            let pushed = self.push(vec![event]).await?;
            append_and_reduce(&mut model, &pushed)?;
            Ok(model.state().details())
        })
        .await
    }

    pub(crate) async fn load_oidc_settings(&self, tenant_id: TenantId) -> DomainResult<InstanceOidcSettingsWriteModel> {
        let mut model = InstanceOidcSettingsWriteModel::new(tenant_id);
        load(&self.store, &mut model).await?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::harness;

    fn lifetimes(access_hours: i64) -> TokenLifetimes {
        TokenLifetimes {
            access_token: Duration::hours(access_hours),
            refresh_token: Duration::days(7),
            refresh_token_idle: Duration::days(1),
        }
    }

    #[tokio::test]
    async fn settings_are_added_then_changed() {
        let h = harness();
        let first = h.commands.set_oidc_settings(&h.ctx, lifetimes(1)).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.resource_owner, h.ctx.tenant_id.instance_id().to_string());

        let second = h.commands.set_oidc_settings(&h.ctx, lifetimes(2)).await.unwrap();
        assert_eq!(second.sequence, 2);
        let model = h.commands.load_oidc_settings(h.ctx.tenant_id).await.unwrap();
        assert_eq!(model.lifetimes, lifetimes(2));
    }

    #[tokio::test]
    async fn unchanged_settings_are_a_precondition_failure() {
        let h = harness();
        h.commands.set_oidc_settings(&h.ctx, lifetimes(1)).await.unwrap();
        assert_eq!(
            h.commands.set_oidc_settings(&h.ctx, lifetimes(1)).await,
            Err(DomainError::precondition("oidc settings not changed"))
        );
    }

    #[tokio::test]
    async fn negative_lifetimes_are_invalid() {
        let h = harness();
        assert!(matches!(
            h.commands.set_oidc_settings(&h.ctx, lifetimes(-1)).await,
            Err(DomainError::InvalidArgument(_))
        ));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn password_age_policy_and_oidc_settings_interleave() {
        let h = harness();
        let policy = PasswordAgePolicy {
            expire_warn_days: 7,
            max_age_days: 90,
        };
        let added = h.commands.set_password_age_policy(&h.ctx, policy).await.unwrap();
        assert_eq!(added.sequence, 1);
        h.commands.set_oidc_settings(&h.ctx, lifetimes(1)).await.unwrap();
        assert_eq!(
            h.commands.set_password_age_policy(&h.ctx, policy).await,
            Err(DomainError::precondition("password age policy not changed"))
        );

        let changed = h
            .commands
            .set_password_age_policy(&h.ctx, PasswordAgePolicy {
                max_age_days: 30,
                ..policy
            })
            .await
            .unwrap();
        assert_eq!(changed.sequence, 3);
        let mut model = InstancePasswordAgePolicyWriteModel::new(h.ctx.tenant_id);
        load(&h.store, &mut model).await.unwrap();
        assert_eq!(model.policy.max_age_days, 30);
        assert_eq!(model.policy.expire_warn_days, 7);
    }
}
