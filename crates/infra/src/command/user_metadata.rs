//! User metadata commands.
//!
//! Setting a key to the value it already holds emits nothing. Bulk variants
//! push all their changes in one batch or none of them.

use tracing::instrument;

use keyward_auth::{HumanEvent, Metadata, UserMetadataWriteModel};
use keyward_core::{DomainError, DomainResult, ExpectedSequence, ObjectDetails, UserId};
use keyward_events::{UncommittedEvent, WriteModel};

use super::{CommandContext, Commands, append_and_reduce, load, retry_on_conflict};
use crate::event_store::EventStore;

impl<S: EventStore> Commands<S> {
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id, key = %key), err)]
    pub async fn set_user_metadata(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        key: &str,
        value: &[u8],
    ) -> DomainResult<ObjectDetails> {
        retry_on_conflict(&self.retry, move || async move {
            let mut model = self.load_user_metadata(ctx, user_id).await?;
            let events = model.set_event(key, value)?.into_iter().collect();
            self.commit_metadata_changes(ctx, &mut model, events).await
        })
        .await
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn bulk_set_user_metadata(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        metadata: &Metadata,
    ) -> DomainResult<ObjectDetails> {
        if metadata.is_empty() {
            return Err(DomainError::precondition("no metadata to set"));
        }
        retry_on_conflict(&self.retry, move || async move {
            let mut model = self.load_user_metadata(ctx, user_id).await?;
            let mut events = Vec::with_capacity(metadata.len());
            for (key, value) in metadata {
                events.extend(model.set_event(key, value)?);
            }
            self.commit_metadata_changes(ctx, &mut model, events).await
        })
        .await
    }

    /// Removing a key the user does not have is `NotFound`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id, key = %key), err)]
    pub async fn remove_user_metadata(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        key: &str,
    ) -> DomainResult<ObjectDetails> {
        if key.is_empty() {
            return Err(DomainError::invalid_argument("metadata key is empty"));
        }
        retry_on_conflict(&self.retry, move || async move {
            let mut model = self.load_user_metadata(ctx, user_id).await?;
            let event = model.remove_event(key)?;
            self.commit_metadata_changes(ctx, &mut model, vec![event]).await
        })
        .await
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn bulk_remove_user_metadata(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        keys: &[String],
    ) -> DomainResult<ObjectDetails> {
        if keys.is_empty() {
            return Err(DomainError::precondition("no metadata to remove"));
        }
        retry_on_conflict(&self.retry, move || async move {
            let mut model = self.load_user_metadata(ctx, user_id).await?;
            let events = keys
                .iter()
                .map(|key| model.remove_event(key))
                .collect::<DomainResult<Vec<_>>>()?;
            self.commit_metadata_changes(ctx, &mut model, events).await
        })
        .await
    }

    async fn load_user_metadata(&self, ctx: &CommandContext, user_id: &UserId) -> DomainResult<UserMetadataWriteModel> {
        let mut model = UserMetadataWriteModel::new(ctx.tenant_id, user_id.clone(), "");
        load(&self.store, &mut model).await?;
        model.check_exists()?;
        Ok(model)
    }

    async fn commit_metadata_changes(
        &self,
        ctx: &CommandContext,
        model: &mut UserMetadataWriteModel,
        events: Vec<HumanEvent>,
    ) -> DomainResult<ObjectDetails> {
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
        Ok(model.state().details())
    }
}
