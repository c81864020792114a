//! Human user commands.

use tracing::instrument;

use keyward_auth::user::{add_username_constraint, normalize_email, normalize_username, remove_username_constraint};
use keyward_auth::{HumanEvent, HumanPasswordWriteModel, HumanWriteModel, generate_code, verify_code};
use keyward_core::{DomainError, DomainResult, ExpectedSequence, ObjectDetails, UserId};
use keyward_events::{UncommittedEvent, WriteModel};

use super::{CommandContext, Commands, append_and_reduce, load, retry_on_conflict};
use crate::event_store::EventStore;

#[derive(Clone, PartialEq, Eq)]
pub struct AddHumanUser {
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub password: Option<String>,
}

impl core::fmt::Debug for AddHumanUser {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddHumanUser")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("email_verified", &self.email_verified)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedUser {
    pub user_id: UserId,
    pub details: ObjectDetails,
}

/// Outcome of an email change or a new verification code.
#[derive(Clone, PartialEq, Eq)]
pub struct EmailChanged {
    pub details: ObjectDetails,
    /// Plaintext verification code to deliver to the new address. Only its
    /// encrypted form is stored.
    pub code: Option<String>,
}

impl core::fmt::Debug for EmailChanged {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmailChanged")
            .field("details", &self.details)
            .field("code", &self.code.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

const EMAIL_CODE_LENGTH: usize = 6;

impl<S: EventStore> Commands<S> {
    /// Add a human user. The username is reserved per tenant.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id), err)]
    pub async fn add_human_user(&self, ctx: &CommandContext, user: AddHumanUser) -> DomainResult<AddedUser> {
        let username = normalize_username(&user.username)?;
        let email = normalize_email(&user.email)?;
        let encoded_hash = match user.password.as_deref() {
            Some("") => return Err(DomainError::invalid_argument("password is empty")),
            Some(password) => Some(self.hasher.hash(password)?),
            None => None,
        };

        let (username, email, encoded_hash) = (&username, &email, &encoded_hash);
        let verified = user.email_verified;
        retry_on_conflict(&self.retry, move || async move {
            let user_id = UserId::parse(self.next_id())?;
            let mut model = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), ctx.resource_owner.clone());
            let aggregate = model.aggregate();
            let expected = ExpectedSequence::Exact(0);

            let mut events = vec![
                UncommittedEvent::from_typed(
                    &aggregate,
                    ctx.editor.clone(),
                    &HumanEvent::Added {
                        username: username.clone(),
                        email: email.clone(),
                        encoded_hash: encoded_hash.clone(),
                    },
                )?
                .expect_sequence(expected)
                .with_unique_constraint(add_username_constraint(username)),
            ];
            if verified {
                events.push(
                    UncommittedEvent::from_typed(&aggregate, ctx.editor.clone(), &HumanEvent::EmailVerified)?
                        .expect_sequence(expected),
                );
            }
            let pushed = self.push(events).await?;
            append_and_reduce(&mut model, &pushed)?;
            Ok(AddedUser {
                user_id,
                details: model.state().details(),
            })
        })
        .await
    }

    /// Change the email of an existing user. The new address starts
    /// unverified unless `verified` is set; an unverified address gets a
    /// verification code.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn change_human_email(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        email: &str,
        verified: bool,
    ) -> DomainResult<EmailChanged> {
        let email = &normalize_email(email)?;
        retry_on_conflict(&self.retry, move || async move {
            let mut model = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
            load(&self.store, &mut model).await?;
            model.check_exists()?;
            if model.email == *email {
                return Err(DomainError::precondition("email not changed"));
            }

            let mut events = vec![HumanEvent::EmailChanged { email: email.clone() }];
            let mut code = None;
            if verified {
                events.push(HumanEvent::EmailVerified);
            } else {
                let (event, plain) = self.email_code_event()?;
                events.push(event);
                code = Some(plain);
            }
            let details = self.commit_user_changes(ctx, &mut model, events, None).await?;
            Ok(EmailChanged { details, code })
        })
        .await
    }

    /// Replace the pending verification code of an unverified address.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn create_human_email_verification_code(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
    ) -> DomainResult<EmailChanged> {
        retry_on_conflict(&self.retry, move || async move {
            let mut model = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
            load(&self.store, &mut model).await?;
            model.check_exists()?;
            if model.email_verified {
                return Err(DomainError::precondition("email already verified"));
            }
            let (event, plain) = self.email_code_event()?;
            let details = self.commit_user_changes(ctx, &mut model, vec![event], None).await?;
            Ok(EmailChanged {
                details,
                code: Some(plain),
            })
        })
        .await
    }

    /// Verify the address with the code sent to it.
    ///
    /// A wrong or expired code records `user.human.email.verification.failed`
    /// and fails with `InvalidArgument`.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn verify_human_email(
        &self,
        ctx: &CommandContext,
        user_id: &UserId,
        code: &str,
    ) -> DomainResult<ObjectDetails> {
        if code.is_empty() {
            return Err(DomainError::precondition("code is empty"));
        }
        retry_on_conflict(&self.retry, move || async move {
            let mut model = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
            load(&self.store, &mut model).await?;
            model.check_exists()?;
            let pending = model
                .email_code
                .clone()
                .ok_or_else(|| DomainError::not_found("no verification code pending"))?;

            let valid = !pending.is_expired(self.now()) && verify_code(self.encryption.as_ref(), &pending.code, code)?;
            if valid {
                return self
                    .commit_user_changes(ctx, &mut model, vec![HumanEvent::EmailVerified], None)
                    .await;
            }
            self.commit_user_changes(ctx, &mut model, vec![HumanEvent::EmailVerificationFailed], None)
                .await?;
            Err(DomainError::invalid_argument("invalid verification code"))
        })
        .await
    }

    fn email_code_event(&self) -> DomainResult<(HumanEvent, String)> {
        let (code, plain) = generate_code(self.encryption.as_ref(), EMAIL_CODE_LENGTH)?;
        let event = HumanEvent::EmailCodeAdded {
            code,
            expiry_secs: self.email_code_lifetime.num_seconds(),
        };
        Ok((event, plain))
    }

    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn set_password(&self, ctx: &CommandContext, user_id: &UserId, password: &str) -> DomainResult<ObjectDetails> {
        if password.is_empty() {
            return Err(DomainError::invalid_argument("password is empty"));
        }
        let encoded_hash = &self.hasher.hash(password)?;
        retry_on_conflict(&self.retry, move || async move {
            let mut model = HumanPasswordWriteModel::new(ctx.tenant_id, user_id.clone(), "");
            load(&self.store, &mut model).await?;
            if !model.user_state.exists() {
                return Err(DomainError::not_found("user not found"));
            }
            let event = UncommittedEvent::from_typed(
                &model.aggregate(),
                ctx.editor.clone(),
                &HumanEvent::PasswordChanged {
                    encoded_hash: encoded_hash.clone(),
                },
            )?
            .expect_sequence(ExpectedSequence::Exact(model.processed_sequence()));
            let pushed = self.push(vec![event]).await?;
            append_and_reduce(&mut model, &pushed)?;
            Ok(model.state().details())
        })
        .await
    }

    /// Remove a user and release its username.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, aggregate_id = %user_id), err)]
    pub async fn remove_user(&self, ctx: &CommandContext, user_id: &UserId) -> DomainResult<ObjectDetails> {
        retry_on_conflict(&self.retry, move || async move {
            let mut model = HumanWriteModel::new(ctx.tenant_id, user_id.clone(), "");
            load(&self.store, &mut model).await?;
            model.check_exists()?;
            let username = model.username.clone();
            let release = remove_username_constraint(&username);
            self.commit_user_changes(ctx, &mut model, vec![HumanEvent::Removed { username }], Some(release))
                .await
        })
        .await
    }

    async fn commit_user_changes(
        &self,
        ctx: &CommandContext,
        model: &mut HumanWriteModel,
        events: Vec<HumanEvent>,
        constraint: Option<keyward_events::UniqueConstraint>,
    ) -> DomainResult<ObjectDetails> {
        let aggregate = model.aggregate();
        let expected = ExpectedSequence::Exact(model.processed_sequence());
        let mut uncommitted = events
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(&aggregate, ctx.editor.clone(), event)
                    .map(|e| e.expect_sequence(expected))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let (Some(constraint), Some(first)) = (constraint, uncommitted.first_mut()) {
            first.unique_constraints.push(constraint);
        }
        let pushed = self.push(uncommitted).await?;
        append_and_reduce(model, &pushed)?;
        Ok(model.state().details())
    }
}

#[cfg(test)]
mod tests {
    use keyward_auth::UserState;

    use super::*;
    use crate::command::testing::{Harness, harness};

    fn alice() -> AddHumanUser {
        AddHumanUser {
            username: "Alice".into(),
            email: "alice@example.com".into(),
            email_verified: false,
            password: Some("secret".into()),
        }
    }

    async fn human(h: &Harness, user_id: &UserId) -> HumanWriteModel {
        let mut model = HumanWriteModel::new(h.ctx.tenant_id, user_id.clone(), "");
        load(&h.store, &mut model).await.unwrap();
        model
    }

    #[tokio::test]
    async fn usernames_are_unique_per_tenant() {
        let h = harness();
        let added = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();
        assert_eq!(human(&h, &added.user_id).await.username, "alice");

        let mut duplicate = alice();
        duplicate.username = "  ALICE ".into();
        assert_eq!(
            h.commands.add_human_user(&h.ctx, duplicate).await.unwrap_err(),
            DomainError::already_exists("username already taken")
        );

        let other_tenant = CommandContext::new(keyward_core::TenantId::new(), "org9", "editor");
        assert!(h.commands.add_human_user(&other_tenant, alice()).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_storage() {
        let h = harness();
        let mut bad_email = alice();
        bad_email.email = "not-an-email".into();
        assert!(matches!(
            h.commands.add_human_user(&h.ctx, bad_email).await,
            Err(DomainError::InvalidArgument(_))
        ));
        let mut empty_password = alice();
        empty_password.password = Some(String::new());
        assert!(matches!(
            h.commands.add_human_user(&h.ctx, empty_password).await,
            Err(DomainError::InvalidArgument(_))
        ));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn email_changes_only_when_different() {
        let h = harness();
        let added = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();

        assert_eq!(
            h.commands
                .change_human_email(&h.ctx, &added.user_id, "ALICE@example.com", false)
                .await,
            Err(DomainError::precondition("email not changed"))
        );

        let changed = h
            .commands
            .change_human_email(&h.ctx, &added.user_id, "alice@work.example", true)
            .await
            .unwrap();
        assert_eq!(changed.details.sequence, 3);
        assert_eq!(changed.code, None);
        let model = human(&h, &added.user_id).await;
        assert_eq!(model.email, "alice@work.example");
        assert!(model.email_verified);
    }

    #[tokio::test]
    async fn commands_on_missing_users_are_not_found() {
        let h = harness();
        let ghost = UserId::parse("ghost").unwrap();
        assert!(matches!(
            h.commands.change_human_email(&h.ctx, &ghost, "g@example.com", false).await,
            Err(DomainError::NotFound(_))
        ));
        assert!(matches!(
            h.commands.set_password(&h.ctx, &ghost, "pw").await,
            Err(DomainError::NotFound(_))
        ));
        assert!(matches!(
            h.commands.remove_user(&h.ctx, &ghost).await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn removal_releases_the_username() {
        let h = harness();
        let added = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();
        h.commands.remove_user(&h.ctx, &added.user_id).await.unwrap();
        assert_eq!(human(&h, &added.user_id).await.user_state, UserState::Removed);
        assert!(matches!(
            h.commands.change_human_email(&h.ctx, &added.user_id, "new@example.com", false).await,
            Err(DomainError::NotFound(_))
        ));

        let again = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();
        assert_ne!(again.user_id, added.user_id);
    }

    #[tokio::test]
    async fn passwords_can_be_replaced() {
        let h = harness();
        let mut user = alice();
        user.password = None;
        let added = h.commands.add_human_user(&h.ctx, user).await.unwrap();
        assert!(matches!(
            h.commands.set_password(&h.ctx, &added.user_id, "").await,
            Err(DomainError::InvalidArgument(_))
        ));
        h.commands.set_password(&h.ctx, &added.user_id, "new-secret").await.unwrap();

        let mut model = HumanPasswordWriteModel::new(h.ctx.tenant_id, added.user_id.clone(), "");
        load(&h.store, &mut model).await.unwrap();
        assert!(model.encoded_hash.is_some());
    }

    #[tokio::test]
    async fn an_unverified_address_is_verified_with_its_code() {
        let h = harness();
        let added = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();
        let changed = h
            .commands
            .change_human_email(&h.ctx, &added.user_id, "alice@work.example", false)
            .await
            .unwrap();
        let code = changed.code.clone().unwrap();
        assert_eq!(code.len(), 6);
        assert!(human(&h, &added.user_id).await.email_code.is_some());

        let wrong: String = code.chars().map(|c| if c == 'A' { 'B' } else { 'A' }).collect();
        let before = h.store.len();
        assert_eq!(
            h.commands.verify_human_email(&h.ctx, &added.user_id, &wrong).await,
            Err(DomainError::invalid_argument("invalid verification code"))
        );
        assert_eq!(h.store.len(), before + 1);
        assert!(!human(&h, &added.user_id).await.email_verified);

        h.commands.verify_human_email(&h.ctx, &added.user_id, &code).await.unwrap();
        let model = human(&h, &added.user_id).await;
        assert!(model.email_verified);
        assert_eq!(model.email_code, None);
        assert!(matches!(
            h.commands.verify_human_email(&h.ctx, &added.user_id, &code).await,
            Err(DomainError::NotFound(_))
        ));
        assert_eq!(
            h.commands.create_human_email_verification_code(&h.ctx, &added.user_id).await,
            Err(DomainError::precondition("email already verified"))
        );
    }

    #[tokio::test]
    async fn expired_codes_are_replaced_by_a_new_one() {
        let h = harness();
        let added = h.commands.add_human_user(&h.ctx, alice()).await.unwrap();
        assert!(matches!(
            h.commands.verify_human_email(&h.ctx, &added.user_id, "ABC234").await,
            Err(DomainError::NotFound(_))
        ));
        assert_eq!(
            h.commands.verify_human_email(&h.ctx, &added.user_id, "").await,
            Err(DomainError::precondition("code is empty"))
        );

        let first = h
            .commands
            .create_human_email_verification_code(&h.ctx, &added.user_id)
            .await
            .unwrap()
            .code
            .unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        assert!(matches!(
            h.commands.verify_human_email(&h.ctx, &added.user_id, &first).await,
            Err(DomainError::InvalidArgument(_))
        ));

        let second = h
            .commands
            .create_human_email_verification_code(&h.ctx, &added.user_id)
            .await
            .unwrap()
            .code
            .unwrap();
        h.commands.verify_human_email(&h.ctx, &added.user_id, &second).await.unwrap();
        assert!(human(&h, &added.user_id).await.email_verified);

        let ghost = UserId::parse("ghost").unwrap();
        assert!(matches!(
            h.commands.create_human_email_verification_code(&h.ctx, &ghost).await,
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn debug_output_redacts_the_password() {
        assert!(!format!("{:?}", alice()).contains("secret"));
    }
}
