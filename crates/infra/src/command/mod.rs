//! Command service: the write side of the identity system.
//!
//! Every command follows the same pipeline:
//!
//! ```text
//! CommandContext + typed params
//!   ↓
//! 1. Load the write model(s) (filter + fold)
//!   ↓
//! 2. Validate state and compute only the events that change something
//!   ↓
//! 3. Push with `Exact(processed_sequence)` on the primary aggregate
//!   ↓
//! 4. Re-fold the pushed events (read-your-writes) and return ObjectDetails
//! ```
//!
//! The whole pipeline runs inside [`retry_on_conflict`], so a concurrent
//! writer only costs a reload. A command that would change nothing emits no
//! events.

pub mod instance;
pub mod oidc_session;
pub mod retry;
pub mod session;
pub mod user;
pub mod user_metadata;

use std::sync::Arc;

use keyward_auth::{
    Argon2PasswordHasher, EncryptionAlgorithm, PasswordHasher, Permission, SessionTokenCreator, TokenLifetimes,
    has_permission,
};
use keyward_core::{Clock, DomainError, DomainResult, IdGenerator, SystemClock, TenantId, UuidGenerator};
use keyward_events::{StoredEvent, UncommittedEvent, WriteModel, fold};

use crate::config::TokenConfig;
use crate::event_store::EventStore;

pub use oidc_session::{CreateOidcSession, OidcSession};
pub use retry::{RetryPolicy, RetryPolicyBuilder, retry_on_conflict};
pub use session::SessionChanged;
pub use user::{AddHumanUser, AddedUser, EmailChanged};

/// Caller scope of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub tenant_id: TenantId,
    /// Organization new aggregates are owned by.
    pub resource_owner: String,
    /// Recorded as the editor of every event the command emits.
    pub editor: String,
    pub permissions: Vec<Permission>,
}

impl CommandContext {
    pub fn new(tenant_id: TenantId, resource_owner: impl Into<String>, editor: impl Into<String>) -> Self {
        Self {
            tenant_id,
            resource_owner: resource_owner.into(),
            editor: editor.into(),
            permissions: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn has_permission(&self, permission: &Permission) -> bool {
        has_permission(&self.permissions, permission)
    }
}

/// Filter the log with the model's query and fold the result.
pub async fn load<S, W>(store: &S, model: &mut W) -> DomainResult<()>
where
    S: EventStore + ?Sized,
    W: WriteModel,
{
    let query = model.query()?;
    let events = store.filter(&query).await?;
    fold(model, &events)
}

/// Fold the events a push returned into the model that produced them.
///
/// Events outside the model's query are ignored.
pub fn append_and_reduce<W: WriteModel>(model: &mut W, pushed: &[StoredEvent]) -> DomainResult<()> {
    let query = model.query()?;
    let own: Vec<StoredEvent> = pushed.iter().filter(|e| query.matches(e)).cloned().collect();
    fold(model, &own)
}

/// Entry point for every identity command.
///
/// Generic over the event store so tests run against the in-memory log and
/// production against Postgres.
pub struct Commands<S> {
    store: S,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    encryption: Arc<dyn EncryptionAlgorithm>,
    hasher: Arc<dyn PasswordHasher>,
    session_tokens: SessionTokenCreator,
    token_defaults: TokenLifetimes,
    email_code_lifetime: chrono::Duration,
    retry: RetryPolicy,
}

impl<S> core::fmt::Debug for Commands<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Commands")
            .field("token_defaults", &self.token_defaults)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> Commands<S> {
    pub fn builder(store: S, encryption: Arc<dyn EncryptionAlgorithm>) -> CommandsBuilder<S> {
        CommandsBuilder {
            store,
            encryption,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            hasher: Arc::new(Argon2PasswordHasher::default()),
            token_defaults: TokenConfig::default().lifetimes(),
            email_code_lifetime: TokenConfig::default().email_code_lifetime,
            retry: RetryPolicy::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Push a batch; an empty batch never reaches the store.
    async fn push(&self, events: Vec<UncommittedEvent>) -> DomainResult<Vec<StoredEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.push(events).await?)
    }

    fn check_permission(&self, ctx: &CommandContext, permission: &Permission) -> DomainResult<()> {
        if ctx.has_permission(permission) {
            return Ok(());
        }
        Err(DomainError::permission_denied(format!(
            "missing permission {permission}"
        )))
    }
}

pub struct CommandsBuilder<S> {
    store: S,
    encryption: Arc<dyn EncryptionAlgorithm>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    hasher: Arc<dyn PasswordHasher>,
    token_defaults: TokenLifetimes,
    email_code_lifetime: chrono::Duration,
    retry: RetryPolicy,
}

impl<S: EventStore> CommandsBuilder<S> {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn password_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// System lifetimes used where an instance has no override.
    pub fn token_defaults(mut self, tokens: &TokenConfig) -> Self {
        self.token_defaults = tokens.lifetimes();
        self.email_code_lifetime = tokens.email_code_lifetime;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Commands<S> {
        Commands {
            session_tokens: SessionTokenCreator::new(self.encryption.clone()),
            store: self.store,
            clock: self.clock,
            ids: self.ids,
            encryption: self.encryption,
            hasher: self.hasher,
            token_defaults: self.token_defaults,
            email_code_lifetime: self.email_code_lifetime,
            retry: self.retry,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use keyward_auth::{AesGcmEncryption, Sha256PasswordHasher};
    use keyward_core::{FixedClock, SequentialIdGenerator};

    use super::*;
    use crate::event_store::InMemoryEventStore;

    pub struct Harness {
        pub commands: Commands<Arc<InMemoryEventStore>>,
        pub store: Arc<InMemoryEventStore>,
        pub clock: Arc<FixedClock>,
        pub ctx: CommandContext,
    }

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    pub fn encryption() -> Arc<AesGcmEncryption> {
        Arc::new(AesGcmEncryption::new("k1", &[7u8; 32]).unwrap())
    }

    pub fn harness() -> Harness {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryEventStore::with_clock(
            keyward_auth::event_registry(),
            clock.clone(),
        ));
        let commands = Commands::builder(store.clone(), encryption())
            .clock(clock.clone())
            .id_generator(Arc::new(SequentialIdGenerator::new("id")))
            .password_hasher(Arc::new(Sha256PasswordHasher::new(2)))
            .retry(
                RetryPolicy::builder()
                    .initial_backoff(std::time::Duration::from_millis(1))
                    .max_backoff(std::time::Duration::from_millis(2))
                    .build(),
            )
            .build();
        let ctx = CommandContext::new(keyward_core::TenantId::new(), "org1", "editor1");
        Harness {
            commands,
            store,
            clock,
            ctx,
        }
    }
}
