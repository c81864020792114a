//! `keyward-auth`: identity domain: sessions, OIDC tokens, users and crypto.
//!
//! This crate is decoupled from storage. It defines the event enums, the
//! write models that fold them and the token/crypto primitives commands use.

pub mod crypto;
pub mod instance;
pub mod oidc_session;
pub mod permissions;
pub mod session;
pub mod token;
pub mod user;

pub use crypto::{
    AesGcmEncryption, Argon2PasswordHasher, CryptoError, CryptoValue, EncryptionAlgorithm, PasswordHasher,
    SessionTokenCreator, Sha256PasswordHasher, generate_code, verify_code,
};
pub use instance::{
    InstanceEvent, InstanceOidcSettingsWriteModel, InstancePasswordAgePolicyWriteModel, PasswordAgePolicy, TokenLifetimes,
};
pub use oidc_session::{AuthMethod, OidcSessionEvent, OidcSessionWriteModel, TokenReason};
pub use permissions::{Permission, SESSION_DELETE, SESSION_WRITE, has_permission};
pub use session::{Metadata, SessionCheck, SessionEvent, SessionState, SessionWriteModel};
pub use token::TokenRef;
pub use user::{EmailCode, HumanEvent, HumanPasswordWriteModel, HumanWriteModel, UserMetadataWriteModel, UserState};

use keyward_events::{EventRegistry, EventRegistryBuilder};

/// Register every event type of this crate.
pub fn register_events(builder: EventRegistryBuilder) -> EventRegistryBuilder {
    builder
        .register::<SessionEvent>()
        .register::<OidcSessionEvent>()
        .register::<HumanEvent>()
        .register::<InstanceEvent>()
}

/// Registry with all identity events.
pub fn event_registry() -> EventRegistry {
    register_events(EventRegistry::builder()).build()
}


#[cfg(test)]
mod tests {
    use keyward_events::DomainEvent;

    use super::*;

    #[test]
    fn registry_knows_every_identity_event() {
        let registry = event_registry();
        assert!(registry.is_registered("session", "session.terminated"));
        assert!(registry.is_registered("oidc_session", "oidc_session.refresh_token.renewed"));
        assert!(registry.is_registered("user", "user.removed"));
        assert!(registry.is_registered("instance", "instance.oidc.settings.changed"));
        assert!(registry.is_registered("user", "user.metadata.removed"));
        assert!(registry.is_registered("user", "user.human.email.code.added"));
        assert!(registry.is_registered("instance", "instance.policy.password.age.changed"));
        assert_eq!(
            registry.len(),
            SessionEvent::EVENT_TYPES.len()
                + OidcSessionEvent::EVENT_TYPES.len()
                + HumanEvent::EVENT_TYPES.len()
                + InstanceEvent::EVENT_TYPES.len()
        );
    }
}
