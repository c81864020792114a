//! Projection engine and the identity read models.
//!
//! Projections consume the event log in position order and build
//! query-optimized tables. All projections are:
//! - **Rebuildable**: reset the cursor and they are reconstructed from the log
//! - **Tenant-isolated**: every row is keyed by `instance_id`
//! - **Exclusive**: one worker per projection at a time, guarded by a lease

pub mod engine;
pub mod in_memory;
pub mod postgres;
pub mod store;

// Identity read models
pub mod oidc_settings;
pub mod password_age_policy;
pub mod sessions;
pub mod user_metadata;
pub mod users;

pub use engine::{ProjectionEngine, TickReport};
pub use in_memory::InMemoryProjectionStore;
pub use oidc_settings::{OIDC_SETTINGS_TABLE, OidcSettingsProjection};
pub use password_age_policy::{PASSWORD_AGE_POLICIES_TABLE, PasswordAgePolicyProjection};
pub use postgres::PostgresProjectionStore;
pub use sessions::{SESSIONS_TABLE, SessionProjection};
pub use store::{FailedEvent, FailedEventFilter, ProjectionStore, Row};
pub use user_metadata::{USER_METADATA_TABLE, UserMetadataProjection};
pub use users::{USERS_TABLE, UserProjection};

use std::sync::Arc;

use keyward_events::Projection;

/// Every built-in projection.
pub fn identity_projections() -> Vec<Arc<dyn Projection>> {
    vec![
        Arc::new(SessionProjection),
        Arc::new(UserProjection),
        Arc::new(UserMetadataProjection),
        Arc::new(OidcSettingsProjection),
        Arc::new(PasswordAgePolicyProjection),
    ]
}
