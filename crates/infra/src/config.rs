//! Configuration loaded from environment variables with sensible defaults.
//!
//! `KeywardConfig::from_env()` first reads an optional `.env` file, then the
//! process environment. Unset or unparsable variables fall back to the
//! defaults below.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `KEYWARD_DATABASE_URL` | `postgres://localhost/keyward` |
//! | `KEYWARD_DATABASE_MAX_CONNECTIONS` | `10` |
//! | `KEYWARD_DATABASE_CONNECT_TIMEOUT_SECS` | `5` |
//! | `KEYWARD_PROJECTION_BULK_LIMIT` | `200` |
//! | `KEYWARD_PROJECTION_MAX_FAILURE_COUNT` | `5` |
//! | `KEYWARD_PROJECTION_LOCK_LEASE_MS` | `10000` |
//! | `KEYWARD_PROJECTION_LEASE_RENEW_EVERY` | `50` |
//! | `KEYWARD_PROJECTION_REQUEUE_MS` | `1000` |
//! | `KEYWARD_ACCESS_TOKEN_LIFETIME_SECS` | 12h |
//! | `KEYWARD_REFRESH_TOKEN_LIFETIME_SECS` | 90d |
//! | `KEYWARD_REFRESH_TOKEN_IDLE_LIFETIME_SECS` | 30d |
//! | `KEYWARD_EMAIL_CODE_LIFETIME_SECS` | 1h |
//! | `KEYWARD_ENCRYPTION_KEY_ID` | `default` |
//! | `KEYWARD_ENCRYPTION_KEY` | none (base64, 32 bytes) |
//! | `KEYWARD_PASSWORD_HASH_MEMORY_KIB` | `19456` |
//! | `KEYWARD_PASSWORD_HASH_ITERATIONS` | `2` |
//! | `KEYWARD_PASSWORD_HASH_PARALLELISM` | `1` |
//! | `KEYWARD_RETRY_MAX_ATTEMPTS` | `3` |
//! | `KEYWARD_RETRY_INITIAL_BACKOFF_MS` | `10` |
//! | `KEYWARD_RETRY_MAX_BACKOFF_MS` | `1000` |
//! | `KEYWARD_RETRY_MULTIPLIER` | `2.0` |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use keyward_auth::{AesGcmEncryption, Argon2PasswordHasher, TokenLifetimes};

use crate::command::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),

    #[error("invalid {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Application configuration.
#[derive(Debug, Clone, Default)]
pub struct KeywardConfig {
    pub database: DatabaseConfig,
    pub projections: ProjectionConfig,
    pub tokens: TokenConfig,
    pub crypto: CryptoConfig,
    pub retry: RetryPolicy,
}

impl KeywardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(&lookup);
        let defaults = Self::default();

        let database = DatabaseConfig {
            url: vars.get("KEYWARD_DATABASE_URL").unwrap_or(defaults.database.url),
            max_connections: vars.parse("KEYWARD_DATABASE_MAX_CONNECTIONS", defaults.database.max_connections),
            connect_timeout: Duration::from_secs(vars.parse(
                "KEYWARD_DATABASE_CONNECT_TIMEOUT_SECS",
                defaults.database.connect_timeout.as_secs(),
            )),
        };

        let projections = ProjectionConfig {
            bulk_limit: vars.parse("KEYWARD_PROJECTION_BULK_LIMIT", defaults.projections.bulk_limit),
            max_failure_count: vars.parse(
                "KEYWARD_PROJECTION_MAX_FAILURE_COUNT",
                defaults.projections.max_failure_count,
            ),
            lock_lease: Duration::from_millis(vars.parse(
                "KEYWARD_PROJECTION_LOCK_LEASE_MS",
                defaults.projections.lock_lease.as_millis() as u64,
            )),
            lease_renew_every: vars
                .parse("KEYWARD_PROJECTION_LEASE_RENEW_EVERY", defaults.projections.lease_renew_every)
                .max(1),
            requeue_every: Duration::from_millis(vars.parse(
                "KEYWARD_PROJECTION_REQUEUE_MS",
                defaults.projections.requeue_every.as_millis() as u64,
            )),
        };

        let seconds = |var, default: chrono::Duration| {
            chrono::Duration::seconds(vars.parse(var, default.num_seconds()))
        };
        let tokens = TokenConfig {
            access_token_lifetime: seconds(
                "KEYWARD_ACCESS_TOKEN_LIFETIME_SECS",
                defaults.tokens.access_token_lifetime,
            ),
            refresh_token_lifetime: seconds(
                "KEYWARD_REFRESH_TOKEN_LIFETIME_SECS",
                defaults.tokens.refresh_token_lifetime,
            ),
            refresh_token_idle_lifetime: seconds(
                "KEYWARD_REFRESH_TOKEN_IDLE_LIFETIME_SECS",
                defaults.tokens.refresh_token_idle_lifetime,
            ),
            email_code_lifetime: seconds("KEYWARD_EMAIL_CODE_LIFETIME_SECS", defaults.tokens.email_code_lifetime),
        };

        let crypto = CryptoConfig {
            key_id: vars.get("KEYWARD_ENCRYPTION_KEY_ID").unwrap_or(defaults.crypto.key_id),
            key: vars.get("KEYWARD_ENCRYPTION_KEY"),
            password_hash_memory_kib: vars.parse(
                "KEYWARD_PASSWORD_HASH_MEMORY_KIB",
                defaults.crypto.password_hash_memory_kib,
            ),
            password_hash_iterations: vars.parse(
                "KEYWARD_PASSWORD_HASH_ITERATIONS",
                defaults.crypto.password_hash_iterations,
            ),
            password_hash_parallelism: vars.parse(
                "KEYWARD_PASSWORD_HASH_PARALLELISM",
                defaults.crypto.password_hash_parallelism,
            ),
        };

        let retry = RetryPolicy::builder()
            .max_attempts(vars.parse("KEYWARD_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts))
            .initial_backoff(Duration::from_millis(vars.parse(
                "KEYWARD_RETRY_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )))
            .max_backoff(Duration::from_millis(vars.parse(
                "KEYWARD_RETRY_MAX_BACKOFF_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )))
            .multiplier(vars.parse("KEYWARD_RETRY_MULTIPLIER", defaults.retry.multiplier))
            .build();

        Self {
            database,
            projections,
            tokens,
            crypto,
            retry,
        }
    }

    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    pub fn with_projections(mut self, projections: ProjectionConfig) -> Self {
        self.projections = projections;
        self
    }

    pub fn with_tokens(mut self, tokens: TokenConfig) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_crypto(mut self, crypto: CryptoConfig) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// `PostgreSQL` connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/keyward".to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await
    }
}

/// Projection engine tuning.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Maximum number of events read per batch.
    pub bulk_limit: u64,
    /// An event failing more often than this is skipped.
    pub max_failure_count: u32,
    /// How long a worker holds the projection lock without renewing it.
    pub lock_lease: Duration,
    /// Number of events applied between two lease renewals within a batch.
    pub lease_renew_every: u64,
    /// Interval between worker ticks.
    pub requeue_every: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            bulk_limit: 200,
            max_failure_count: 5,
            lock_lease: Duration::from_secs(10),
            lease_renew_every: 50,
            requeue_every: Duration::from_secs(1),
        }
    }
}

impl ProjectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bulk_limit(mut self, bulk_limit: u64) -> Self {
        self.bulk_limit = bulk_limit.max(1);
        self
    }

    pub fn with_max_failure_count(mut self, max_failure_count: u32) -> Self {
        self.max_failure_count = max_failure_count;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_lease_renew_every(mut self, events: u64) -> Self {
        self.lease_renew_every = events.max(1);
        self
    }

    pub fn with_requeue_every(mut self, interval: Duration) -> Self {
        self.requeue_every = interval;
        self
    }
}

/// System-wide token lifetimes, used when an instance sets no override.
#[derive(Debug, Clone, Copy)]
pub struct TokenConfig {
    pub access_token_lifetime: chrono::Duration,
    pub refresh_token_lifetime: chrono::Duration,
    pub refresh_token_idle_lifetime: chrono::Duration,
    /// How long an email verification code stays valid.
    pub email_code_lifetime: chrono::Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_token_lifetime: chrono::Duration::hours(12),
            refresh_token_lifetime: chrono::Duration::hours(2160),
            refresh_token_idle_lifetime: chrono::Duration::hours(720),
            email_code_lifetime: chrono::Duration::hours(1),
        }
    }
}

impl TokenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_access_token_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.access_token_lifetime = lifetime;
        self
    }

    pub fn with_refresh_token_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.refresh_token_lifetime = lifetime;
        self
    }

    pub fn with_refresh_token_idle_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.refresh_token_idle_lifetime = lifetime;
        self
    }

    pub fn with_email_code_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.email_code_lifetime = lifetime;
        self
    }

    pub fn lifetimes(&self) -> TokenLifetimes {
        TokenLifetimes {
            access_token: self.access_token_lifetime,
            refresh_token: self.refresh_token_lifetime,
            refresh_token_idle: self.refresh_token_idle_lifetime,
        }
    }
}

/// Encryption key and Argon2id password hashing settings.
#[derive(Clone)]
pub struct CryptoConfig {
    pub key_id: String,
    /// Base64 encoded 32 byte AES key.
    pub key: Option<String>,
    pub password_hash_memory_kib: u32,
    pub password_hash_iterations: u32,
    pub password_hash_parallelism: u32,
}

impl core::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("key_id", &self.key_id)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("password_hash_memory_kib", &self.password_hash_memory_kib)
            .field("password_hash_iterations", &self.password_hash_iterations)
            .field("password_hash_parallelism", &self.password_hash_parallelism)
            .finish()
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_id: "default".to_string(),
            key: None,
            password_hash_memory_kib: 19_456,
            password_hash_iterations: 2,
            password_hash_parallelism: 1,
        }
    }
}

impl CryptoConfig {
    pub fn new(key_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_password_hash_iterations(mut self, iterations: u32) -> Self {
        self.password_hash_iterations = iterations;
        self
    }

    pub fn encryption(&self) -> Result<AesGcmEncryption, ConfigError> {
        let key = self.key.as_deref().ok_or(ConfigError::Missing("KEYWARD_ENCRYPTION_KEY"))?;
        AesGcmEncryption::from_base64_key(self.key_id.clone(), key).map_err(|e| ConfigError::Invalid {
            var: "KEYWARD_ENCRYPTION_KEY",
            message: e.to_string(),
        })
    }

    pub fn with_password_hash_memory_kib(mut self, memory_kib: u32) -> Self {
        self.password_hash_memory_kib = memory_kib;
        self
    }

    pub fn password_hasher(&self) -> Result<Argon2PasswordHasher, ConfigError> {
        Argon2PasswordHasher::new(
            self.password_hash_memory_kib,
            self.password_hash_iterations,
            self.password_hash_parallelism,
        )
        .map_err(|e| ConfigError::Invalid {
            var: "KEYWARD_PASSWORD_HASH_MEMORY_KIB",
            message: e.to_string(),
        })
    }
}
