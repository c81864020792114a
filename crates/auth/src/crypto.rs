//! Symmetric encryption, password hashing, session tokens and one-time codes.
//!
//! Encryption and hashing sit behind traits so commands can run against
//! deterministic fakes in tests and against real keys in production.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use argon2::password_hash::{self, PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordVerifier, Version};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use keyward_core::DomainError;

/// AES-GCM nonce length (96 bits).
const NONCE_LEN: usize = 12;
const AES_256_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const SESSION_TOKEN_LEN: usize = 32;
const HASH_SCHEME: &str = "sha256i";
/// Uppercase letters and digits without the easily confused `0 O 1 I`.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("value was encrypted with key {actual}, expected {expected}")]
    KeyMismatch { expected: String, actual: String },

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("malformed password hash")]
    MalformedHash,

    #[error("password hashing failed: {0}")]
    Hash(String),
}

impl From<CryptoError> for DomainError {
    fn from(value: CryptoError) -> Self {
        DomainError::internal(value.to_string())
    }
}

/// An encrypted value as stored in event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoValue {
    pub algorithm: String,
    pub key_id: String,
    /// Standard base64 of `nonce || ciphertext`.
    pub crypted: String,
}

pub trait EncryptionAlgorithm: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Id of the key new values are encrypted with.
    fn encryption_key_id(&self) -> &str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_string(&self, ciphertext: &[u8], key_id: &str) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(ciphertext, key_id)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}

pub fn encrypt_value(
    algorithm: &dyn EncryptionAlgorithm,
    plaintext: &[u8],
) -> Result<CryptoValue, CryptoError> {
    let crypted = algorithm.encrypt(plaintext)?;
    Ok(CryptoValue {
        algorithm: algorithm.algorithm().to_string(),
        key_id: algorithm.encryption_key_id().to_string(),
        crypted: STANDARD.encode(crypted),
    })
}

pub fn decrypt_value(
    algorithm: &dyn EncryptionAlgorithm,
    value: &CryptoValue,
) -> Result<Vec<u8>, CryptoError> {
    if value.algorithm != algorithm.algorithm() {
        return Err(CryptoError::InvalidKey(format!(
            "value uses algorithm {}, configured {}",
            value.algorithm,
            algorithm.algorithm()
        )));
    }
    let crypted = STANDARD
        .decode(&value.crypted)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    algorithm.decrypt(&crypted, &value.key_id)
}

/// AES-256-GCM with a random nonce prepended to every ciphertext.
pub struct AesGcmEncryption {
    key_id: String,
    cipher: Aes256Gcm,
}

impl core::fmt::Debug for AesGcmEncryption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AesGcmEncryption")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl AesGcmEncryption {
    pub fn new(key_id: impl Into<String>, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != AES_256_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {AES_256_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            key_id: key_id.into(),
            cipher,
        })
    }

    /// Build from a standard-base64 encoded 32 byte key.
    pub fn from_base64_key(key_id: impl Into<String>, key: &str) -> Result<Self, CryptoError> {
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::new(key_id, &key)
    }
}

impl EncryptionAlgorithm for AesGcmEncryption {
    fn algorithm(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn encryption_key_id(&self) -> &str {
        &self.key_id
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> Result<Vec<u8>, CryptoError> {
        if key_id != self.key_id {
            return Err(CryptoError::KeyMismatch {
                expected: self.key_id.clone(),
                actual: key_id.to_string(),
            });
        }
        if ciphertext.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decrypt)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Passwords
// ─────────────────────────────────────────────────────────────────────────────

pub trait PasswordHasher: Send + Sync {
    /// Hash a plaintext password into a self-describing encoded string.
    fn hash(&self, password: &str) -> Result<String, CryptoError>;

    /// Compare a plaintext password against an encoded hash.
    fn verify(&self, encoded: &str, password: &str) -> Result<bool, CryptoError>;
}

/// Salted, iterated SHA-256: `$sha256i$<iterations>$<salt>$<hash>`.
#[derive(Debug, Clone, Copy)]
pub struct Sha256PasswordHasher {
    iterations: u32,
}

impl Default for Sha256PasswordHasher {
    fn default() -> Self {
        Self { iterations: 10_000 }
    }
}

impl Sha256PasswordHasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    fn digest(salt: &[u8], password: &str, iterations: u32) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        let mut digest = hasher.finalize();
        for _ in 1..iterations {
            let mut hasher = Sha256::new();
            hasher.update(digest);
            hasher.update(password.as_bytes());
            digest = hasher.finalize();
        }
        digest.to_vec()
    }
}

impl PasswordHasher for Sha256PasswordHasher {
    fn hash(&self, password: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = Self::digest(&salt, password, self.iterations);
        Ok(format!(
            "${HASH_SCHEME}${}${}${}",
            self.iterations,
            URL_SAFE_NO_PAD.encode(salt),
            URL_SAFE_NO_PAD.encode(digest)
        ))
    }

    fn verify(&self, encoded: &str, password: &str) -> Result<bool, CryptoError> {
        let mut parts = encoded.split('$');
        let (Some(""), Some(HASH_SCHEME), Some(iterations), Some(salt), Some(hash), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(CryptoError::MalformedHash);
        };
        let iterations: u32 = iterations.parse().map_err(|_| CryptoError::MalformedHash)?;
        let salt = URL_SAFE_NO_PAD
            .decode(salt)
            .map_err(|_| CryptoError::MalformedHash)?;
        let expected = URL_SAFE_NO_PAD
            .decode(hash)
            .map_err(|_| CryptoError::MalformedHash)?;
        let actual = Self::digest(&salt, password, iterations.max(1));
        Ok(constant_time_eq::constant_time_eq(&actual, &expected))
    }
}

/// Argon2id in PHC string format (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`).
///
/// Hashes written by [`Sha256PasswordHasher`] still verify, so existing
/// users keep their passwords until they next change them.
#[derive(Debug, Clone)]
pub struct Argon2PasswordHasher {
    params: Params,
    legacy: Sha256PasswordHasher,
}

impl Default for Argon2PasswordHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
            legacy: Sha256PasswordHasher::default(),
        }
    }
}

impl Argon2PasswordHasher {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, CryptoError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| CryptoError::Hash(e.to_string()))?;
        Ok(Self {
            params,
            legacy: Sha256PasswordHasher::default(),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl PasswordHasher for Argon2PasswordHasher {
    fn hash(&self, password: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|e| CryptoError::Hash(e.to_string()))?;
        let hash = argon2::PasswordHasher::hash_password(&self.argon2(), password.as_bytes(), &salt)
            .map_err(|e| CryptoError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, encoded: &str, password: &str) -> Result<bool, CryptoError> {
        if encoded.starts_with(&format!("${HASH_SCHEME}$")) {
            return self.legacy.verify(encoded, password);
        }
        let parsed = PasswordHash::new(encoded).map_err(|_| CryptoError::MalformedHash)?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(_) => Err(CryptoError::MalformedHash),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Mints opaque session tokens and verifies presented ones.
///
/// The caller receives the plaintext token once; only the encrypted form is
/// stored in the `session.token.set` event.
#[derive(Clone)]
pub struct SessionTokenCreator {
    algorithm: Arc<dyn EncryptionAlgorithm>,
}

impl SessionTokenCreator {
    pub fn new(algorithm: Arc<dyn EncryptionAlgorithm>) -> Self {
        Self { algorithm }
    }

    /// Returns `(stored value, plaintext token)`.
    pub fn create(&self) -> Result<(CryptoValue, String), CryptoError> {
        let mut bytes = [0u8; SESSION_TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let stored = encrypt_value(self.algorithm.as_ref(), token.as_bytes())?;
        Ok((stored, token))
    }

    pub fn verify(&self, stored: &CryptoValue, presented: &str) -> Result<bool, CryptoError> {
        let expected = decrypt_value(self.algorithm.as_ref(), stored)?;
        Ok(constant_time_eq::constant_time_eq(&expected, presented.as_bytes()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// One-time codes
// ─────────────────────────────────────────────────────────────────────────────

/// Returns `(stored value, plaintext code)` for a random code of `length`
/// characters.
pub fn generate_code(
    algorithm: &dyn EncryptionAlgorithm,
    length: usize,
) -> Result<(CryptoValue, String), CryptoError> {
    let mut rng = rand::thread_rng();
    let code: String = (0..length.max(1))
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect();
    let stored = encrypt_value(algorithm, code.as_bytes())?;
    Ok((stored, code))
}

pub fn verify_code(
    algorithm: &dyn EncryptionAlgorithm,
    stored: &CryptoValue,
    presented: &str,
) -> Result<bool, CryptoError> {
    let expected = decrypt_value(algorithm, stored)?;
    Ok(constant_time_eq::constant_time_eq(&expected, presented.as_bytes()))
}
