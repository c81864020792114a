//! Wire formats of OIDC token identifiers.
//!
//! Access token ids handed to callers are `<oidcSessionID>-at_<id>`.
//! Refresh tokens are `base64url(encrypt("<oidcSessionID>-rt_<id>:<userID>"))`.
//! Both resolve to their owning aggregate without a reverse index.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use keyward_core::{DomainError, UserId};

use crate::crypto::EncryptionAlgorithm;

pub const TOKEN_DELIMITER: char = '-';
pub const ACCESS_TOKEN_PREFIX: &str = "at_";
pub const REFRESH_TOKEN_PREFIX: &str = "rt_";
pub const SUBJECT_DELIMITER: char = ':';
/// Prefix of generated OIDC session ids.
pub const ID_PREFIX_V2: &str = "V2_";

/// A token string resolved to its session and token id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRef {
    Access {
        oidc_session_id: String,
        access_token_id: String,
    },
    Refresh {
        oidc_session_id: String,
        refresh_token_id: String,
    },
}

impl TokenRef {
    pub fn oidc_session_id(&self) -> &str {
        match self {
            TokenRef::Access { oidc_session_id, .. } | TokenRef::Refresh { oidc_session_id, .. } => {
                oidc_session_id
            }
        }
    }
}

pub fn access_token_id(oidc_session_id: &str, access_token_id: &str) -> String {
    format!("{oidc_session_id}{TOKEN_DELIMITER}{access_token_id}")
}

/// Parse a revocation/introspection token: exactly `<sid>-at_*` or `<sid>-rt_*`.
pub fn token_ref_from_token(token: &str) -> Result<TokenRef, DomainError> {
    let parts: Vec<&str> = token.split(TOKEN_DELIMITER).collect();
    let [session, id] = parts.as_slice() else {
        return Err(DomainError::precondition("token is invalid"));
    };
    if session.is_empty() {
        return Err(DomainError::precondition("token is invalid"));
    }
    if id.starts_with(REFRESH_TOKEN_PREFIX) {
        return Ok(TokenRef::Refresh {
            oidc_session_id: (*session).to_string(),
            refresh_token_id: (*id).to_string(),
        });
    }
    if id.starts_with(ACCESS_TOKEN_PREFIX) {
        return Ok(TokenRef::Access {
            oidc_session_id: (*session).to_string(),
            access_token_id: (*id).to_string(),
        });
    }
    Err(DomainError::precondition("token is invalid"))
}

/// Split a decrypted refresh token into `(oidc_session_id, refresh_token_id)`.
///
/// The trailing `:<userID>` subject is dropped.
pub fn parse_refresh_token(plaintext: &str) -> Result<(String, String), DomainError> {
    let parts: Vec<&str> = plaintext.split(TOKEN_DELIMITER).collect();
    if parts.len() < 2 || !parts[1].starts_with(REFRESH_TOKEN_PREFIX) {
        return Err(DomainError::RefreshTokenInvalid);
    }
    let refresh_token_id = parts[1]
        .split(SUBJECT_DELIMITER)
        .next()
        .unwrap_or_default();
    Ok((parts[0].to_string(), refresh_token_id.to_string()))
}

pub fn encode_refresh_token(
    algorithm: &dyn EncryptionAlgorithm,
    oidc_session_id: &str,
    refresh_token_id: &str,
    user_id: &UserId,
) -> Result<String, DomainError> {
    let plaintext = format!(
        "{oidc_session_id}{TOKEN_DELIMITER}{refresh_token_id}{SUBJECT_DELIMITER}{user_id}"
    );
    let crypted = algorithm.encrypt(plaintext.as_bytes())?;
    Ok(URL_SAFE_NO_PAD.encode(crypted))
}

/// Decode, decrypt and parse an opaque refresh token.
pub fn decode_refresh_token(
    algorithm: &dyn EncryptionAlgorithm,
    refresh_token: &str,
) -> Result<(String, String), DomainError> {
    let crypted = URL_SAFE_NO_PAD
        .decode(refresh_token)
        .map_err(|_| DomainError::invalid_argument("refresh token is invalid"))?;
    let plaintext = algorithm
        .decrypt_string(&crypted, algorithm.encryption_key_id())
        .map_err(|_| DomainError::RefreshTokenInvalid)?;
    parse_refresh_token(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryption;

    #[test]
    fn access_token_id_embeds_the_session() {
        assert_eq!(access_token_id("V2_s1", "at_a1"), "V2_s1-at_a1");
    }

    #[test]
    fn token_refs_resolve_both_kinds() {
        assert_eq!(
            token_ref_from_token("V2_s1-at_a1").unwrap(),
            TokenRef::Access {
                oidc_session_id: "V2_s1".into(),
                access_token_id: "at_a1".into(),
            }
        );
        let refresh = token_ref_from_token("V2_s1-rt_r1").unwrap();
        assert_eq!(refresh.oidc_session_id(), "V2_s1");
        assert!(matches!(refresh, TokenRef::Refresh { .. }));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "V2_s1", "V2_s1-x_1", "a-at_1-b", "-at_1"] {
            assert!(token_ref_from_token(token).is_err(), "{token}");
        }
    }

    #[test]
    fn refresh_token_parse_drops_the_subject() {
        let (session, id) = parse_refresh_token("V2_s1-rt_r1:u1").unwrap();
        assert_eq!(session, "V2_s1");
        assert_eq!(id, "rt_r1");
        assert_eq!(
            parse_refresh_token("V2_s1-at_r1:u1"),
            Err(DomainError::RefreshTokenInvalid)
        );
    }

    #[test]
    fn refresh_token_round_trips_through_encryption() {
        let aes = AesGcmEncryption::new("k1", &[3u8; 32]).unwrap();
        let user = UserId::parse("u1").unwrap();
        let token = encode_refresh_token(&aes, "V2_s1", "rt_r1", &user).unwrap();
        assert!(!token.contains('='));
        let (session, id) = decode_refresh_token(&aes, &token).unwrap();
        assert_eq!((session.as_str(), id.as_str()), ("V2_s1", "rt_r1"));
    }

    #[test]
    fn undecodable_refresh_tokens_fail() {
        let aes = AesGcmEncryption::new("k1", &[3u8; 32]).unwrap();
        assert!(matches!(
            decode_refresh_token(&aes, "***"),
            Err(DomainError::InvalidArgument(_))
        ));
        assert_eq!(
            decode_refresh_token(&aes, "AAAAAAAAAAAAAAAAAAAAAAAA"),
            Err(DomainError::RefreshTokenInvalid)
        );
    }
}
