// src/auth.rs
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinError;

const SCHEME: &str = "pbkdf2-sha256";
pub const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Unsalted SHA-256 hex digest. Deterministic; only kept so records written
/// in this format keep verifying. New records go through [`derive`].
pub fn hash(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Salted PBKDF2 digest encoded as `pbkdf2-sha256$<rounds>$<salt>$<key>`.
pub fn derive(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    derive_with(password, &salt, PBKDF2_ROUNDS)
}

fn derive_with(password: &str, salt: &[u8], rounds: u32) -> String {
    let key = pbkdf2_key(password, salt, rounds);
    format!(
        "{}${}${}${}",
        SCHEME,
        rounds,
        hex::encode(salt),
        hex::encode(key)
    )
}

fn pbkdf2_key(password: &str, salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut key);
    key
}

/// Checks a raw password against a stored digest in either format.
pub fn verify(password: &str, stored: &str) -> bool {
    if let Some(encoded) = stored.strip_prefix(SCHEME) {
        let parts: Vec<&str> = encoded.split('$').collect();
        // leading "" comes from the separator after the scheme
        let (rounds, salt, key) = match parts.as_slice() {
            ["", rounds, salt, key] => (rounds, salt, key),
            _ => return false,
        };
        let (Ok(rounds), Ok(salt), Ok(key)) =
            (rounds.parse::<u32>(), hex::decode(salt), hex::decode(key))
        else {
            return false;
        };
        if rounds == 0 || key.len() != KEY_LEN {
            return false;
        }
        return pbkdf2_key(password, &salt, rounds)[..] == key[..];
    }

    is_legacy_digest(stored) && hash(password) == stored.to_ascii_lowercase()
}

/// Runs [`derive`] on the blocking pool.
pub async fn derive_blocking(password: &str) -> Result<String, JoinError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || derive(&password)).await
}

pub async fn verify_blocking(password: &str, stored: &str) -> Result<bool, JoinError> {
    let password = password.to_string();
    let stored = stored.to_string();
    tokio::task::spawn_blocking(move || verify(&password, &stored)).await
}

fn is_legacy_digest(stored: &str) -> bool {
    stored.len() == 64 && stored.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub sid: String,
    pub exp: usize,
}

// Function to create a JWT token
pub fn create_token(
    username: &str,
    session_id: &str,
    secret: &str,
    expires_at: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: username.to_string(),
        sid: session_id.to_string(),
        exp: expires_at.max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}

/// Unix timestamp `ttl_secs` from now.
pub fn expiry(ttl_secs: i64) -> i64 {
    Utc::now().timestamp() + ttl_secs
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

/// Random hex identifier for server-side sessions and fallback secrets.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_hex() {
        let digest = hash("hunter2");
        assert_eq!(digest, hash("hunter2"));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(digest, hash("hunter3"));
    }

    #[test]
    fn hash_matches_known_sha256() {
        assert_eq!(
            hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn derive_uses_fresh_salt() {
        let a = derive_with("pw", b"salt-one", 1_000);
        let b = derive_with("pw", b"salt-two", 1_000);
        assert_ne!(a, b);
        assert!(a.starts_with("pbkdf2-sha256$1000$"));
        assert!(verify("pw", &a));
        assert!(verify("pw", &b));
        assert!(!verify("other", &a));
    }

    #[test]
    fn derived_digest_verifies() {
        let stored = derive("correct horse");
        assert!(verify("correct horse", &stored));
        assert!(!verify("correct horse battery", &stored));
    }

    #[test]
    fn legacy_digest_verifies() {
        let stored = hash("pw");
        assert!(verify("pw", &stored));
        assert!(verify("pw", &stored.to_uppercase()));
        assert!(!verify("wrong", &stored));
    }

    #[test]
    fn malformed_digests_never_verify() {
        assert!(!verify("pw", ""));
        assert!(!verify("pw", "pw"));
        assert!(!verify("pw", "pbkdf2-sha256$abc$00$00"));
        assert!(!verify("pw", "pbkdf2-sha256$0$00$00"));
        assert!(!verify("pw", "pbkdf2-sha256$1000$zz$00"));
        assert!(!verify("pw", "pbkdf2-sha256$1000$00"));
    }

    #[tokio::test]
    async fn blocking_helpers_match_inline_versions() {
        let stored = derive_blocking("pw").await.unwrap();
        assert!(verify("pw", &stored));
        assert!(verify_blocking("pw", &stored).await.unwrap());
        assert!(!verify_blocking("nope", &stored).await.unwrap());
    }

    #[test]
    fn token_round_trip() {
        let token = create_token("alice", "sid-1", "secret", expiry(60)).unwrap();
        let claims = decode_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.sid, "sid-1");
    }

    #[test]
    fn token_rejected_with_wrong_secret() {
        let token = create_token("alice", "sid-1", "secret", expiry(60)).unwrap();
        assert!(decode_token(&token, "other-secret").is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let token = create_token("alice", "sid-1", "secret", expiry(-3600)).unwrap();
        assert!(decode_token(&token, "secret").is_err());
    }
}
