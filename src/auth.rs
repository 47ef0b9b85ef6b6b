//! Proxy authentication
//!
//! Parses `Proxy-Authorization: Basic ...` credentials and checks them
//! against a [`CredentialStore`]. Users are looked up on every request so
//! that deactivating a user takes effect immediately.

use anyhow::Result;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Account status as stored by the credential backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("active") {
            UserStatus::Active
        } else {
            UserStatus::Inactive
        }
    }
}

/// A user row as returned by the credential backend
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub status: UserStatus,
    /// 0 disables the per-user limit
    pub max_connections: u32,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub status: UserStatus,
    pub max_connections: u32,
}

/// Lookup of proxy users by name
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Return the user only if it exists and is active
    async fn find_active_user(&self, username: &str) -> Result<Option<UserRecord>>;
}

/// Why a request could not be authenticated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed proxy credentials")]
    MissingOrMalformedCredentials,

    /// Unknown user, inactive user and wrong password all map here
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The backend could not be queried; the client still only sees a 407
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Credentials decoded from a `Basic` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Decode a `Basic <base64(user:pass)>` header value
pub fn parse_basic(header: Option<&str>) -> Result<BasicCredentials, AuthError> {
    let header = header.ok_or(AuthError::MissingOrMalformedCredentials)?;

    let mut parts = header.split_whitespace();
    let (scheme, encoded) = match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(encoded), None) => (scheme, encoded),
        _ => return Err(AuthError::MissingOrMalformedCredentials),
    };

    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::MissingOrMalformedCredentials);
    }

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::MissingOrMalformedCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MissingOrMalformedCredentials)?;

    // Passwords may contain ':'; usernames may not
    let (username, password) = decoded
        .split_once(':')
        .ok_or(AuthError::MissingOrMalformedCredentials)?;

    if username.is_empty() || password.is_empty() {
        return Err(AuthError::MissingOrMalformedCredentials);
    }

    Ok(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Hash a password into an argon2 PHC string
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Verify a password against a PHC string; unparseable hashes never verify
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// Unknown users are checked against this so timing does not reveal existence
static DUMMY_HASH: Lazy<String> =
    Lazy::new(|| hash_password("authproxy-timing-equalizer").unwrap_or_default());

/// Validates proxy credentials against the store
#[derive(Clone)]
pub struct AuthValidator {
    store: Arc<dyn CredentialStore>,
}

impl AuthValidator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Authenticate a `Proxy-Authorization` header value
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Principal, AuthError> {
        let credentials = parse_basic(header)?;

        let user = match self.store.find_active_user(&credentials.username).await {
            Ok(user) => user,
            Err(e) => {
                error!("Credential lookup failed: {:#}", e);
                return Err(AuthError::StoreUnavailable(e.to_string()));
            }
        };

        let hash = match &user {
            Some(user) if user.status == UserStatus::Active => user.password_hash.clone(),
            _ => DUMMY_HASH.clone(),
        };

        let password = credentials.password;
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .unwrap_or(false);

        match user {
            Some(user) if verified && user.status == UserStatus::Active => Ok(Principal {
                username: user.username,
                status: user.status,
                max_connections: user.max_connections,
            }),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemoryStore {
        users: Mutex<HashMap<String, UserRecord>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn find_active_user(&self, username: &str) -> Result<Option<UserRecord>> {
            Ok(self
                .users
                .lock()
                .get(username)
                .filter(|u| u.status == UserStatus::Active)
                .cloned())
        }
    }

    fn basic(user_pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(user_pass))
    }

    fn validator(users: Vec<(&str, &str, UserStatus)>) -> AuthValidator {
        let users = users
            .into_iter()
            .map(|(name, password, status)| {
                (
                    name.to_string(),
                    UserRecord {
                        username: name.to_string(),
                        password_hash: hash_password(password).unwrap(),
                        status,
                        max_connections: 5,
                    },
                )
            })
            .collect();
        AuthValidator::new(Arc::new(MemoryStore {
            users: Mutex::new(users),
        }))
    }

    #[test]
    fn test_parse_basic_shapes() {
        assert_eq!(
            parse_basic(Some(&basic("alice:s3cret:with:colons"))).unwrap(),
            BasicCredentials {
                username: "alice".to_string(),
                password: "s3cret:with:colons".to_string(),
            }
        );

        for bad in [
            None,
            Some("Bearer abc"),
            Some("Basic"),
            Some("Basic !!!notbase64"),
            Some("Basic a b"),
        ] {
            assert_eq!(parse_basic(bad), Err(AuthError::MissingOrMalformedCredentials));
        }

        let no_colon = basic("alice");
        let empty_password = basic("alice:");
        assert!(parse_basic(Some(&no_colon)).is_err());
        assert!(parse_basic(Some(&empty_password)).is_err());
    }

    #[test]
    fn test_hash_roundtrip_and_garbage_hash() {
        let hash = hash_password("pw").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("pw", &hash));
        assert!(!verify_password("other", &hash));
        assert!(!verify_password("pw", "$2b$10$notargon"));
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let v = validator(vec![("alice", "pw", UserStatus::Active)]);
        let principal = v.authenticate(Some(&basic("alice:pw"))).await.unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.max_connections, 5);
    }

    #[tokio::test]
    async fn test_same_error_for_unknown_user_and_wrong_password() {
        let v = validator(vec![
            ("alice", "pw", UserStatus::Active),
            ("bob", "pw", UserStatus::Inactive),
        ]);

        let wrong_pw = v.authenticate(Some(&basic("alice:nope"))).await.unwrap_err();
        let unknown = v.authenticate(Some(&basic("mallory:pw"))).await.unwrap_err();
        let inactive = v.authenticate(Some(&basic("bob:pw"))).await.unwrap_err();

        assert_eq!(wrong_pw, AuthError::InvalidCredentials);
        assert_eq!(unknown, wrong_pw);
        assert_eq!(inactive, wrong_pw);
    }

    #[tokio::test]
    async fn test_missing_header() {
        let v = validator(vec![]);
        assert_eq!(
            v.authenticate(None).await.unwrap_err(),
            AuthError::MissingOrMalformedCredentials
        );
    }
}
