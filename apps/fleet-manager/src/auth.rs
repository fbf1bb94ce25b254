//! Operator accounts and bearer tokens.
//!
//! Accounts live in memory for the lifetime of the process. Tokens are HS256
//! JWTs whose subject is the username; the capability to drive the main
//! instance is derived from configuration on every request, never from the
//! token itself.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub secret: Vec<u8>,
    pub token_ttl: Duration,
    pub main_operators: Vec<String>,
}

impl AuthConfig {
    /// A random signing secret; tokens do not survive a restart.
    pub fn random_secret() -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("username {0:?} is already taken")]
    UserExists(String),
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub can_control_main: bool,
}

#[derive(Clone)]
pub struct AuthContext {
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: Duration,
    operators: Arc<HashSet<String>>,
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl AuthContext {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(&config.secret),
            decoding: DecodingKey::from_secret(&config.secret),
            token_ttl: config.token_ttl,
            operators: Arc::new(config.main_operators.into_iter().collect()),
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        validate_username(username)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let hash = hash_password(password)?;
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        users.insert(username.to_string(), hash);
        info!(username, "registered user");
        Ok(())
    }

    /// Verifies credentials and issues a token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let hash = self
            .users
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(password, &hash) {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue_token(username)
    }

    pub fn issue_token(&self, username: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Resolves a bearer token to the identity of a still-registered user.
    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;
        if !self.users.read().await.contains_key(&claims.sub) {
            return Err(AuthError::UnknownUser(claims.sub));
        }
        Ok(self.identity(&claims.sub))
    }

    pub fn identity(&self, username: &str) -> Identity {
        Identity {
            username: username.to_string(),
            can_control_main: self.operators.contains(username),
        }
    }
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidUsername(username.to_string()))
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(operators: &[&str]) -> AuthContext {
        AuthContext::new(AuthConfig {
            secret: b"test-secret".to_vec(),
            token_ttl: Duration::from_secs(3600),
            main_operators: operators.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn register_login_verify() {
        let auth = context(&["alice"]);
        auth.register("alice", "correct horse").await.unwrap();
        auth.register("bob", "battery staple").await.unwrap();

        let token = auth.login("alice", "correct horse").await.unwrap();
        assert_eq!(
            auth.verify(&token).await.unwrap(),
            Identity {
                username: "alice".into(),
                can_control_main: true
            }
        );

        let token = auth.login("bob", "battery staple").await.unwrap();
        assert!(!auth.verify(&token).await.unwrap().can_control_main);
    }

    #[tokio::test]
    async fn rejects_bad_credentials_and_duplicates() {
        let auth = context(&[]);
        auth.register("alice", "correct horse").await.unwrap();
        assert!(matches!(
            auth.register("alice", "another one").await,
            Err(AuthError::UserExists(_))
        ));
        assert!(matches!(
            auth.login("alice", "wrong password").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("mallory", "correct horse").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.register("bad name", "correct horse").await,
            Err(AuthError::InvalidUsername(_))
        ));
        assert!(matches!(
            auth.register("carol", "short").await,
            Err(AuthError::WeakPassword)
        ));
    }

    #[tokio::test]
    async fn tokens_from_another_secret_or_unknown_users_fail() {
        let auth = context(&[]);
        let other = AuthContext::new(AuthConfig {
            secret: b"other-secret".to_vec(),
            token_ttl: Duration::from_secs(3600),
            main_operators: Vec::new(),
        });
        auth.register("alice", "correct horse").await.unwrap();
        other.register("alice", "correct horse").await.unwrap();

        let foreign = other.login("alice", "correct horse").await.unwrap();
        assert!(matches!(auth.verify(&foreign).await, Err(AuthError::Jwt(_))));

        let ghost = auth.issue_token("ghost").unwrap();
        assert!(matches!(
            auth.verify(&ghost).await,
            Err(AuthError::UnknownUser(_))
        ));
    }

    #[tokio::test]
    async fn expired_tokens_fail() {
        let auth = context(&[]);
        auth.register("alice", "correct horse").await.unwrap();
        let claims = Claims {
            sub: "alice".into(),
            iat: 1,
            exp: 2,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &auth.encoding).unwrap();
        assert!(matches!(auth.verify(&token).await, Err(AuthError::Jwt(_))));
    }
}
