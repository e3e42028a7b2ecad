//! Authentication of connecting clients.
//!
//! A client presents a session token when it opens a connection; an
//! [`Authenticator`] turns it into a verified [`Identity`] or refuses it.
//!
//! ## Signed token format
//!
//! ```text
//! base64url(claims json) "." base64url(HMAC-SHA256(secret, first part))
//! ```
//!
//! The claims carry the user id, display name and expiry (Unix seconds).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// A verified user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Why a credential was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Unknown token")]
    UnknownToken,
}

/// Verifies session tokens
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    uid: String,
    name: String,
    exp: u64,
}

/// Issues and verifies HMAC-SHA256 signed tokens
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenSigner {
    /// Create a signer with a 24 hour token lifetime
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a token for a user
    pub fn issue(&self, user_id: &str, display_name: &str) -> String {
        self.issue_at(user_id, display_name, unix_now())
    }

    fn issue_at(&self, user_id: &str, display_name: &str, now: u64) -> String {
        let claims = Claims {
            uid: user_id.to_string(),
            name: display_name.to_string(),
            exp: now + self.ttl.as_secs(),
        };
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes()).finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }

    /// Verify a token against the current time
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<Identity, AuthError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("missing signature".into()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        self.mac(payload.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if now > claims.exp {
            return Err(AuthError::Expired);
        }

        Ok(Identity {
            user_id: claims.uid,
            display_name: claims.name,
        })
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac
    }
}

impl Authenticator for TokenSigner {
    fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.verify(credential)
    }
}

/// Fixed token table, typically loaded from the config file
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<(String, Identity)> for StaticTokens {
    fn from_iter<I: IntoIterator<Item = (String, Identity)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}

/// Development only: the credential is taken as the user name
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnonymous;

impl Authenticator for AllowAnonymous {
    fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        Ok(Identity::new(credential, credential))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
