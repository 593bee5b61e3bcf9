//! Signed bearer tokens for the agent channel.
//!
//! Tokens are HS256 JWTs carrying the agent identifier as subject. The signing
//! key is derived from the configured shared secret, so rotating the secret
//! invalidates every outstanding token at once.

use std::fmt;
use std::time::Duration;

use hkdf::Hkdf;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AuthError;

/// HKDF info string binding derived keys to agent channel tokens
const TOKEN_KEY_CONTEXT: &[u8] = b"runway-agent-channel-token";

/// Claims embedded in an agent access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentClaims {
    /// Agent identifier
    pub sub: String,
    /// Issued-at (Unix timestamp)
    pub iat: u64,
    /// Expiry (Unix timestamp)
    pub exp: u64,
}

/// Verification strategy used by the channel authorizer.
///
/// The authorizer only depends on this trait, so per-agent or revocable
/// credentials can replace the shared-secret scheme without touching it.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<AgentClaims, AuthError>;
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies agent access tokens from a single shared secret.
pub struct TokenManager {
    keys: Option<SigningKeys>,
    ttl: Duration,
    validation: Validation,
}

impl TokenManager {
    /// Create a manager for `secret`. An empty secret is accepted here and
    /// reported by [`TokenManager::sign`] instead.
    pub fn new(secret: &str, ttl: Duration) -> Self {
        let keys = (!secret.is_empty()).then(|| {
            let key = derive_signing_key(secret);
            SigningKeys {
                encoding: EncodingKey::from_secret(&key),
                decoding: DecodingKey::from_secret(&key),
            }
        });

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            keys,
            ttl,
            validation,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token for `subject`, valid for the configured lifetime.
    pub fn sign(&self, subject: &str) -> Result<String, AuthError> {
        let keys = self.keys()?;
        let iat = jsonwebtoken::get_current_timestamp();
        let claims = AgentClaims {
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(self.ttl.as_secs()),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| AuthError::Configuration(e.to_string()))
    }

    fn keys(&self) -> Result<&SigningKeys, AuthError> {
        self.keys
            .as_ref()
            .ok_or_else(|| AuthError::Configuration("empty token secret".to_string()))
    }
}

impl TokenVerifier for TokenManager {
    fn verify(&self, token: &str) -> Result<AgentClaims, AuthError> {
        let keys = self.keys()?;
        jsonwebtoken::decode::<AgentClaims>(token, &keys.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("configured", &self.keys.is_some())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Derive a 32-byte HMAC key from an arbitrary-length secret using HKDF
fn derive_signing_key(secret: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(TOKEN_KEY_CONTEXT, &mut key)
        .expect("32 bytes is a valid length for HKDF-SHA256");
    key
}
