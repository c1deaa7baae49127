//! Identity verification for incoming connections and API requests.
//!
//! Tokens are issued by the external identity service as
//! `base64url(claims).base64url(signature)`, where `claims` is the JSON
//! object `{"sub": "<userId>", "exp": <ms since epoch>}` and `signature` is
//! the issuer's Ed25519 signature over the raw claims bytes.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parley_proto::message::{Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Errors returned when a token is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The token does not have the `claims.signature` shape.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// The signature does not match the claims.
    #[error("invalid token signature")]
    BadSignature,
    /// The token expired.
    #[error("token expired")]
    Expired,
    /// The token is not known to a static verifier.
    #[error("unknown token")]
    UnknownToken,
    /// The configured issuer key is unusable.
    #[error("invalid issuer key: {0}")]
    InvalidKey(String),
}

/// Maps an identity token to the user it was issued for.
pub trait IdentityVerifier: Send + Sync {
    /// Verifies `token` and returns its user.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] describing why the token was rejected.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Claims carried by a signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User the token was issued for.
    pub sub: UserId,
    /// Expiry, in milliseconds since the UNIX epoch.
    pub exp: Timestamp,
}

/// Verifies tokens signed by the identity service's Ed25519 key.
#[derive(Debug, Clone)]
pub struct SignedTokenVerifier {
    issuer: VerifyingKey,
}

impl SignedTokenVerifier {
    /// Creates a verifier for the given issuer key.
    #[must_use]
    pub const fn new(issuer: VerifyingKey) -> Self {
        Self { issuer }
    }

    /// Creates a verifier from a standard base64 encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKey`] if the key cannot be decoded.
    pub fn from_base64(public_key: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|e| AuthError::InvalidKey(format!("invalid base64: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            AuthError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }
}

impl IdentityVerifier for SignedTokenVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let (claims_b64, sig_b64) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("missing signature part".into()))?;

        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| AuthError::Malformed(format!("signature: {e}")))?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| AuthError::BadSignature)?;

        self.issuer
            .verify_strict(&claims_bytes, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: TokenClaims = serde_json::from_slice(&claims_bytes)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;
        if claims.sub.is_blank() {
            return Err(AuthError::Malformed("empty subject".into()));
        }
        if claims.exp <= Timestamp::now() {
            return Err(AuthError::Expired);
        }
        Ok(claims.sub)
    }
}

/// Fixed token table for local development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenVerifier {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for `user`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), UserId::new(user));
        self
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(token.trim())
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}

/// Issues signed tokens. The identity service owns the real signing key;
/// this is used by tests and local tooling.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    key: SigningKey,
}

impl TokenIssuer {
    /// Creates an issuer from a 32-byte secret seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Public half of the signing key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key as standard base64, the format of `[auth] issuer_public_key`.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().as_bytes())
    }

    /// Signs a token for `user` that expires at `exp`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Malformed`] if the claims cannot be serialized.
    pub fn issue(&self, user: &UserId, exp: Timestamp) -> Result<String, AuthError> {
        let claims = TokenClaims {
            sub: user.clone(),
            exp,
        };
        let bytes =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signature = self.key.sign(&bytes);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&bytes),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}
