//! Stateless API keys of the form `<client_id>.<signature>`.
//!
//! The signature is the unpadded base64url encoding of
//! `HMAC-SHA256(secret, client_id)`, so any holder of the secret can
//! verify a key without a lookup table.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Errors returned when issuing or verifying an API key.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The key is not exactly two dot-separated parts.
    #[error("invalid api key format")]
    Malformed,

    /// Client ids must be non-empty and free of `.`.
    #[error("client id {0:?} cannot be encoded in an api key")]
    InvalidClientId(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("secret cannot key an hmac")]
    InvalidSecret,
}

impl AuthError {
    pub fn as_label(&self) -> &'static str {
        match self {
            AuthError::Malformed => "auth_malformed",
            AuthError::InvalidClientId(_) => "auth_invalid_client_id",
            AuthError::InvalidSignature => "auth_invalid_signature",
            AuthError::InvalidSecret => "auth_invalid_secret",
        }
    }
}

fn mac_for(client_id: &str, secret: &[u8]) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidSecret)?;
    mac.update(client_id.as_bytes());
    Ok(mac)
}

/// Issue a key for `client_id` signed with `secret`.
pub fn issue_api_key(client_id: &str, secret: &[u8]) -> Result<String, AuthError> {
    if client_id.is_empty() || client_id.contains('.') {
        return Err(AuthError::InvalidClientId(client_id.to_string()));
    }
    let signature = mac_for(client_id, secret)?.finalize().into_bytes();
    Ok(format!("{}.{}", client_id, URL_SAFE_NO_PAD.encode(signature)))
}

/// Verify `key` against `secret` and return the client id it was issued for.
///
/// The signature comparison is constant-time.
pub fn verify_api_key(key: &str, secret: &[u8]) -> Result<String, AuthError> {
    let mut parts = key.split('.');
    let (client_id, signature) = match (parts.next(), parts.next(), parts.next()) {
        (Some(client_id), Some(signature), None) => (client_id, signature),
        _ => return Err(AuthError::Malformed),
    };

    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::InvalidSignature)?;
    mac_for(client_id, secret)?
        .verify_slice(&provided)
        .map_err(|_| AuthError::InvalidSignature)?;
    Ok(client_id.to_string())
}

/// Resolves an API key to the client id it authenticates.
pub trait KeyVerifier: Send + Sync {
    fn verify(&self, key: &str) -> Result<String, AuthError>;
}

/// [`KeyVerifier`] backed by a shared HMAC secret.
#[derive(Clone)]
pub struct HmacKeyVerifier {
    secret: Vec<u8>,
}

impl HmacKeyVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Issue a key this verifier accepts.
    pub fn issue(&self, client_id: &str) -> Result<String, AuthError> {
        issue_api_key(client_id, &self.secret)
    }
}

impl fmt::Debug for HmacKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacKeyVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KeyVerifier for HmacKeyVerifier {
    fn verify(&self, key: &str) -> Result<String, AuthError> {
        verify_api_key(key, &self.secret)
    }
}

impl<T: KeyVerifier + ?Sized> KeyVerifier for std::sync::Arc<T> {
    fn verify(&self, key: &str) -> Result<String, AuthError> {
        (**self).verify(key)
    }
}
