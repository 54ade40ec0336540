use async_trait::async_trait;
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tweetstream_core::{Credential, CredentialError};

type HmacSha256 = Hmac<sha2::Sha256>;

/// Name of the cookie holding the signed session.
pub const SESSION_COOKIE: &str = "tweet-stream";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session cookie")]
    MissingCookie,
    #[error("malformed session cookie: {0}")]
    Malformed(&'static str),
    #[error("session cookie signature mismatch")]
    BadSignature,
    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] CredentialError),
}

/// Resolves the caller's upstream credential from request headers.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Credential, AuthError>;
}

#[derive(Serialize, Deserialize)]
struct CookiePayload {
    access_token: String,
    access_secret: String,
    #[serde(default)]
    user_id: Option<String>,
}

/// Reads the credential from an HMAC-signed session cookie.
///
/// Cookie value: `base64url(json payload) "." base64url(HMAC-SHA256)`.
pub struct SignedCookieResolver {
    secret: SecretString,
}

impl SignedCookieResolver {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts any key length"),
        }
    }

    /// Produce a cookie value for a credential. Used by the login
    /// collaborator once the token exchange completes.
    pub fn issue(&self, credential: &Credential) -> String {
        let payload = CookiePayload {
            access_token: credential.access_token().to_string(),
            access_secret: credential.access_secret().to_string(),
            user_id: credential.user_id().map(String::from),
        };
        // Plain strings always serialize
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&json);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        )
    }

    /// Check the signature and decode the credential.
    pub fn verify(&self, value: &str) -> Result<Credential, AuthError> {
        let (payload_b64, sig_b64) = value
            .split_once('.')
            .ok_or(AuthError::Malformed("missing signature"))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed("payload is not base64url"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AuthError::Malformed("signature is not base64url"))?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload: CookiePayload = serde_json::from_slice(&payload)
            .map_err(|_| AuthError::Malformed("payload is not valid JSON"))?;
        let credential = Credential::new(payload.access_token, payload.access_secret)?;
        Ok(match payload.user_id {
            Some(user_id) => credential.with_user_id(user_id),
            None => credential,
        })
    }
}

#[async_trait]
impl CredentialResolver for SignedCookieResolver {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Credential, AuthError> {
        let value = cookie_value(headers, SESSION_COOKIE).ok_or(AuthError::MissingCookie)?;
        self.verify(value)
    }
}

/// Always resolves to the same credential, or always fails when built
/// with `None`. For tests and local development.
pub struct StaticResolver {
    credential: Option<Credential>,
}

impl StaticResolver {
    pub fn new(credential: Option<Credential>) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self, _headers: &HeaderMap) -> Result<Credential, AuthError> {
        self.credential.clone().ok_or(AuthError::MissingCookie)
    }
}

/// Find a cookie by name across all `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

/// `Set-Cookie` value that clears the session cookie.
pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}
