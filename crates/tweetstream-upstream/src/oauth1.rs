//! OAuth 1.0a request signing (HMAC-SHA1).
//!
//! Only the signing half of OAuth1 lives here: the token exchange that
//! produces a [`Credential`] happens elsewhere.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::ExposeSecret;
use sha1::Sha1;

use tweetstream_core::{ConsumerKeys, Credential};

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay as-is, everything else is encoded.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}

/// Per-request nonce and timestamp.
#[derive(Clone, Debug)]
pub struct OAuthNonce {
    pub nonce: String,
    pub timestamp: i64,
}

impl OAuthNonce {
    pub fn generate() -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Signs requests on behalf of one user.
pub struct Signer<'a> {
    consumer: &'a ConsumerKeys,
    credential: &'a Credential,
}

impl<'a> Signer<'a> {
    pub fn new(consumer: &'a ConsumerKeys, credential: &'a Credential) -> Self {
        Self {
            consumer,
            credential,
        }
    }

    /// `Authorization` header value for a request.
    ///
    /// `url` must not carry a query string; pass query and form body
    /// parameters through `params` instead.
    pub fn authorization_header(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        nonce: &OAuthNonce,
    ) -> String {
        let timestamp = nonce.timestamp.to_string();
        let mut oauth_params: Vec<(&str, &str)> = vec![
            ("oauth_consumer_key", self.consumer.key.as_str()),
            ("oauth_nonce", nonce.nonce.as_str()),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp.as_str()),
            ("oauth_token", self.credential.access_token()),
            ("oauth_version", "1.0"),
        ];

        let signature = self.signature(method, url, params, &oauth_params);
        oauth_params.push(("oauth_signature", signature.as_str()));
        oauth_params.sort_by(|a, b| a.0.cmp(b.0));

        let fields: Vec<String> = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect();
        format!("OAuth {}", fields.join(", "))
    }

    fn signature(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        oauth_params: &[(&str, &str)],
    ) -> String {
        let base = signature_base(method, url, params.iter().chain(oauth_params.iter()));
        let key = format!(
            "{}&{}",
            encode(self.consumer.secret.expose_secret()),
            encode(self.credential.access_secret())
        );

        // HMAC accepts keys of any length
        let mut mac = match HmacSha1::new_from_slice(key.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts any key length"),
        };
        mac.update(base.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

/// `METHOD&url&params`, with params encoded, sorted, and joined.
fn signature_base<'p>(
    method: &str,
    url: &str,
    params: impl Iterator<Item = &'p (&'p str, &'p str)>,
) -> String {
    let mut encoded: Vec<(String, String)> = params.map(|(k, v)| (encode(k), encode(v))).collect();
    encoded.sort();
    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(url),
        encode(&param_string)
    )
}

/// Form-encode body parameters with the same encoding the signature uses.
pub fn form_body(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
