//! Shared access signature (SAS) tokens for the relay.
//!
//! A token authorizes one holder to listen on, or send into, a single hybrid
//! connection until its expiry. The string has the form
//!
//! ```text
//! SharedAccessSignature sr=<audience>&sig=<signature>&se=<expiry>&skn=<key name>
//! ```
//!
//! where `audience` is the url-encoded, normalized resource URI and
//! `signature` is the url-encoded base64 of
//! `HMAC-SHA256(key, audience + "\n" + expiry)`.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the token on requests sent into the relay.
pub const AUTHORIZATION_HEADER: &str = "ServiceBusAuthorization";

const TOKEN_PREFIX: &str = "SharedAccessSignature";

/// A signed token plus its expiry in unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("shared access key rejected by HMAC: {0}")]
    InvalidKey(String),
    #[error("system clock is before the unix epoch")]
    Clock,
}

/// Issues SAS tokens from a shared access policy (key name + key).
#[derive(Clone)]
pub struct TokenProvider {
    key_name: String,
    key: String,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TokenProvider {
    pub fn new(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Issue a token for `resource` valid for `validity` from now.
    pub fn get_token(&self, resource: &str, validity: Duration) -> Result<AccessToken, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TokenError::Clock)?;
        self.sign(resource, now.as_secs() + validity.as_secs())
    }

    fn sign(&self, resource: &str, expires_at: u64) -> Result<AccessToken, TokenError> {
        let audience = urlencoding::encode(&normalize_audience(resource)).into_owned();
        let string_to_sign = format!("{audience}\n{expires_at}");

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let token = format!(
            "{TOKEN_PREFIX} sr={audience}&sig={}&se={expires_at}&skn={}",
            urlencoding::encode(&signature),
            self.key_name
        );
        Ok(AccessToken { token, expires_at })
    }
}

/// Normalize a resource URI into the audience the relay signs against:
/// scheme forced to `http`, lowercased, query dropped, trailing `/` ensured.
pub fn normalize_audience(resource: &str) -> String {
    let rest = resource
        .split_once("://")
        .map_or(resource, |(_, rest)| rest);
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let mut audience = format!("http://{}", rest.to_ascii_lowercase());
    if !audience.ends_with('/') {
        audience.push('/');
    }
    audience
}
