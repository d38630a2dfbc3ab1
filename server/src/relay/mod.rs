//! Azure Relay hybrid connection plumbing.
//!
//! - [`listener`]: holds the control channel open near the machines and serves
//!   relayed HTTP requests against the [`MachineStore`](crate::machines::MachineStore).
//! - [`forwarder`]: caller side, sends one request into the relay per call.
//! - [`token`]: SAS token issuing shared by both.
//! - [`protocol`]: control channel message shapes.
//!
//! Both sides share one [`RelayConnection`], built once at startup from the
//! validated `[relay]` config and passed around by `Arc`.

pub mod forwarder;
pub mod listener;
pub mod protocol;
pub mod token;

use std::time::Duration;

use crate::config::{ConfigError, RelayConfig};
use crate::machines::MachineRoute;
use token::{AccessToken, TokenError, TokenProvider};

/// Immutable relay coordinates plus the token-issuing capability.
#[derive(Debug, Clone)]
pub struct RelayConnection {
    /// Public endpoint, e.g. `https://ns.servicebus.windows.net/machines` (no trailing slash).
    base_url: String,
    /// `scheme://host[:port]` part of `base_url`.
    origin: String,
    /// Resource the tokens are scoped to, e.g. `sb://ns.servicebus.windows.net/machines`.
    resource_uri: String,
    /// Hybrid connection name without surrounding slashes.
    channel_path: String,
    tokens: TokenProvider,
}

impl RelayConnection {
    /// Build from the `[relay]` config section. Fails fast on any blank field.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let host = config
            .namespace
            .trim()
            .split_once("://")
            .map_or(config.namespace.trim(), |(_, rest)| rest)
            .trim_end_matches('/');
        let path = config.hybrid_connection_path.trim().trim_matches('/');
        Self::new(
            &format!("https://{host}/{path}"),
            TokenProvider::new(config.sas_key_name.trim(), config.sas_key.trim()),
        )
    }

    /// Build from an explicit public base URL (`http` or `https`).
    ///
    /// `from_config` always produces `https`; plain `http` exists for local
    /// relays and tests.
    pub fn new(base_url: &str, tokens: TokenProvider) -> Result<Self, ConfigError> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidAddress(format!("{base_url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidAddress(format!(
                "{base_url}: scheme must be http or https"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidAddress(format!("{base_url}: missing host")))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let channel_path = url.path().trim_matches('/').to_string();
        if channel_path.is_empty() {
            return Err(ConfigError::Missing("hybrid_connection_path"));
        }

        Ok(Self {
            base_url: format!("{}://{authority}/{channel_path}", url.scheme()),
            origin: format!("{}://{authority}", url.scheme()),
            resource_uri: format!("sb://{authority}/{channel_path}"),
            channel_path,
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    pub fn channel_path(&self) -> &str {
        &self.channel_path
    }

    pub fn key_name(&self) -> &str {
        self.tokens.key_name()
    }

    /// Issue a fresh token scoped to this hybrid connection.
    pub fn issue_token(&self, validity: Duration) -> Result<AccessToken, TokenError> {
        self.tokens.get_token(&self.resource_uri, validity)
    }

    /// Public URL a sender posts to for `route` on `machine`.
    pub fn request_url(&self, route: MachineRoute, machine: &str) -> String {
        format!(
            "{}/{}?machine={}",
            self.base_url,
            route.as_str(),
            urlencoding::encode(machine)
        )
    }

    /// Control channel URL the listener opens.
    pub fn listen_url(&self, token: &AccessToken, listener_id: &str) -> String {
        let ws_origin = self
            .origin
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{ws_origin}/$hc/{}?sb-hc-action=listen&sb-hc-id={listener_id}&sb-hc-token={}",
            self.channel_path,
            urlencoding::encode(&token.token)
        )
    }
}
