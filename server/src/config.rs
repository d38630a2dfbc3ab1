//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RELAYCTL_NAMESPACE`, `RELAYCTL_PATH`,
//!    `RELAYCTL_SAS_KEY_NAME`, `RELAYCTL_SAS_KEY`, `RELAYCTL_STATE_FILE`
//! 2. **Config file**: path via `--config <path>`, or `relayctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! namespace = "contoso.servicebus.windows.net"
//! hybrid_connection_path = "machines"
//! sas_key_name = "RootManageSharedAccessKey"
//! sas_key = "base64-key-from-the-portal"
//!
//! [state]
//! path = "machine-state.json"
//!
//! [listener]
//! token_validity_secs = 3600
//! token_renew_margin_secs = 300
//! shutdown_grace_secs = 5
//!
//! [forwarder]
//! token_validity_secs = 3600
//! request_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```
//!
//! All four `[relay]` fields are mandatory. They have no defaults; a blank
//! value is reported by [`RelayConfig::validate`] and is fatal at startup.

use serde::Deserialize;
use std::path::Path;

/// Config file looked up in the current directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "relayctl.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hybrid connection coordinates and shared access credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Relay namespace host, e.g. `contoso.servicebus.windows.net`.
    /// An `sb://` or `https://` prefix is tolerated and stripped.
    #[serde(default)]
    pub namespace: String,
    /// Hybrid connection name (the channel path).
    #[serde(default)]
    pub hybrid_connection_path: String,
    /// Shared access policy name.
    #[serde(default)]
    pub sas_key_name: String,
    /// Shared access policy key.
    #[serde(default)]
    pub sas_key: String,
}

/// Machine state persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Backing JSON file (default `machine-state.json`). Override with `RELAYCTL_STATE_FILE`.
    #[serde(default = "default_state_path")]
    pub path: String,
}

/// Listener-side relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Validity of the listener's own SAS token in seconds (default 3600).
    #[serde(default = "default_token_validity")]
    pub token_validity_secs: u64,
    /// Renew the token this many seconds before it expires (default 300).
    #[serde(default = "default_token_renew_margin")]
    pub token_renew_margin_secs: u64,
    /// Seconds after shutdown before a warning about still-running requests (default 5).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Caller-side forwarding settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Validity of each per-request SAS token in seconds (default 3600).
    #[serde(default = "default_token_validity")]
    pub token_validity_secs: u64,
    /// Whole-request timeout in seconds (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_state_path() -> String {
    "machine-state.json".to_string()
}
fn default_token_validity() -> u64 {
    3600
}
fn default_token_renew_margin() -> u64 {
    300
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            token_validity_secs: default_token_validity(),
            token_renew_margin_secs: default_token_renew_margin(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            token_validity_secs: default_token_validity(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Fatal configuration faults. The process must not proceed past any of these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("relay.{0} is required")]
    Missing(&'static str),
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),
}

impl RelayConfig {
    /// Reject blank mandatory fields, naming the first one found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("namespace", &self.namespace),
            ("hybrid_connection_path", &self.hybrid_connection_path),
            ("sas_key_name", &self.sas_key_name),
            ("sas_key", &self.sas_key),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `relayctl.toml` in
    /// the current directory is used when present. The relay section is
    /// validated before returning.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.relay.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Env var overrides, read through `lookup` so tests need not touch the process env.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RELAYCTL_NAMESPACE") {
            self.relay.namespace = v;
        }
        if let Some(v) = lookup("RELAYCTL_PATH") {
            self.relay.hybrid_connection_path = v;
        }
        if let Some(v) = lookup("RELAYCTL_SAS_KEY_NAME") {
            self.relay.sas_key_name = v;
        }
        if let Some(v) = lookup("RELAYCTL_SAS_KEY") {
            self.relay.sas_key = v;
        }
        if let Some(v) = lookup("RELAYCTL_STATE_FILE") {
            self.state.path = v;
        }
    }
}
