//! Caller-side forwarding into the relay.
//!
//! [`RelayForwarder`] wraps a pooled `reqwest::Client`. Every call issues a
//! fresh SAS token, posts to `{relay base}/{route}?machine={machine}` with the
//! token in the `ServiceBusAuthorization` header, and returns the listener's
//! raw response body. Parsing the JSON is left to the caller.
//!
//! Nothing is retried. Token and network faults surface as
//! [`ForwardError::Transport`]; a non-2xx status surfaces as
//! [`ForwardError::Request`] with the status and raw body.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::token::{TokenError, AUTHORIZATION_HEADER};
use super::RelayConnection;
use crate::config::ForwarderConfig;
use crate::machines::MachineRoute;

/// Sends machine operations through the relay.
#[derive(Debug, Clone)]
pub struct RelayForwarder {
    http: reqwest::Client,
    connection: Arc<RelayConnection>,
    token_validity: Duration,
}

impl RelayForwarder {
    pub fn new(
        connection: Arc<RelayConnection>,
        config: &ForwarderConfig,
    ) -> Result<Self, ForwardError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ForwardError::Transport(TransportError::Http(e)))?;
        Ok(Self {
            http,
            connection,
            token_validity: Duration::from_secs(config.token_validity_secs),
        })
    }

    pub fn connection(&self) -> &RelayConnection {
        &self.connection
    }

    /// Forward `route` for `machine` and return the raw response body.
    pub async fn send(&self, route: MachineRoute, machine: &str) -> Result<String, ForwardError> {
        if machine.trim().is_empty() {
            return Err(ForwardError::InvalidMachine);
        }

        let token = self
            .connection
            .issue_token(self.token_validity)
            .map_err(TransportError::Token)?;
        let url = self.connection.request_url(route, machine);
        debug!(route = %route, machine, "Forwarding request through relay");

        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION_HEADER, token.token)
            .send()
            .await
            .map_err(TransportError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(TransportError::Http)?;

        if status.is_success() {
            Ok(body)
        } else {
            warn!(route = %route, machine, status = status.as_u16(), "Relay returned an error");
            Err(ForwardError::Request {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Faults below the HTTP status line.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("token issuance failed: {0}")]
    Token(#[source] TokenError),
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),
}

/// Errors returned by [`RelayForwarder::send`].
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("machine name must not be blank")]
    InvalidMachine,
    #[error("Failed to send request to relay: {0}")]
    Transport(#[from] TransportError),
    #[error("Relay error: {status} - {body}")]
    Request { status: u16, body: String },
}

impl ForwardError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
