//! Relay listener: the control channel held open next to the machines.
//!
//! [`RelayListener::run`] opens one WebSocket to the relay's `$hc` endpoint
//! and serves relayed requests until the [`CancellationToken`] fires or the
//! relay closes the channel. Each request is dispatched in its own task, so a
//! slow or panicking handler never blocks the read loop; a panic becomes a
//! 500 response. Requests too large for the control channel are served over
//! their rendezvous address. WebSocket rendezvous offers are declined.
//!
//! There is no reconnect: when the channel drops, `run` returns and the
//! process decides what to do.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::protocol::{
    reject_url, ControlMessage, ListenerMessage, RelayedRequest, RelayedResponse, RenewToken,
};
use super::token::TokenError;
use super::RelayConnection;
use crate::config::ListenerConfig;
use crate::machines::routes::{self, RouteError, RouteOutcome, RouteResponse};
use crate::machines::MachineStore;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsReader = futures_util::stream::SplitStream<WsStream>;
/// Shared write half. Held across a response's header and body frames so
/// they stay adjacent on the wire.
type WsSink = Arc<Mutex<futures_util::stream::SplitSink<WsStream, Message>>>;

/// Listener lifecycle, observable through [`RelayListener::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Opening,
    Listening,
    Closing,
    Closed,
}

impl ListenerState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Listening => "listening",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to issue listener token: {0}")]
    Token(#[from] TokenError),
    #[error("failed to open relay control channel: {0}")]
    Connect(#[source] Box<tungstenite::Error>),
    #[error("relay control channel failed: {0}")]
    Channel(#[source] Box<tungstenite::Error>),
}

/// Serves relayed machine requests from one hybrid connection.
pub struct RelayListener {
    connection: Arc<RelayConnection>,
    store: Arc<MachineStore>,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl RelayListener {
    pub fn new(
        connection: Arc<RelayConnection>,
        store: Arc<MachineStore>,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Created);
        Self {
            connection,
            store,
            config,
            state,
        }
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ListenerState) {
        debug!(state = state.as_str(), "Listener state");
        self.state.send_replace(state);
    }

    /// Open the control channel and serve until cancelled or closed by the relay.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ListenerError> {
        self.set_state(ListenerState::Opening);
        let result = self.open_and_serve(&cancel).await;
        self.set_state(ListenerState::Closed);
        match &result {
            Ok(()) => info!("Relay listener stopped"),
            Err(e) => error!("Relay listener failed: {e}"),
        }
        result
    }

    async fn open_and_serve(&self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let validity = Duration::from_secs(self.config.token_validity_secs);
        let token = self.connection.issue_token(validity)?;
        let listener_id = uuid::Uuid::new_v4().to_string();
        let url = self.connection.listen_url(&token, &listener_id);

        info!(
            relay = %self.connection.base_url(),
            listener_id = %listener_id,
            "Relay: connecting..."
        );
        let ws = tokio::select! {
            connected = tokio_tungstenite::connect_async(url.as_str()) => {
                connected.map_err(|e| ListenerError::Connect(Box::new(e)))?.0
            }
            () = cancel.cancelled() => {
                info!("Relay: shutdown requested before the channel opened");
                return Ok(());
            }
        };

        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        self.set_state(ListenerState::Listening);
        info!(
            path = %self.connection.channel_path(),
            "Relay: listening, press Ctrl+C to exit"
        );

        let renew_task = self.spawn_token_renewal(sink.clone());
        let mut in_flight = JoinSet::new();
        let result = self
            .serve(cancel, stream, &sink, &mut in_flight)
            .instrument(info_span!("relay_listener", listener_id = %listener_id))
            .await;

        self.set_state(ListenerState::Closing);
        renew_task.abort();
        self.drain(&mut in_flight).await;

        let mut sink = sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Relay: close handshake failed: {e}");
        }
        result
    }

    /// Read loop. Returns when cancelled, when the relay closes the channel,
    /// or on a transport error.
    async fn serve(
        &self,
        cancel: &CancellationToken,
        mut stream: WsReader,
        sink: &WsSink,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), ListenerError> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Relay: shutdown requested, closing listener...");
                    return Ok(());
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        info!("Relay: control channel ended");
                        return Ok(());
                    };
                    match msg.map_err(|e| ListenerError::Channel(Box::new(e)))? {
                        Message::Text(text) => {
                            self.handle_control(&text, cancel, &mut stream, sink, in_flight)
                                .await?;
                        }
                        Message::Close(frame) => {
                            info!(?frame, "Relay: control channel closed by relay");
                            return Ok(());
                        }
                        Message::Binary(data) => {
                            warn!(len = data.len(), "Relay: unexpected binary frame, ignoring");
                        }
                        _ => {}
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Relay: request task ended abnormally: {e}");
                    }
                }
            }
        }
    }

    /// Handle one control message, reading its body frame when announced.
    /// Cancellation while waiting for that frame drops the request.
    async fn handle_control(
        &self,
        text: &str,
        cancel: &CancellationToken,
        stream: &mut WsReader,
        sink: &WsSink,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), ListenerError> {
        let message = match serde_json::from_str::<ControlMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Relay: unrecognized control message ({e}), ignoring");
                return Ok(());
            }
        };

        match message {
            ControlMessage::Request(request) if request.needs_rendezvous() => {
                let Some(address) = request.address.clone() else {
                    warn!(id = %request.id, "Relay: request without method or address, ignoring");
                    return Ok(());
                };
                debug!(id = %request.id, "Relay: request delivered by rendezvous");
                let handler = RequestHandler::new(self);
                in_flight.spawn(
                    serve_rendezvous(handler, address)
                        .instrument(info_span!("relay_request", id = %request.id)),
                );
            }
            ControlMessage::Request(request) => {
                debug!(id = %request.id, "Relay: receiving request");
                if request.body {
                    let body = tokio::select! {
                        body = read_body(stream) => body?,
                        () = cancel.cancelled() => {
                            debug!(id = %request.id, "Relay: shutdown while awaiting request body");
                            return Ok(());
                        }
                    };
                    let len = body.map_or(0, |b| b.len());
                    debug!(id = %request.id, len, "Relay: request body discarded");
                }
                let handler = RequestHandler::new(self);
                let sink = sink.clone();
                let span = info_span!("relay_request", id = %request.id);
                in_flight.spawn(
                    async move {
                        let response = handler.handle(&request).await;
                        if let Err(e) = send_response(&sink, &request.id, &response).await {
                            warn!("Relay: failed to write response: {e}");
                        }
                    }
                    .instrument(span),
                );
            }
            ControlMessage::Accept(accept) => {
                info!(id = %accept.id, "Relay: client connecting...");
                in_flight.spawn(async move {
                    let url = reject_url(&accept.address, 501, "WebSocket connections not supported");
                    match tokio_tungstenite::connect_async(url.as_str()).await {
                        Ok((mut ws, _)) => {
                            let _ = ws.close(None).await;
                            debug!(id = %accept.id, "Relay: WebSocket rendezvous declined");
                        }
                        Err(e) => debug!(id = %accept.id, "Relay: reject returned {e}"),
                    }
                });
            }
        }
        Ok(())
    }

    fn spawn_token_renewal(&self, sink: WsSink) -> tokio::task::JoinHandle<()> {
        let connection = self.connection.clone();
        let validity = Duration::from_secs(self.config.token_validity_secs);
        let period = renewal_period(
            validity,
            Duration::from_secs(self.config.token_renew_margin_secs),
        );

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let token = match connection.issue_token(validity) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Relay: token renewal failed: {e}");
                        continue;
                    }
                };
                let msg = ListenerMessage::RenewToken(RenewToken { token: token.token });
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.lock().await.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                debug!(expires_at = token.expires_at, "Relay: listener token renewed");
            }
        })
    }

    /// Let in-flight requests finish. Handlers are never aborted; past the
    /// grace period the wait is only reported.
    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        info!(pending = in_flight.len(), "Relay: waiting for in-flight requests");
        let finished = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(
                pending = in_flight.len(),
                "Relay: in-flight requests still running after grace period"
            );
            while in_flight.join_next().await.is_some() {}
        }
    }
}

/// Everything a request task needs, detached from the listener's lifetime.
struct RequestHandler {
    store: Arc<MachineStore>,
    channel_path: String,
}

impl RequestHandler {
    fn new(listener: &RelayListener) -> Self {
        Self {
            store: listener.store.clone(),
            channel_path: listener.connection.channel_path().to_string(),
        }
    }

    /// Dispatch in a separate task so a panic maps to a 500 instead of
    /// tearing down the listener.
    async fn handle(self, request: &RelayedRequest) -> RouteResponse {
        let method = request.method.clone().unwrap_or_default();
        let target = request.request_target.clone().unwrap_or_default();
        debug!(method = %method, target = %target, "Relay: dispatching");

        run_isolated(async move {
            routes::dispatch(&self.store, &self.channel_path, &method, &target).await
        })
        .await
    }
}

/// Run a dispatch on its own task. A panic becomes a 500 carrying the panic
/// message. Needs an unwinding build; `panic = "abort"` kills the process.
async fn run_isolated<F>(dispatch: F) -> RouteResponse
where
    F: std::future::Future<Output = Result<RouteOutcome, RouteError>> + Send + 'static,
{
    let result = match tokio::spawn(dispatch).await {
        Ok(result) => result,
        Err(e) => {
            let message = join_error_message(e);
            error!("Error processing request: {message}");
            Err(RouteError::Internal(message))
        }
    };
    RouteResponse::from(result)
}

/// Renew `margin` before expiry, but no more often than every 60s, or every
/// half validity for short-lived tokens. Never zero.
fn renewal_period(validity: Duration, margin: Duration) -> Duration {
    let floor = Duration::from_secs(60)
        .min(validity / 2)
        .max(Duration::from_secs(1));
    validity.saturating_sub(margin).max(floor)
}

/// Fetch and answer a request over its rendezvous socket.
async fn serve_rendezvous(handler: RequestHandler, address: String) {
    let ws = match tokio_tungstenite::connect_async(address.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Relay: rendezvous connect failed: {e}");
            return;
        }
    };
    let (sink, mut stream) = ws.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    let request = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Request(request)) => break request,
                    Ok(ControlMessage::Accept(_)) | Err(_) => {
                        warn!("Relay: unexpected message on rendezvous socket");
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(_)) | None => {
                warn!("Relay: rendezvous socket closed before the request arrived");
                return;
            }
            Some(Err(e)) => {
                warn!("Relay: rendezvous read failed: {e}");
                return;
            }
        }
    };

    if request.body {
        if let Err(e) = read_body(&mut stream).await {
            warn!("Relay: rendezvous body read failed: {e}");
            return;
        }
    }

    let response = handler.handle(&request).await;
    if let Err(e) = send_response(&sink, &request.id, &response).await {
        warn!("Relay: failed to write rendezvous response: {e}");
    }
    let _ = sink.lock().await.close().await;
}

/// Read the binary frame carrying a request body.
async fn read_body(stream: &mut WsReader) -> Result<Option<Vec<u8>>, ListenerError> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(other)) => {
                warn!(frame = ?other, "Relay: expected request body frame");
                return Ok(None);
            }
            Some(Err(e)) => return Err(ListenerError::Channel(Box::new(e))),
            None => return Ok(None),
        }
    }
}

/// Write the response header frame and, when present, the body frame.
async fn send_response(
    sink: &WsSink,
    request_id: &str,
    response: &RouteResponse,
) -> Result<(), tungstenite::Error> {
    let (header, body) = RelayedResponse::from_route(request_id, response);
    let text = serde_json::to_string(&ListenerMessage::Response(header))
        .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))?;

    debug!(status = response.status, "Relay: responding");
    let mut sink = sink.lock().await;
    sink.send(Message::Text(text.into())).await?;
    if let Some(body) = body {
        sink.send(Message::Binary(body.into())).await?;
    }
    Ok(())
}

fn join_error_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "request handler was cancelled".to_string();
    }
    let panic = err.into_panic();
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "request handler panicked".to_string()
    }
}
