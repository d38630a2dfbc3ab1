//! End-to-end: forwarder → fake relay → listener → state file.
//!
//! The fake relay speaks just enough of the hybrid connection protocol to
//! accept one listener control channel, turn incoming HTTP requests into
//! `request` messages, and hand the listener's `response` back to the caller.
//! With `rendezvous` set, requests are announced by address only and served
//! over a second WebSocket. It also records reject dials and `renewToken`
//! frames.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relayctl::config::{ForwarderConfig, ListenerConfig};
use relayctl::relay::listener::ListenerError;
use relayctl::relay::token::TokenProvider;
use relayctl::{
    ListenerState, MachineRoute, MachineStore, RelayConnection, RelayForwarder, RelayListener,
    StateFile,
};

type Reply = (u16, Vec<u8>);

struct FakeRelay {
    addr: SocketAddr,
    rendezvous: bool,
    control: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    staged: Mutex<HashMap<String, Vec<Message>>>,
    listen_tokens: Mutex<Vec<String>>,
    renewed_tokens: Mutex<Vec<String>>,
    rejects: Mutex<Vec<HashMap<String, String>>>,
}

impl FakeRelay {
    /// Push a raw frame down the listener's control channel.
    async fn push(&self, frame: Message) {
        let control = self.control.lock().await;
        control.as_ref().unwrap().send(frame).unwrap();
    }
}

/// Poll `check` until it returns `Some` or five seconds pass.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..250 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

async fn listen(
    State(relay): State<Arc<FakeRelay>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match query.get("sb-hc-action").map(String::as_str) {
        Some("listen") => {}
        Some("reject") => {
            relay.rejects.lock().await.push(query);
            return StatusCode::OK.into_response();
        }
        _ => return StatusCode::BAD_REQUEST.into_response(),
    }
    let Some(token) = query.get("sb-hc-token") else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    relay.listen_tokens.lock().await.push(token.clone());
    ws.on_upgrade(move |socket| control_channel(relay, socket))
}

async fn control_channel(relay: Arc<FakeRelay>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *relay.control.lock().await = Some(tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });
    read_responses(&relay, &mut stream).await;
    relay.control.lock().await.take();
    writer.abort();
}

/// Complete pending callers from `response` messages until the socket ends.
async fn read_responses(relay: &FakeRelay, stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        if let Some(token) = value["renewToken"]["token"].as_str() {
            relay.renewed_tokens.lock().await.push(token.to_string());
            continue;
        }
        let Some(response) = value.get("response") else {
            continue;
        };
        let id = response["requestId"].as_str().unwrap().to_string();
        let status = u16::try_from(response["statusCode"].as_u64().unwrap()).unwrap();
        let body = if response["body"].as_bool().unwrap_or(false) {
            match stream.next().await {
                Some(Ok(Message::Binary(b))) => b.to_vec(),
                other => panic!("expected response body frame, got {other:?}"),
            }
        } else {
            Vec::new()
        };
        if let Some(reply) = relay.pending.lock().await.remove(&id) {
            let _ = reply.send((status, body));
        }
    }
}

async fn rendezvous(
    State(relay): State<Arc<FakeRelay>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let Some(frames) = relay.staged.lock().await.remove(&id) else {
            return;
        };
        let (mut sink, mut stream) = socket.split();
        for frame in frames {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
        read_responses(&relay, &mut stream).await;
    })
}

async fn forward(
    State(relay): State<Arc<FakeRelay>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !headers.contains_key("ServiceBusAuthorization") {
        return (StatusCode::UNAUTHORIZED, "missing ServiceBusAuthorization").into_response();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    let request = json!({
        "request": {
            "address": format!("ws://{}/rendezvous/{id}", relay.addr),
            "id": id,
            "requestTarget": target,
            "method": method.as_str(),
            "requestHeaders": {"Host": relay.addr.to_string()},
            "body": !body.is_empty()
        }
    });
    let mut frames = vec![Message::Text(request.to_string().into())];
    if !body.is_empty() {
        frames.push(Message::Binary(body));
    }

    let (tx, rx) = oneshot::channel();
    relay.pending.lock().await.insert(id.clone(), tx);

    {
        let control = relay.control.lock().await;
        let Some(control) = control.as_ref() else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if relay.rendezvous {
            relay.staged.lock().await.insert(id.clone(), frames);
            let notice = json!({
                "request": {"address": format!("ws://{}/rendezvous/{id}", relay.addr), "id": id}
            });
            control.send(Message::Text(notice.to_string().into())).unwrap();
        } else {
            for frame in frames {
                control.send(frame).unwrap();
            }
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), rx).await {
        Ok(Ok((status, body))) => (StatusCode::from_u16(status).unwrap(), body).into_response(),
        _ => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

struct Harness {
    relay: Arc<FakeRelay>,
    base: String,
    forwarder: RelayForwarder,
    store: Arc<MachineStore>,
    state: watch::Receiver<ListenerState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ListenerError>>,
    _dir: tempfile::TempDir,
}

fn listener_config() -> ListenerConfig {
    ListenerConfig {
        token_validity_secs: 3600,
        token_renew_margin_secs: 300,
        shutdown_grace_secs: 1,
    }
}

async fn start(rendezvous_mode: bool) -> Harness {
    start_with(rendezvous_mode, listener_config()).await
}

async fn start_with(rendezvous_mode: bool, config: ListenerConfig) -> Harness {
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let relay = Arc::new(FakeRelay {
        addr,
        rendezvous: rendezvous_mode,
        control: Mutex::new(None),
        pending: Mutex::new(HashMap::new()),
        staged: Mutex::new(HashMap::new()),
        listen_tokens: Mutex::new(Vec::new()),
        renewed_tokens: Mutex::new(Vec::new()),
        rejects: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/$hc/machines", get(listen))
        .route("/rendezvous/{id}", get(rendezvous))
        .route("/machines", any(forward))
        .route("/machines/{*route}", any(forward))
        .with_state(relay.clone());
    tokio::spawn(async move {
        axum::serve(tcp, app).await.unwrap();
    });

    let base = format!("http://{addr}/machines");
    let connection = Arc::new(
        RelayConnection::new(&base, TokenProvider::new("listen-policy", "secret")).unwrap(),
    );
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MachineStore::new(StateFile::new(
        dir.path().join("machine-state.json"),
    )));
    let listener = RelayListener::new(connection.clone(), store.clone(), config);
    let mut state = listener.state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { listener.run(cancel).await }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ListenerState::Listening),
    )
    .await
    .expect("listener did not reach Listening")
    .unwrap();
    for _ in 0..100 {
        if relay.control.lock().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let forwarder = RelayForwarder::new(
        connection,
        &ForwarderConfig {
            token_validity_secs: 3600,
            request_timeout_secs: 10,
        },
    )
    .unwrap();

    Harness {
        relay,
        base,
        forwarder,
        store,
        state,
        cancel,
        task,
        _dir: dir,
    }
}

async fn send_json(h: &Harness, route: MachineRoute, machine: &str) -> Value {
    let body = h.forwarder.send(route, machine).await.unwrap();
    serde_json::from_str(&body).unwrap()
}

fn state_file(h: &Harness) -> Value {
    serde_json::from_str(&std::fs::read_to_string(h.store.path()).unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pump_start_stop_status_round_trip() {
    let h = start(false).await;

    assert_eq!(
        send_json(&h, MachineRoute::Start, "PUMP-7").await,
        json!({"machine": "PUMP-7", "status": "started"})
    );
    assert_eq!(
        state_file(&h),
        json!([{"MachineName": "PUMP-7", "State": "on"}])
    );

    assert_eq!(
        send_json(&h, MachineRoute::Stop, "PUMP-7").await,
        json!({"machine": "PUMP-7", "status": "stopped"})
    );
    assert_eq!(
        state_file(&h),
        json!([{"MachineName": "PUMP-7", "State": "off"}])
    );

    assert_eq!(
        send_json(&h, MachineRoute::GetStatus, "PUMP-7").await,
        json!({"machine": "PUMP-7", "isOn": false})
    );

    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_presents_sas_token() {
    let h = start(false).await;
    let tokens = h.relay.listen_tokens.lock().await.clone();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].starts_with("SharedAccessSignature sr="));
    assert!(tokens[0].contains("skn=listen-policy"));
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_statuses_cross_the_relay() {
    let h = start(false).await;
    let http = reqwest::Client::new();
    let token = "SharedAccessSignature sr=test";

    let res = http
        .post(format!("{}/reboot?machine=m1", h.base))
        .header("ServiceBusAuthorization", token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 404);
    assert_eq!(
        res.json::<Value>().await.unwrap(),
        json!({"error": "Unknown route"})
    );

    let res = http
        .post(format!("{}/start", h.base))
        .header("ServiceBusAuthorization", token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    assert_eq!(
        res.json::<Value>().await.unwrap(),
        json!({"error": "Route or machine missing"})
    );

    let res = http
        .get(format!("{}/start?machine=m1", h.base))
        .header("ServiceBusAuthorization", token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 405);
    assert!(res.bytes().await.unwrap().is_empty());

    assert!(h.store.snapshot().await.is_empty());
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_body_is_read_and_ignored() {
    let h = start(false).await;
    let res = reqwest::Client::new()
        .post(format!("{}/start?machine=Line1", h.base))
        .header("ServiceBusAuthorization", "SharedAccessSignature sr=test")
        .body("ignored payload")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);

    assert_eq!(
        send_json(&h, MachineRoute::GetStatus, "line1").await,
        json!({"machine": "line1", "isOn": true})
    );
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rendezvous_delivered_request_is_served() {
    let h = start(true).await;
    assert_eq!(
        send_json(&h, MachineRoute::Start, "PUMP 9").await,
        json!({"machine": "PUMP 9", "status": "started"})
    );
    assert!(h.store.is_on("pump 9").await);
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_lose_no_updates() {
    let h = start(false).await;
    let mut calls = Vec::new();
    for i in 0..16 {
        let forwarder = h.forwarder.clone();
        calls.push(tokio::spawn(async move {
            forwarder
                .send(MachineRoute::Start, &format!("m{i}"))
                .await
                .unwrap()
        }));
    }
    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(h.store.snapshot().await.len(), 16);
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_offer_is_declined_with_501() {
    let h = start(false).await;
    let offer = json!({
        "accept": {
            "address": format!("ws://{}/$hc/machines?sb-hc-action=accept&sb-hc-id=7", h.relay.addr),
            "id": "7"
        }
    });
    h.relay.push(Message::Text(offer.to_string().into())).await;

    let relay = &h.relay;
    let reject = eventually(move || async move { relay.rejects.lock().await.first().cloned() }).await;
    assert_eq!(reject["sb-hc-action"], "reject");
    assert_eq!(reject["sb-hc-id"], "7");
    assert_eq!(reject["sb-hc-statusCode"], "501");
    assert_eq!(
        reject["sb-hc-statusDescription"],
        "WebSocket connections not supported"
    );

    // The control channel keeps serving after the decline.
    assert_eq!(
        send_json(&h, MachineRoute::GetStatus, "m1").await,
        json!({"machine": "m1", "isOn": false})
    );
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_renews_its_token() {
    let h = start_with(
        false,
        ListenerConfig {
            token_validity_secs: 2,
            token_renew_margin_secs: 1,
            shutdown_grace_secs: 1,
        },
    )
    .await;

    let relay = &h.relay;
    let token =
        eventually(move || async move { relay.renewed_tokens.lock().await.first().cloned() }).await;
    assert!(token.starts_with("SharedAccessSignature sr="));
    assert!(token.contains("skn=listen-policy"));
    h.cancel.cancel();
    h.task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_pending_body_read() {
    let mut h = start(false).await;
    let request = json!({
        "request": {
            "id": "r1",
            "requestTarget": "/machines/start?machine=m1",
            "method": "POST",
            "body": true
        }
    });
    // Announce a body but never send the binary frame.
    h.relay.push(Message::Text(request.to_string().into())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), &mut h.task)
        .await
        .expect("listener stuck waiting for a request body")
        .unwrap()
        .unwrap();
    assert_eq!(*h.state.borrow_and_update(), ListenerState::Closed);
    assert!(h.store.snapshot().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_closes_the_listener() {
    let mut h = start(false).await;
    assert_eq!(*h.state.borrow(), ListenerState::Listening);

    h.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), &mut h.task)
        .await
        .expect("listener did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(*h.state.borrow_and_update(), ListenerState::Closed);
}
