use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::{domain::UserId, protocol::RECORD_SEPARATOR};
use tokio::sync::Notify;

use super::*;
use crate::{
    error::{ConfigurationError, ConnectError},
    fakes::{lock, refused, FakeHub, Outcome},
    reconnect::ReconnectPolicy,
    session::{ConnectionState, HubSession, SessionSettings},
};

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

fn request(addr: SocketAddr, transport: TransportKind) -> ConnectRequest {
    ConnectRequest {
        url: Url::parse(&format!("http://{addr}/chat?userId=alice")).expect("url"),
        access_token: "tok".into(),
        transport,
    }
}

fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|record| !record.is_empty())
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Default)]
struct SocketHub {
    queries: Mutex<Vec<HashMap<String, String>>>,
    auth: Mutex<Vec<String>>,
    frames: Mutex<Vec<String>>,
    answer: AtomicBool,
    ended: AtomicBool,
}

async fn socket_upgrade(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<SocketHub>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    lock(&hub.queries).push(query);
    if let Some(value) = bearer(&headers) {
        lock(&hub.auth).push(value);
    }
    ws.on_upgrade(move |socket| run_socket(socket, hub))
}

/// Answers every invocation with a completion plus one push event, or drops
/// the socket when `answer` is off.
async fn run_socket(mut socket: WebSocket, hub: Arc<SocketHub>) {
    let Some(Ok(WsMessage::Text(handshake))) = socket.recv().await else {
        return;
    };
    lock(&hub.frames).push(handshake);
    let accepted = format!("{{}}{RECORD_SEPARATOR}");
    if socket.send(WsMessage::Text(accepted)).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        lock(&hub.frames).push(text.clone());
        for record in records(&text) {
            let value: Value = serde_json::from_str(record).unwrap_or(Value::Null);
            if value["type"] != 1 {
                continue;
            }
            if !hub.answer.load(Ordering::SeqCst) {
                let _ = socket.send(WsMessage::Close(None)).await;
                return;
            }
            let completion = json!({
                "type": 3,
                "invocationId": value["invocationId"],
                "result": "conn-1",
            });
            let push = json!({"type": 1, "target": "UserJoined", "arguments": ["bob"]});
            let frame = format!("{completion}{RECORD_SEPARATOR}{push}{RECORD_SEPARATOR}");
            if socket.send(WsMessage::Text(frame)).await.is_err() {
                return;
            }
        }
    }
    hub.ended.store(true, Ordering::SeqCst);
}

async fn socket_hub(answer: bool) -> (Arc<SocketHub>, SocketAddr) {
    let hub = Arc::new(SocketHub::default());
    hub.answer.store(answer, Ordering::SeqCst);
    let router = Router::new()
        .route("/chat", get(socket_upgrade))
        .with_state(Arc::clone(&hub));
    (hub, serve(router).await)
}

async fn connect_err(request: &ConnectRequest) -> TransportError {
    match HubClient::new(Duration::from_secs(5)).connect(request).await {
        Ok(_) => panic!("connect to {} should fail", request.url),
        Err(err) => err,
    }
}

#[tokio::test]
async fn websocket_handshake_invoke_and_push() {
    let (hub, addr) = socket_hub(true).await;
    let connection = HubClient::new(Duration::from_secs(5))
        .connect(&request(addr, TransportKind::WebSockets))
        .await
        .expect("connect");
    assert_eq!(connection.transport(), TransportKind::WebSockets);
    let mut inbound = connection.subscribe();

    let result = connection
        .invoke("GetConnectionId", Vec::new())
        .await
        .expect("completion");
    assert_eq!(result, json!("conn-1"));

    let push = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("push in time")
        .expect("push");
    assert_eq!(
        push,
        InboundInvocation {
            target: "UserJoined".into(),
            arguments: vec![json!("bob")],
        }
    );

    let frames = lock(&hub.frames).clone();
    assert_eq!(frames[0], format!("{{\"protocol\":\"json\",\"version\":1}}{RECORD_SEPARATOR}"));
    let invocation: Value =
        serde_json::from_str(records(&frames[1]).next().expect("record")).expect("json");
    assert_eq!(invocation["type"], 1);
    assert_eq!(invocation["target"], "GetConnectionId");
    assert_eq!(invocation["arguments"], json!([]));

    let query = lock(&hub.queries)[0].clone();
    assert_eq!(query.get("userId").map(String::as_str), Some("alice"));
    assert_eq!(query.get("access_token").map(String::as_str), Some("tok"));
    assert_eq!(lock(&hub.auth).clone(), vec!["Bearer tok".to_string()]);

    connection.close().await;
    assert_eq!(connection.closed().await, None);
    assert!(matches!(
        connection.invoke("GetConnectionId", Vec::new()).await,
        Err(InvokeError::ConnectionClosed { .. })
    ));
}

#[tokio::test]
async fn websocket_close_fails_outstanding_invocations() {
    let (_hub, addr) = socket_hub(false).await;
    let connection = HubClient::new(Duration::from_secs(5))
        .connect(&request(addr, TransportKind::WebSockets))
        .await
        .expect("connect");

    let err = connection
        .invoke("SendMessage", vec![json!("c1"), json!("hi")])
        .await
        .expect_err("socket dropped");
    assert!(matches!(err, InvokeError::ConnectionClosed { .. }));

    let reason = tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .expect("closed in time");
    assert!(matches!(reason, Some(TransportError::Closed(_))));
}

#[tokio::test]
async fn dropping_the_session_closes_its_websocket() {
    let (hub, addr) = socket_hub(true).await;
    let settings = SessionSettings {
        endpoint: HubEndpoint::new(format!("http://{addr}"), "/chat", Vec::new()),
        platform: Platform::Native,
        reconnect: ReconnectPolicy::default(),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_method: "GetConnectionId".into(),
        announce_user: false,
    };
    let session = HubSession::new(settings, Arc::new(HubClient::new(Duration::from_secs(5))));
    session
        .connect(UserId::from("alice"), "tok")
        .await
        .expect("connect");
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(!hub.ended.load(Ordering::SeqCst));

    drop(session);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !hub.ended.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hub saw the socket end");
}

#[tokio::test]
async fn hub_close_record_decides_whether_reconnect_is_allowed() {
    let (outbound, _writer) = tokio::sync::mpsc::unbounded_channel();

    let removed = channel::HubChannel::new(
        TransportKind::WebSockets,
        outbound.clone(),
        Duration::from_secs(5),
    );
    let record = json!({"type": 7, "error": "account removed", "allowReconnect": false});
    removed.handle_text(&format!("{record}{RECORD_SEPARATOR}"));
    let reason = removed.closed().await.expect("hub reason");
    assert_eq!(reason, TransportError::Terminated("account removed".into()));
    assert!(reason.is_fatal());
    assert_eq!(
        ConnectError::from_transport(reason),
        ConnectError::Configuration(ConfigurationError::HubTerminated {
            reason: "account removed".into()
        })
    );

    let restarting = channel::HubChannel::new(
        TransportKind::WebSockets,
        outbound,
        Duration::from_secs(5),
    );
    let record = json!({"type": 7, "allowReconnect": true});
    restarting.handle_text(&format!("{record}{RECORD_SEPARATOR}"));
    let reason = restarting.closed().await.expect("hub reason");
    assert_eq!(reason, TransportError::Closed("closed by hub".into()));
    assert!(!reason.is_fatal());
}

#[tokio::test]
async fn upgrade_status_decides_error_class() {
    let router = Router::new()
        .route("/chat", get(|| async { StatusCode::FORBIDDEN }))
        .route("/locked", get(|| async { StatusCode::UNAUTHORIZED }));
    let addr = serve(router).await;

    let forbidden = connect_err(&request(addr, TransportKind::WebSockets)).await;
    assert!(matches!(
        forbidden,
        TransportError::OriginRejected { status: 403, .. }
    ));
    assert!(forbidden.is_fatal());

    let mut locked = request(addr, TransportKind::WebSockets);
    locked.url.set_path("/locked");
    let unauthorized = connect_err(&locked).await;
    assert!(matches!(
        unauthorized,
        TransportError::Unauthorized { status: 401, .. }
    ));
    assert!(!unauthorized.is_fatal());
}

#[derive(Default)]
struct PollHub {
    outbox: Mutex<Vec<String>>,
    notify: Notify,
    received: Mutex<Vec<String>>,
    negotiate_queries: Mutex<Vec<HashMap<String, String>>>,
    connection_ids: Mutex<Vec<String>>,
    auth: Mutex<Vec<String>>,
    deleted: AtomicBool,
}

impl PollHub {
    fn queue(&self, record: String) {
        lock(&self.outbox).push(record);
        self.notify.notify_waiters();
    }
}

async fn poll_negotiate(
    State(hub): State<Arc<PollHub>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Json<Value> {
    lock(&hub.negotiate_queries).push(query);
    if let Some(value) = bearer(&headers) {
        lock(&hub.auth).push(value);
    }
    Json(json!({
        "connectionId": "id-1",
        "connectionToken": "tok-1",
        "negotiateVersion": 1,
        "availableTransports": [
            {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
            {"transport": "LongPolling", "transferFormats": ["Text", "Binary"]}
        ]
    }))
}

async fn poll_send(
    State(hub): State<Arc<PollHub>>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> StatusCode {
    lock(&hub.connection_ids).push(query.get("id").cloned().unwrap_or_default());
    for record in records(&body) {
        lock(&hub.received).push(record.to_string());
        let value: Value = serde_json::from_str(record).unwrap_or(Value::Null);
        if value.get("protocol").is_some() {
            hub.queue(format!("{{}}{RECORD_SEPARATOR}"));
        } else if value["type"] == 1 {
            let completion = json!({
                "type": 3,
                "invocationId": value["invocationId"],
                "result": 7,
            });
            hub.queue(format!("{completion}{RECORD_SEPARATOR}"));
        }
    }
    StatusCode::OK
}

async fn poll_receive(State(hub): State<Arc<PollHub>>) -> Response {
    loop {
        if hub.deleted.load(Ordering::SeqCst) {
            return StatusCode::NO_CONTENT.into_response();
        }
        let notified = hub.notify.notified();
        let pending: String = lock(&hub.outbox).drain(..).collect();
        if !pending.is_empty() {
            return pending.into_response();
        }
        if tokio::time::timeout(Duration::from_millis(200), notified)
            .await
            .is_err()
        {
            return String::new().into_response();
        }
    }
}

async fn poll_delete(State(hub): State<Arc<PollHub>>) -> StatusCode {
    hub.deleted.store(true, Ordering::SeqCst);
    hub.notify.notify_waiters();
    StatusCode::OK
}

async fn poll_hub() -> (Arc<PollHub>, SocketAddr) {
    let hub = Arc::new(PollHub::default());
    let router = Router::new()
        .route("/chat/negotiate", post(poll_negotiate))
        .route("/chat", post(poll_send).get(poll_receive).delete(poll_delete))
        .with_state(Arc::clone(&hub));
    (hub, serve(router).await)
}

#[tokio::test]
async fn long_polling_negotiates_then_invokes() {
    let (hub, addr) = poll_hub().await;
    let connection = HubClient::new(Duration::from_secs(5))
        .connect(&request(addr, TransportKind::LongPolling))
        .await
        .expect("connect");
    assert_eq!(connection.transport(), TransportKind::LongPolling);

    let result = connection
        .invoke("MarkMessagesRead", vec![json!(["m1", "m2"])])
        .await
        .expect("completion");
    assert_eq!(result, json!(7));

    let negotiate_query = lock(&hub.negotiate_queries)[0].clone();
    assert_eq!(
        negotiate_query.get("negotiateVersion").map(String::as_str),
        Some("1")
    );
    assert_eq!(negotiate_query.get("userId").map(String::as_str), Some("alice"));
    assert_eq!(lock(&hub.auth).clone(), vec!["Bearer tok".to_string()]);
    assert!(lock(&hub.connection_ids).iter().all(|id| id == "tok-1"));

    let received = lock(&hub.received).clone();
    assert_eq!(received[0], "{\"protocol\":\"json\",\"version\":1}");
    let invocation: Value = serde_json::from_str(&received[1]).expect("json");
    assert_eq!(invocation["target"], "MarkMessagesRead");

    connection.close().await;
    assert_eq!(connection.closed().await, None);
    for _ in 0..100 {
        if hub.deleted.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(hub.deleted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn long_polling_negotiate_errors_are_classified() {
    let router = Router::new()
        .route("/chat/negotiate", post(|| async { StatusCode::FORBIDDEN }))
        .route(
            "/ws-only/negotiate",
            post(|| async {
                Json(json!({
                    "connectionToken": "t",
                    "availableTransports": [{"transport": "WebSockets"}]
                }))
            }),
        );
    let addr = serve(router).await;

    let forbidden = connect_err(&request(addr, TransportKind::LongPolling)).await;
    assert!(matches!(
        forbidden,
        TransportError::OriginRejected { status: 403, .. }
    ));

    let mut ws_only = request(addr, TransportKind::LongPolling);
    ws_only.url.set_path("/ws-only");
    assert!(matches!(
        connect_err(&ws_only).await,
        TransportError::Handshake(_)
    ));
}

fn endpoint(alternates: &[&str]) -> HubEndpoint {
    HubEndpoint::new(
        "https://chat.example.com/",
        "/chat",
        alternates.iter().map(|path| path.to_string()).collect(),
    )
}

#[test]
fn hub_urls_join_base_and_path_with_user_id() {
    let url = endpoint(&[])
        .url_for("chat", &UserId::from("a b"))
        .expect("url");
    assert_eq!(url.as_str(), "https://chat.example.com/chat?userId=a+b");

    let bad = HubEndpoint::new("mailto:someone", "/chat", Vec::new())
        .url_for("/chat", &UserId::from("a"));
    assert!(matches!(bad, Err(ConfigurationError::InvalidHubUrl { .. })));
}

#[test]
fn attempts_follow_platform_preference_without_duplicates() {
    let user = UserId::from("alice");
    let attempts = plan_attempts(
        &endpoint(&["/chat", "/api/chat", "/api/chat"]),
        Platform::Native,
        &user,
        "tok",
    )
    .expect("plan");
    let planned: Vec<(&str, TransportKind)> = attempts
        .iter()
        .map(|attempt| (attempt.url.path(), attempt.transport))
        .collect();
    assert_eq!(
        planned,
        vec![
            ("/chat", TransportKind::WebSockets),
            ("/chat", TransportKind::LongPolling),
            ("/api/chat", TransportKind::LongPolling),
        ]
    );

    let browser = plan_attempts(&endpoint(&["/chat"]), Platform::Browser, &user, "tok")
        .expect("plan");
    assert_eq!(browser.len(), 1);
    assert_eq!(browser[0].transport, TransportKind::LongPolling);
}

#[test]
fn transport_urls_are_derived_from_the_hub_url() {
    let hub = Url::parse("https://chat.example.com/chat?userId=alice").expect("url");

    let ws = websocket::websocket_url(&hub, "t 1").expect("ws url");
    assert_eq!(
        ws.as_str(),
        "wss://chat.example.com/chat?userId=alice&access_token=t+1"
    );

    let negotiate = long_polling::negotiate_url(&hub);
    assert_eq!(
        negotiate.as_str(),
        "https://chat.example.com/chat/negotiate?userId=alice&negotiateVersion=1"
    );

    let poll = long_polling::connection_url(&hub, "tok-1");
    assert_eq!(
        poll.as_str(),
        "https://chat.example.com/chat?userId=alice&id=tok-1"
    );
}

#[test]
fn platform_names_parse_loosely() {
    assert_eq!(Platform::parse(" iOS "), Some(Platform::Native));
    assert_eq!(Platform::parse("web"), Some(Platform::Browser));
    assert_eq!(Platform::parse("toaster"), None);
}

#[tokio::test]
async fn negotiation_falls_through_to_the_first_working_endpoint() {
    let hub = FakeHub::accepting();
    let attempts = plan_attempts(
        &endpoint(&["/api/chat"]),
        Platform::Native,
        &UserId::from("alice"),
        "tok",
    )
    .expect("plan");
    hub.push_outcome(Outcome::Refuse(refused("wss://chat.example.com/chat")));

    match negotiate(hub.as_ref(), &attempts).await {
        Ok((connection, chosen)) => {
            assert_eq!(chosen.url.path(), "/api/chat");
            assert_eq!(connection.transport(), TransportKind::LongPolling);
        }
        Err(err) => panic!("negotiation failed: {err}"),
    }
    assert_eq!(hub.attempt_count(), 2);
}

#[tokio::test]
async fn negotiation_stops_at_a_fatal_error() {
    let hub = FakeHub::accepting();
    let attempts = plan_attempts(
        &endpoint(&["/api/chat"]),
        Platform::Native,
        &UserId::from("alice"),
        "tok",
    )
    .expect("plan");
    hub.push_outcome(Outcome::Refuse(TransportError::from_status(
        403,
        "wss://chat.example.com/chat",
    )));

    match negotiate(hub.as_ref(), &attempts).await {
        Ok(_) => panic!("origin rejection must stop negotiation"),
        Err(err) => assert!(err.is_fatal()),
    }
    assert_eq!(hub.attempt_count(), 1);

    match negotiate(hub.as_ref(), &[]).await {
        Ok(_) => panic!("nothing to try"),
        Err(err) => assert!(matches!(err, TransportError::Unreachable { .. })),
    }
}
