use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use courier_client::outbox::OutboundAction;
use courier_client::{
    ActionOutcome, ChatClient, ClientConfig, Credentials, Intent, Notice, SessionState,
};
use courier_common::types::{EventKind, EventPayload};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

/// Scripted behaviour of the fake chat backend.
#[derive(Clone, Default)]
struct Behavior {
    /// Frames pushed to the client right after a successful auth.
    push_after_auth: Vec<String>,
    /// Acknowledge every action twice.
    ack_twice: bool,
    /// Hang up the first connection right after auth.
    drop_first_connection: bool,
}

#[derive(Clone)]
struct FakeServer {
    behavior: Arc<Behavior>,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeServer {
    fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.received
            .lock()
            .expect("received lock")
            .iter()
            .filter(|frame| frame["type"] == kind)
            .cloned()
            .collect()
    }
}

async fn start_server(behavior: Behavior) -> (FakeServer, String) {
    let server = FakeServer {
        behavior: Arc::new(behavior),
        received: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake chat server should run");
    });
    (server, format!("ws://{addr}/ws"))
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<FakeServer>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, server: FakeServer) {
    let connection = server.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
        server.received.lock().expect("received lock").push(frame.clone());

        match frame["type"].as_str() {
            Some("auth") => {
                if frame["token"] == "bad" {
                    send_json(&mut socket, json!({"type": "auth_error", "reason": "invalid token"})).await;
                    return;
                }
                send_json(&mut socket, json!({"type": "auth_ok", "userId": frame["userId"]})).await;
                for pushed in &server.behavior.push_after_auth {
                    let _ = socket.send(Message::Text(pushed.clone().into())).await;
                }
                if server.behavior.drop_first_connection && connection == 0 {
                    return;
                }
            }
            Some("ping") => {
                send_json(&mut socket, json!({"type": "pong"})).await;
            }
            Some("message") | Some("read") => {
                let ack = json!({
                    "type": "ack",
                    "actionId": frame["actionId"],
                    "result": "applied",
                    "messageId": "srv-1",
                });
                send_json(&mut socket, ack.clone()).await;
                if server.behavior.ack_twice {
                    send_json(&mut socket, ack).await;
                }
            }
            _ => {}
        }
    }
}

fn client_config(ws_url: &str) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.server.ws_url = Some(ws_url.to_string());
    config.server.connect_timeout_ms = 2_000;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config.reconnect.jitter = 0.0;
    config
}

#[tokio::test]
async fn pushed_message_reaches_subscriber_exactly_once() {
    let frame = r#"{"type":"message","chatId":"42","message":{"id":"m1","content":"hi"}}"#;
    let (_server, url) = start_server(Behavior {
        push_after_auth: vec![frame.to_string(), frame.to_string()],
        ..Behavior::default()
    })
    .await;

    let client = ChatClient::spawn(client_config(&url)).expect("client should spawn");
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(EventKind::Message, move |event| {
            let _ = tx.send(event.clone());
        })
        .await
        .expect("subscribe");
    client.connect(Credentials::new("u1", "good")).await.expect("connect");

    let event = timeout(WAIT, rx.recv()).await.expect("message in time").expect("channel open");
    assert_eq!(event.chat_id.as_deref(), Some("42"));
    match event.payload {
        EventPayload::Message { message } => assert_eq!(message.content, "hi"),
        other => panic!("expected message payload, got {other:?}"),
    }

    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "duplicate push must be dropped");
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn action_queued_offline_is_flushed_and_acked_once() {
    let (server, url) = start_server(Behavior { ack_twice: true, ..Behavior::default() }).await;
    let client = ChatClient::spawn(client_config(&url)).expect("client should spawn");

    let pending = client
        .send_action(OutboundAction::with_id("a1", Intent::message("42", "hello"), Instant::now()))
        .await
        .expect("action accepted while disconnected");
    assert_eq!(pending.id(), "a1");
    assert_eq!(client.connection_state(), SessionState::Disconnected);

    client.connect(Credentials::new("u1", "good")).await.expect("connect");
    let outcome = timeout(WAIT, pending.outcome()).await.expect("ack in time").expect("outcome");
    assert_eq!(outcome, ActionOutcome::Delivered { message_id: Some("srv-1".into()), duplicate: false });

    sleep(Duration::from_millis(300)).await;
    let sent = server.frames_of("message");
    assert_eq!(sent.len(), 1, "duplicate ack must not trigger a resend");
    assert_eq!(sent[0]["actionId"], "a1");
    assert_eq!(sent[0]["chatId"], "42");
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rejected_credentials_fail_the_session() {
    let (server, url) = start_server(Behavior::default()).await;
    let client = ChatClient::spawn(client_config(&url)).expect("client should spawn");
    let mut notices = client.notices().await.expect("notices");

    client.connect(Credentials::new("u1", "bad")).await.expect("connect starts");
    assert!(client.wait_for_state(SessionState::Failed, WAIT).await);

    let mut saw_auth_failure = false;
    while let Ok(notice) = notices.try_recv() {
        saw_auth_failure |= matches!(notice, Notice::AuthFailed { .. });
    }
    assert!(saw_auth_failure);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(server.frames_of("auth").len(), 1, "auth failure is not retried");
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn session_recovers_after_server_hangs_up() {
    let (server, url) =
        start_server(Behavior { drop_first_connection: true, ..Behavior::default() }).await;
    let client = ChatClient::spawn(client_config(&url)).expect("client should spawn");
    let mut notices = client.notices().await.expect("notices");
    let mut states = client.state_watch();

    client.connect(Credentials::new("u1", "good")).await.expect("connect");

    let deadline = Instant::now() + WAIT;
    while server.connections.load(Ordering::SeqCst) < 2 || *states.borrow() != SessionState::Active {
        assert!(Instant::now() < deadline, "session did not recover");
        let _ = timeout(Duration::from_millis(100), states.changed()).await;
    }

    let mut transitions = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        if let Notice::StateChanged { to, .. } = notice {
            transitions.push(to);
        }
    }
    assert_eq!(
        transitions,
        vec![
            SessionState::Connecting,
            SessionState::Authenticating,
            SessionState::Active,
            SessionState::Reconnecting,
            SessionState::Connecting,
            SessionState::Authenticating,
            SessionState::Active,
        ]
    );
    assert_eq!(server.frames_of("auth").len(), 2);

    let pending = client.send(Intent::message("42", "after reconnect")).await.expect("send");
    let outcome = timeout(WAIT, pending.outcome()).await.expect("ack in time").expect("outcome");
    assert!(outcome.is_delivered());
    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_stops_the_event_loop() {
    let (_server, url) = start_server(Behavior::default()).await;
    let client = ChatClient::spawn(client_config(&url)).expect("client should spawn");
    client.shutdown().await.expect("shutdown");

    sleep(Duration::from_millis(50)).await;
    assert!(!client.is_running());
    assert!(client.connect(Credentials::new("u1", "good")).await.is_err());
}
