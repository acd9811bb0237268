//! End-to-end tests over the real HTTP/WebSocket surface: an in-process
//! server with an in-memory store and a mock push provider, driven by a
//! plain WebSocket client the way a device would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::admin::{self, AdminState};
use crate::ai::analysis::Analyzer;
use crate::ai::tools::ToolExecutor;
use crate::config::{AiConfig, FallbackConfig};
use crate::logbuf::LogBuffer;
use crate::notify::NotificationDispatcher;
use crate::push::mock::MockPush;
use crate::session::{SessionDeps, SessionRegistry};
use crate::store::test_fixtures::insert_subject;
use crate::store::Store;

struct TestServer {
    addr: SocketAddr,
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
    #[allow(dead_code)]
    push: Arc<MockPush>,
}

async fn spawn_server() -> TestServer {
    let store = Arc::new(Store::connect_for_tests().await);
    let registry = Arc::new(SessionRegistry::new());
    let push = Arc::new(MockPush::new());
    let notifier = Arc::new(NotificationDispatcher::new(
        push.clone(),
        None,
        None,
        FallbackConfig::default(),
    ));
    let ai = AiConfig {
        api_key: "test-key".into(),
        model_id: "test-model".into(),
        analysis_model_id: "test-analysis".into(),
        voice_name: "Aoede".into(),
        language_code: "pt-BR".into(),
    };
    let tools = Arc::new(ToolExecutor::new(
        store.clone(),
        notifier,
        Duration::from_secs(300),
    ));
    let analyzer = Arc::new(Analyzer::new(&ai));

    let router = admin::build_router(
        AdminState {
            store: store.clone(),
            registry: registry.clone(),
            logs: LogBuffer::new(100),
            started_at: Instant::now(),
            push_ok: false,
        },
        SessionDeps {
            store: store.clone(),
            registry: registry.clone(),
            tools,
            analyzer,
            ai,
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestServer {
        addr,
        store,
        registry,
        push,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("ws connect");
    ws
}

/// Next text frame within 2 s, skipping transport pings.
async fn next_text(ws: &mut WsClient) -> Option<String> {
    let deadline = Duration::from_secs(2);
    loop {
        let message = tokio::time::timeout(deadline, ws.next()).await.ok()??;
        match message.ok()? {
            Message::Text(text) => return Some(text.to_string()),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

/// True once the connection is observed closed (close frame, error, or EOF)
/// within 2 s.
async fn closed(ws: &mut WsClient) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) => return false,
            Ok(None) => return true,
            Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn ping_answers_pong_and_bad_frames_are_ignored() {
    let server = spawn_server().await;
    let mut ws = connect(server.addr).await;

    // A garbage frame and an unknown control type must not kill the session.
    ws.send(Message::Text("definitely not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"reboot_universe"}"#.into()))
        .await
        .unwrap();

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    let reply = next_text(&mut ws).await.expect("pong expected");
    assert_eq!(reply, r#"{"type":"pong"}"#);
}

#[tokio::test]
async fn register_with_unknown_key_fails_the_session() {
    let server = spawn_server().await;
    let mut ws = connect(server.addr).await;

    ws.send(Message::Text(
        r#"{"type":"register","cpf":"00000000000"}"#.into(),
    ))
    .await
    .unwrap();

    let reply = next_text(&mut ws).await.expect("error frame expected");
    assert!(reply.contains(r#""type":"error""#));
    // The message never confirms whether the key exists.
    assert!(!reply.contains("00000000000"));
    assert!(closed(&mut ws).await, "session must end after auth failure");
    assert_eq!(server.registry.active_count().await, 0);
}

#[tokio::test]
async fn register_resolves_normalized_subject_key() {
    let server = spawn_server().await;
    let subject_id = insert_subject(&server.store, "Maria", "123.456.789-00", None).await;
    let mut ws = connect(server.addr).await;

    // Digits only on the wire; punctuation in the store.
    ws.send(Message::Text(
        r#"{"type":"register","cpf":"12345678900"}"#.into(),
    ))
    .await
    .unwrap();

    let reply = next_text(&mut ws).await.expect("registered frame expected");
    assert_eq!(reply, r#"{"type":"registered"}"#);
    assert!(server.registry.is_active(subject_id).await);

    // Media before start_call is dropped silently; the session stays up.
    ws.send(Message::Binary(vec![0u8; 320].into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.unwrap(), r#"{"type":"pong"}"#);

    // Orderly hangup deregisters.
    ws.send(Message::Text(r#"{"type":"hangup"}"#.into())).await.unwrap();
    assert!(closed(&mut ws).await);
    for _ in 0..20 {
        if !server.registry.is_active(subject_id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!server.registry.is_active(subject_id).await);
}

#[tokio::test]
async fn start_call_without_registration_is_refused() {
    let server = spawn_server().await;
    let mut ws = connect(server.addr).await;

    ws.send(Message::Text(r#"{"type":"start_call"}"#.into()))
        .await
        .unwrap();
    let reply = next_text(&mut ws).await.expect("error frame expected");
    assert!(reply.contains("register first"));

    // Still alive afterwards.
    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.unwrap(), r#"{"type":"pong"}"#);
}

#[tokio::test]
async fn new_registration_displaces_the_prior_session() {
    let server = spawn_server().await;
    let subject_id = insert_subject(&server.store, "Dora", "98765432100", None).await;

    let mut first = connect(server.addr).await;
    first
        .send(Message::Text(
            r#"{"type":"register","cpf":"98765432100"}"#.into(),
        ))
        .await
        .unwrap();
    assert_eq!(next_text(&mut first).await.unwrap(), r#"{"type":"registered"}"#);

    let mut second = connect(server.addr).await;
    second
        .send(Message::Text(
            r#"{"type":"register","cpf":"987.654.321-00"}"#.into(),
        ))
        .await
        .unwrap();
    assert_eq!(
        next_text(&mut second).await.unwrap(),
        r#"{"type":"registered"}"#
    );

    // The displaced transport closes promptly; the registry keeps exactly
    // one session for the subject, the new one.
    assert!(closed(&mut first).await, "first session must be closed");
    assert!(server.registry.is_active(subject_id).await);
    assert_eq!(server.registry.active_count().await, 1);

    // The survivor still answers.
    second
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut second).await.unwrap(), r#"{"type":"pong"}"#);
}

#[tokio::test]
async fn admin_surface_reports_health_stats_and_logs() {
    let server = spawn_server().await;

    let client = reqwest::Client::new();
    let base = format!("http://{}", server.addr);

    let response = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    let response = client.get(format!("{}/stats", base)).send().await.unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["active_clients"], 0);
    assert_eq!(body["db_status"], true);
    assert_eq!(body["push_status"], false);
    assert!(body["uptime"].as_str().unwrap().ends_with('s'));
    assert!(body["timestamp"].is_i64());

    let response = client.get(format!("{}/logs", base)).send().await.unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["logs"].is_array());
}
