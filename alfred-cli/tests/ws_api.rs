//! End-to-end tests for the WebSocket API.
//!
//! Each test spins up a real server on an ephemeral port and drives it with
//! a tungstenite client; the Twitch validation tests stand up a local stub
//! endpoint instead of talking to the real provider.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use alfred_cli::handlers::ws::{WsListener, WsSettings};
use alfred_cli::transactions::ClientTransactions;
use alfred_core::{ManualClock, Store};
use axum::routing::get as axum_get;
use axum::{Json, Router, http::HeaderMap, http::StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

struct Fixture {
    store: Arc<Store>,
    _dir: TempDir,
    ws: WsListener,
    url: String,
}

async fn start_server(document: &Value, mut settings: WsSettings) -> Fixture {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("Alfred.json");
    fs::write(&path, document.to_string()).expect("write store file");
    let store = Arc::new(Store::new());
    store
        .mobilize(&path, Arc::new(ManualClock::new(0.0)))
        .expect("mobilize");

    if settings.validate_url.is_empty() {
        settings.validate_url = "http://127.0.0.1:9/unused".to_owned();
    }
    let transactions =
        Arc::new(ClientTransactions::new(Duration::from_secs(2)).expect("http client"));
    let ws = WsListener::new(Arc::downgrade(&store), transactions, settings);
    let app = ws.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    Fixture {
        store,
        _dir: dir,
        ws,
        url: format!("ws://{addr}/ws"),
    }
}

fn settings(authentication_timeout: f64, close_linger: f64) -> WsSettings {
    WsSettings {
        max_frame_size: 65536,
        authentication_timeout,
        close_linger,
        validate_url: String::new(),
    }
}

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str) -> ClientSocket {
    let (socket, _response) = connect_async(url).await.expect("connect");
    socket
}

async fn next_frame(socket: &mut ClientSocket) -> Message {
    timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("frame before timeout")
        .expect("stream open")
        .expect("frame")
}

async fn next_json(socket: &mut ClientSocket) -> Value {
    match next_frame(socket).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).expect("json frame"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn send_json(socket: &mut ClientSocket, frame: &Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("send");
}

#[tokio::test]
async fn key_authentication_round_trip() {
    let fixture = start_server(
        &json!({"Roles": {"key:abc": ["editor"]}}),
        settings(5.0, 0.2),
    )
    .await;
    let mut socket = connect(&fixture.url).await;

    send_json(&mut socket, &json!({"type": "Authenticate", "key": "abc"})).await;
    assert_eq!(next_json(&mut socket).await, json!({"type": "Authenticated"}));
}

#[tokio::test]
async fn unknown_message_types_keep_the_session_open() {
    let fixture = start_server(
        &json!({"Roles": {"key:abc": ["editor"]}}),
        settings(5.0, 0.2),
    )
    .await;
    let mut socket = connect(&fixture.url).await;

    send_json(&mut socket, &json!({"type": "Bogus"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "Error", "message": "Unknown message type: Bogus"})
    );

    // Still open: authentication proceeds normally.
    send_json(&mut socket, &json!({"type": "Authenticate", "key": "abc"})).await;
    assert_eq!(next_json(&mut socket).await, json!({"type": "Authenticated"}));
}

#[tokio::test]
async fn malformed_messages_close_without_a_status_code() {
    let fixture = start_server(&json!({"Roles": {}}), settings(5.0, 0.2)).await;
    let mut socket = connect(&fixture.url).await;

    socket
        .send(Message::Text("definitely not json".into()))
        .await
        .expect("send");
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "Error", "message": "malformed message received"})
    );
    match next_frame(&mut socket).await {
        Message::Close(frame) => assert!(frame.is_none(), "server close carries no status"),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthenticated_sessions_time_out_and_linger() {
    let fixture = start_server(&json!({"Roles": {}}), settings(0.3, 0.3)).await;
    let mut socket = connect(&fixture.url).await;

    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "Error", "message": "Authentication timeout"})
    );
    match next_frame(&mut socket).await {
        Message::Close(frame) => assert!(frame.is_none()),
        other => panic!("expected a close frame, got {other:?}"),
    }

    // The record lingers briefly after the close, then is erased.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.ws.session_count(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.ws.session_count(), 0);
}

#[tokio::test]
async fn reauthentication_closes_the_session() {
    let fixture = start_server(
        &json!({"Roles": {"key:abc": ["editor"]}}),
        settings(5.0, 0.2),
    )
    .await;
    let mut socket = connect(&fixture.url).await;

    send_json(&mut socket, &json!({"type": "Authenticate", "key": "abc"})).await;
    assert_eq!(next_json(&mut socket).await, json!({"type": "Authenticated"}));

    send_json(&mut socket, &json!({"type": "Authenticate", "key": "abc"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "Error", "message": "reauthentication is not allowed"})
    );
    match next_frame(&mut socket).await {
        Message::Close(_) => {}
        other => panic!("expected a close frame, got {other:?}"),
    }
}

async fn start_validation_stub() -> String {
    let app = Router::new().route(
        "/oauth2/validate",
        axum_get(|headers: HeaderMap| async move {
            let authorized = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                == Some("OAuth good-token");
            if authorized {
                (StatusCode::OK, Json(json!({"user_id": "1234"})))
            } else {
                (StatusCode::UNAUTHORIZED, Json(json!({"message": "invalid"})))
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    format!("http://{addr}/oauth2/validate")
}

#[tokio::test]
async fn twitch_authentication_validates_out_of_band() {
    let validate_url = start_validation_stub().await;
    let mut ws_settings = settings(5.0, 0.2);
    ws_settings.validate_url = validate_url;
    let fixture = start_server(&json!({"Roles": {"twitch:1234": ["viewer"]}}), ws_settings).await;
    let mut socket = connect(&fixture.url).await;

    send_json(
        &mut socket,
        &json!({"type": "Authenticate", "twitch": "good-token"}),
    )
    .await;
    assert_eq!(next_json(&mut socket).await, json!({"type": "Authenticated"}));
}

#[tokio::test]
async fn rejected_twitch_tokens_close_the_session() {
    let validate_url = start_validation_stub().await;
    let mut ws_settings = settings(5.0, 0.2);
    ws_settings.validate_url = validate_url;
    let fixture = start_server(&json!({"Roles": {"twitch:1234": ["viewer"]}}), ws_settings).await;
    let mut socket = connect(&fixture.url).await;

    send_json(
        &mut socket,
        &json!({"type": "Authenticate", "twitch": "bad-token"}),
    )
    .await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "Error", "message": "token validation returned 401 Unauthorized"})
    );
    match next_frame(&mut socket).await {
        Message::Close(_) => {}
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn plain_http_requests_get_426() {
    let fixture = start_server(&json!({"Roles": {}}), settings(5.0, 0.2)).await;
    let url = fixture.url.replace("ws://", "http://");

    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UPGRADE_REQUIRED);
    assert_eq!(
        response
            .headers()
            .get("upgrade")
            .and_then(|value| value.to_str().ok()),
        Some("websocket")
    );
}

#[tokio::test]
async fn upgrades_after_shutdown_answer_503() {
    let fixture = start_server(&json!({"Roles": {}}), settings(5.0, 0.2)).await;
    let url = fixture.url.clone();
    drop(fixture.store);

    let refused = connect_async(&url).await.expect_err("upgrade refused");
    match refused {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_handshakes_get_426_even_during_shutdown() {
    let fixture = start_server(&json!({"Roles": {}}), settings(5.0, 0.2)).await;
    let url = fixture.url.replace("ws://", "http://");
    drop(fixture.store);

    let response = reqwest::get(&url).await.expect("request");
    assert_eq!(response.status(), reqwest::StatusCode::UPGRADE_REQUIRED);
}
