//! Session socket tests against a loopback WebSocket server.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use scout_voice::streaming::{
    ClientConfig, ClientMessage, ConnectionState, ServerMessage, SessionClient, SessionError,
    Speaker,
};

type ServerSocket = WebSocketStream<TcpStream>;

/// Accept one connection and hand it to `handler`. Returns the base URL.
async fn serve_once<F, Fut>(handler: F) -> (ClientConfig, JoinHandle<()>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });

    let config = ClientConfig {
        socket_url: format!("ws://{}", addr),
        connect_timeout: Duration::from_secs(2),
        auth_timeout: Duration::from_secs(2),
    };
    (config, server)
}

async fn next_json(ws: &mut ServerSocket) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn send_json(ws: &mut ServerSocket, json: &str) {
    ws.send(Message::Text(json.to_string())).await.unwrap();
}

/// Check the auth frame and acknowledge it
async fn accept_auth(ws: &mut ServerSocket) {
    let auth = next_json(ws).await.expect("auth frame");
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["token"], "tok");
    send_json(ws, r#"{"type":"auth_success"}"#).await;
}

#[tokio::test]
async fn auth_is_first_frame_then_ready() {
    let (config, server) = serve_once(|mut ws| async move {
        accept_auth(&mut ws).await;
        let start = next_json(&mut ws).await.expect("start frame");
        assert_eq!(start["type"], "start");
    })
    .await;

    let connection = SessionClient::open(&config, "sess-1", "tok").await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(connection.session_id(), "sess-1");

    connection.sender().send(ClientMessage::Start).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn rejected_token_fails_authentication() {
    let (config, _server) = serve_once(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, r#"{"type":"error","message":"Invalid token"}"#).await;
        let _ = ws.close(None).await;
    })
    .await;

    match SessionClient::open(&config, "sess", "tok").await {
        Err(SessionError::AuthenticationFailed(msg)) => assert!(msg.contains("Invalid token")),
        other => panic!("expected AuthenticationFailed, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn message_before_auth_success_is_a_violation() {
    let (config, _server) = serve_once(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        send_json(&mut ws, r#"{"type":"turn_complete"}"#).await;
        let _ = next_json(&mut ws).await;
    })
    .await;

    let result = SessionClient::open(&config, "sess", "tok").await;
    assert!(matches!(result, Err(SessionError::ProtocolViolation(_))));
}

#[tokio::test]
async fn inbound_messages_arrive_in_order_then_terminal_error() {
    let (config, _server) = serve_once(|mut ws| async move {
        accept_auth(&mut ws).await;
        send_json(&mut ws, r#"{"type":"transcription","role":"model","text":"Hello"}"#).await;
        send_json(&mut ws, r#"{"type":"some_future_message"}"#).await;
        send_json(&mut ws, r#"{"type":"turn_complete"}"#).await;
        let _ = ws.close(None).await;
    })
    .await;

    let mut connection = SessionClient::open(&config, "sess", "tok").await.unwrap();
    let mut inbound = connection.take_inbound().unwrap();
    assert!(connection.take_inbound().is_none());

    assert_eq!(
        inbound.next().await,
        Some(Ok(ServerMessage::Transcription {
            role: Speaker::Agent,
            text: "Hello".to_string()
        }))
    );
    assert_eq!(inbound.next().await, Some(Ok(ServerMessage::TurnComplete)));
    assert!(matches!(
        inbound.next().await,
        Some(Err(SessionError::Disconnected(_)))
    ));
    assert!(inbound.next().await.is_none());
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let (config, _server) = serve_once(|mut ws| async move {
        accept_auth(&mut ws).await;
        send_json(&mut ws, "{not json").await;
        // Client should close on us
        while next_json(&mut ws).await.is_some() {}
    })
    .await;

    let mut connection = SessionClient::open(&config, "sess", "tok").await.unwrap();
    let mut inbound = connection.take_inbound().unwrap();

    assert!(matches!(
        inbound.next().await,
        Some(Err(SessionError::ProtocolViolation(_)))
    ));
    assert!(inbound.next().await.is_none());

    let sender = connection.sender();
    assert!(matches!(
        sender.send(ClientMessage::Start),
        Err(SessionError::NotReady(ConnectionState::Closed))
    ));
}

#[tokio::test]
async fn close_flushes_end_before_close_frame() {
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<String>>();
    let (config, _server) = serve_once(|mut ws| async move {
        accept_auth(&mut ws).await;
        let mut kinds = Vec::new();
        while let Some(frame) = next_json(&mut ws).await {
            kinds.push(frame["type"].as_str().unwrap_or_default().to_string());
        }
        let _ = tx.send(kinds);
    })
    .await;

    let connection = SessionClient::open(&config, "sess", "tok").await.unwrap();
    let sender = connection.sender();
    sender
        .send(ClientMessage::Text {
            text: "hi".to_string(),
        })
        .unwrap();
    sender.send(ClientMessage::End).unwrap();
    connection.close();

    // Closing twice is harmless, and nothing more can be queued
    connection.close();
    assert!(sender.send(ClientMessage::End).is_err());

    let kinds = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kinds, vec!["text", "end"]);
}

#[tokio::test]
async fn missing_token_never_connects() {
    let config = ClientConfig {
        socket_url: "ws://127.0.0.1:9".to_string(),
        ..ClientConfig::default()
    };
    assert!(matches!(
        SessionClient::open(&config, "sess", "").await,
        Err(SessionError::MissingToken)
    ));
}
