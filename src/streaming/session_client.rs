//! Session socket client
//!
//! Manages the WebSocket lifecycle for one call.
//!
//! # Connection Flow
//!
//! 1. `SessionClient::open()` - connect, send `auth` first, wait for `auth_success`
//! 2. `ConnectionSender::send()` - queue frames for the writer task (Ready only)
//! 3. `InboundStream::next()` - server messages in wire order, then one terminal error
//! 4. `SessionConnection::close()` - drop queued audio, flush control frames, close
//!
//! # States
//!
//! `Idle → Connecting → AwaitingAuth → Ready → Closed`, shared by the reader
//! task, the writer task and every sender. Nothing reopens a closed
//! connection.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{session_socket_url, ClientMessage, ServerMessage, DEFAULT_SOCKET_URL};
use super::SessionError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for `auth_success` after the token is sent
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound messages buffered between the reader task and the consumer
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingAuth,
    Ready,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::AwaitingAuth,
            3 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::AwaitingAuth => 2,
            ConnectionState::Ready => 3,
            ConnectionState::Closed => 4,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingAuth => "awaiting_auth",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Connection state shared across tasks
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    closing: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Idle.as_u8()),
            closing: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        if previous != state {
            log::debug!("Session socket: {} → {}", previous, state);
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Returns false if the connection was already closing
    fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}

/// Endpoint and timeouts for a session socket
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `wss://host`; `/api/ws/{session_id}` is appended
    pub socket_url: String,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            connect_timeout: CONNECTION_TIMEOUT,
            auth_timeout: AUTH_TIMEOUT,
        }
    }
}

/// Result of feeding one frame to the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum Handshake {
    Authenticated,
    /// Control frame (ping/pong), keep waiting
    Continue,
    Rejected(SessionError),
}

/// Classify a frame received while waiting for `auth_success`
pub fn handshake_step(frame: &Message) -> Handshake {
    match frame {
        Message::Text(text) => match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::AuthSuccess) => Handshake::Authenticated,
            Ok(ServerMessage::Error { message }) => {
                Handshake::Rejected(SessionError::AuthenticationFailed(message))
            }
            Ok(other) => Handshake::Rejected(SessionError::ProtocolViolation(format!(
                "received {} before auth_success",
                other.kind()
            ))),
            Err(e) => Handshake::Rejected(SessionError::ProtocolViolation(format!(
                "malformed frame before auth_success: {}",
                e
            ))),
        },
        Message::Binary(_) => Handshake::Rejected(SessionError::ProtocolViolation(
            "binary frame before auth_success".to_string(),
        )),
        Message::Close(frame) => {
            Handshake::Rejected(SessionError::AuthenticationFailed(describe_close(frame)))
        }
        _ => Handshake::Continue,
    }
}

fn describe_close(frame: &Option<CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) => format!("closed by server ({}: {})", u16::from(frame.code), frame.reason),
        None => "closed by server".to_string(),
    }
}

enum WriterCommand {
    Frame(ClientMessage),
    Close,
}

/// Cloneable handle for queuing outbound frames
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl ConnectionSender {
    /// Queue a frame. Fails unless the connection is `Ready` and not closing.
    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        let state = self.shared.state();
        if state != ConnectionState::Ready || self.shared.is_closing() {
            return Err(SessionError::NotReady(state));
        }

        self.commands
            .send(WriterCommand::Frame(message))
            .map_err(|_| SessionError::SendFailed("writer stopped".to_string()))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

/// Server messages for one connection
///
/// Yields messages in wire order, then exactly one terminal error when the
/// connection ends, then `None`.
pub struct InboundStream {
    rx: mpsc::Receiver<Result<ServerMessage, SessionError>>,
    finished: bool,
}

impl InboundStream {
    pub async fn next(&mut self) -> Option<Result<ServerMessage, SessionError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(message)) => Some(Ok(message)),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

pub struct SessionClient;

impl SessionClient {
    /// Connect and authenticate.
    ///
    /// # Returns
    /// * `Ok(SessionConnection)` - authenticated, state `Ready`
    /// * `Err(SessionError)` - connect, auth or protocol failure; socket closed
    pub async fn open(
        config: &ClientConfig,
        session_id: &str,
        token: &str,
    ) -> Result<SessionConnection, SessionError> {
        if token.is_empty() {
            return Err(SessionError::MissingToken);
        }

        let shared = Arc::new(Shared::new());
        shared.set(ConnectionState::Connecting);

        let url = session_socket_url(&config.socket_url, session_id);
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to session {}...", session_id);

        let connected = timeout(
            config.connect_timeout,
            connect_async_with_config(request, None, true),
        )
        .await;

        let (socket, _response) = match connected {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                shared.set(ConnectionState::Closed);
                return Err(SessionError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                shared.set(ConnectionState::Closed);
                return Err(SessionError::ConnectionFailed(
                    "Connection timeout".to_string(),
                ));
            }
        };

        let (mut write, mut read) = socket.split();
        shared.set(ConnectionState::AwaitingAuth);

        if let Err(e) = authenticate(config.auth_timeout, &mut write, &mut read, token).await {
            shared.set(ConnectionState::Closed);
            if e.is_protocol_violation() {
                log::warn!("Session {}: {}", session_id, e);
            }
            if let Err(close_err) = write.close().await {
                log::debug!("Error closing socket after failed auth: {}", close_err);
            }
            return Err(e);
        }

        shared.set(ConnectionState::Ready);
        log::info!("Session {} authenticated", session_id);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(run_writer(write, commands_rx, shared.clone()));
        let reader_task = tokio::spawn(run_reader(
            read,
            inbound_tx,
            shared.clone(),
            commands_tx.clone(),
        ));

        Ok(SessionConnection {
            session_id: session_id.to_string(),
            shared,
            commands: commands_tx,
            inbound: Some(InboundStream {
                rx: inbound_rx,
                finished: false,
            }),
            reader_task,
        })
    }
}

async fn authenticate(
    auth_timeout: Duration,
    write: &mut SplitSink<Socket, Message>,
    read: &mut SplitStream<Socket>,
    token: &str,
) -> Result<(), SessionError> {
    let auth = serde_json::to_string(&ClientMessage::Auth {
        token: token.to_string(),
    })
    .map_err(|e| SessionError::SendFailed(e.to_string()))?;

    write
        .send(Message::Text(auth))
        .await
        .map_err(|e| SessionError::SendFailed(e.to_string()))?;

    log::debug!("Auth sent, waiting for auth_success...");

    timeout(auth_timeout, async {
        while let Some(frame) = read.next().await {
            let frame = frame.map_err(|e| SessionError::Disconnected(e.to_string()))?;
            match handshake_step(&frame) {
                Handshake::Authenticated => return Ok(()),
                Handshake::Continue => {}
                Handshake::Rejected(e) => return Err(e),
            }
        }
        Err(SessionError::AuthenticationFailed(
            "connection closed before auth_success".to_string(),
        ))
    })
    .await
    .map_err(|_| {
        SessionError::AuthenticationFailed("timed out waiting for auth_success".to_string())
    })?
}

async fn run_writer(
    mut write: SplitSink<Socket, Message>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Arc<Shared>,
) {
    let mut dropped_audio: u64 = 0;

    while let Some(command) = commands.recv().await {
        let message = match command {
            WriterCommand::Frame(message) => message,
            WriterCommand::Close => break,
        };

        if shared.state() == ConnectionState::Closed {
            break;
        }
        if shared.is_closing() && message.is_audio() {
            dropped_audio += 1;
            continue;
        }

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize {} frame: {}", message.kind(), e);
                continue;
            }
        };

        if let Err(e) = write.send(Message::Text(json)).await {
            log::warn!("Session socket write failed: {}", e);
            shared.set(ConnectionState::Closed);
            break;
        }
    }

    if dropped_audio > 0 {
        log::debug!("Discarded {} queued audio frames on close", dropped_audio);
    }

    shared.set(ConnectionState::Closed);
    if let Err(e) = write.close().await {
        log::debug!("Error closing session socket: {}", e);
    }
    log::debug!("Writer task exiting");
}

async fn run_reader(
    mut read: SplitStream<Socket>,
    inbound: mpsc::Sender<Result<ServerMessage, SessionError>>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
) {
    let terminal = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Unknown) => {
                    log::debug!("Ignoring unknown server message: {}", text);
                }
                Ok(message) => {
                    if inbound.send(Ok(message)).await.is_err() {
                        log::debug!("Inbound consumer gone");
                        break None;
                    }
                }
                Err(e) => {
                    break Some(SessionError::ProtocolViolation(format!(
                        "malformed frame: {}",
                        e
                    )))
                }
            },
            Some(Ok(Message::Binary(_))) => {
                break Some(SessionError::ProtocolViolation(
                    "unexpected binary frame".to_string(),
                ))
            }
            Some(Ok(Message::Close(frame))) => {
                break Some(SessionError::Disconnected(describe_close(&frame)))
            }
            Some(Ok(_)) => {} // ping/pong
            Some(Err(e)) => break Some(SessionError::Disconnected(e.to_string())),
            None => break Some(SessionError::Disconnected("stream ended".to_string())),
        }
    };

    let voluntary = shared.is_closing();
    shared.set(ConnectionState::Closed);
    let _ = commands.send(WriterCommand::Close);

    if let Some(err) = terminal {
        if err.is_protocol_violation() {
            log::warn!("Closing session socket: {}", err);
        } else if voluntary {
            log::debug!("Session socket closed: {}", err);
        } else {
            log::info!("Session socket closed: {}", err);
        }
        let _ = inbound.send(Err(err)).await;
    }
    log::debug!("Reader task exiting");
}

/// An authenticated session socket
pub struct SessionConnection {
    session_id: String,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
    inbound: Option<InboundStream>,
    reader_task: JoinHandle<()>,
}

impl SessionConnection {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            shared: self.shared.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Take the inbound stream. Returns `None` once taken.
    pub fn take_inbound(&mut self) -> Option<InboundStream> {
        self.inbound.take()
    }

    /// Begin a graceful close.
    ///
    /// Audio frames still queued are discarded, other queued frames are
    /// written, then a close frame is sent. Idempotent.
    pub fn close(&self) {
        if !self.shared.mark_closing() {
            return;
        }
        log::info!("Closing session {}", self.session_id);
        let _ = self.commands.send(WriterCommand::Close);
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.close();
        self.reader_task.abort();
    }
}
