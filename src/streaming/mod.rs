//! Session socket for the concierge backend
//!
//! One WebSocket per call carries both directions of the conversation:
//! microphone audio and typed text out, transcripts, agent audio, candidate
//! businesses and turn control in.
//!
//! # Architecture
//!
//! ```text
//! Capture thread ──▶ AudioStreamer ──▶ resample (16kHz) ──▶ PCM16 ──▶ base64
//!                                                                   │
//!                                                                   ▼
//!                                   ConnectionSender ──▶ writer task ──▶ socket
//!                                                                   │
//!            session loop ◀── InboundStream ◀── reader task ◀───────┘
//! ```
//!
//! # Failure Policy
//!
//! - Authentication is the first frame; nothing else is sent until `auth_success`
//! - Malformed frames and transport closes are terminal for the connection
//! - No automatic reconnection; the user starts a new call

mod audio_streamer;
mod protocol;
mod session_client;

pub use audio_streamer::{spawn_streamer, AudioStreamer, StreamerConfig};
pub use protocol::{
    parse_candidates, session_socket_url, Business, ClientMessage, ServerMessage, Speaker,
    DEFAULT_SOCKET_URL,
};
pub use session_client::{
    handshake_step, ClientConfig, ConnectionSender, ConnectionState, Handshake, InboundStream,
    SessionClient, SessionConnection,
};

/// Errors that can occur on the session socket
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// No auth token available
    MissingToken,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Server rejected or never acknowledged the token
    AuthenticationFailed(String),
    /// Server sent something the protocol does not allow
    ProtocolViolation(String),
    /// Connection was closed by the server or the network
    Disconnected(String),
    /// Failed to hand a frame to the socket
    SendFailed(String),
    /// Frame submitted while the connection is not `Ready`
    NotReady(ConnectionState),
}

impl SessionError {
    /// Violations are logged and contained, never shown verbatim
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, SessionError::ProtocolViolation(_))
    }

    /// Socket-level failures surfaced to the user as status text
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectionFailed(_)
                | SessionError::Disconnected(_)
                | SessionError::SendFailed(_)
        )
    }

    /// Short human-readable status line for the UI
    pub fn status_message(&self) -> String {
        match self {
            SessionError::ProtocolViolation(_) => {
                "Connection closed: unexpected data from server".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MissingToken => {
                write!(
                    f,
                    "Not signed in. Run `scout-voice login` or set SCOUT_AUTH_TOKEN."
                )
            }
            SessionError::ConnectionFailed(e) => write!(f, "Failed to connect: {}", e),
            SessionError::AuthenticationFailed(e) => write!(f, "Authentication failed: {}", e),
            SessionError::ProtocolViolation(e) => write!(f, "Protocol violation: {}", e),
            SessionError::Disconnected(e) => write!(f, "Connection lost: {}", e),
            SessionError::SendFailed(e) => write!(f, "Failed to send: {}", e),
            SessionError::NotReady(state) => {
                write!(f, "Connection not ready (state: {})", state)
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::MissingToken;
        assert!(err.to_string().contains("SCOUT_AUTH_TOKEN"));

        let err = SessionError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = SessionError::NotReady(ConnectionState::AwaitingAuth);
        assert!(err.to_string().contains("awaiting_auth"));
    }

    #[test]
    fn test_session_error_classification() {
        assert!(SessionError::ProtocolViolation("x".into()).is_protocol_violation());
        assert!(!SessionError::ProtocolViolation("x".into()).is_transport());
        assert!(SessionError::Disconnected("reset".into()).is_transport());
        assert!(!SessionError::AuthenticationFailed("bad".into()).is_transport());
    }

    #[test]
    fn test_protocol_violation_status_hides_detail() {
        let err = SessionError::ProtocolViolation("expected value at line 1".into());
        assert!(!err.status_message().contains("line 1"));
        let err = SessionError::Disconnected("reset by peer".into());
        assert!(err.status_message().contains("reset by peer"));
    }
}
