//! Session socket protocol types
//!
//! JSON messages exchanged with the concierge backend over
//! `wss://{host}/api/ws/{session_id}`. Every frame is a text frame holding one
//! object tagged by `type`.
//!
//! # Protocol Overview
//!
//! 1. Connect and send `auth` as the first frame
//! 2. Receive `auth_success`
//! 3. Send `start`, then stream `audio` and `text`
//! 4. Receive `transcription`, `audio`, `candidates` and turn control messages
//! 5. Send `end` and close

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Socket host used when no override is configured
pub const DEFAULT_SOCKET_URL: &str = "wss://backend-581277715925.us-central1.run.app";

/// Build the per-session socket URL
pub fn session_socket_url(base: &str, session_id: &str) -> String {
    format!("{}/api/ws/{}", base.trim_end_matches('/'), session_id)
}

// ============================================================================
// Client → Server Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bearer token, must be the first frame on the socket
    Auth { token: String },
    /// Begin the conversation once authenticated
    Start,
    /// Base64 PCM16 mono at 16 kHz
    Audio { data: String },
    /// Typed user message
    Text { text: String },
    /// Hang up
    End,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Start => "start",
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Text { .. } => "text",
            ClientMessage::End => "end",
        }
    }

    /// Audio frames are the only ones dropped when a connection is closing
    pub fn is_audio(&self) -> bool {
        matches!(self, ClientMessage::Audio { .. })
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Who produced a transcription fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    #[serde(alias = "model")]
    Agent,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Token accepted, the session is ready
    AuthSuccess,

    /// Incremental transcript fragment
    Transcription { role: Speaker, text: String },

    /// Agent speech
    Audio {
        data: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
        #[serde(rename = "bitsPerSample", default = "default_bits_per_sample")]
        bits_per_sample: u16,
    },

    /// Suggested businesses; payload shape varies, see [`parse_candidates`]
    Candidates {
        #[serde(default)]
        candidates: Value,
    },

    /// Agent finished its turn
    TurnComplete,

    /// User barged in, agent speech is void
    Interrupted,

    /// Stop playing queued agent audio
    StopAudio,

    /// Server ended the conversation
    ConversationEnded,

    /// Handshake or request failure
    Error {
        #[serde(default)]
        message: String,
    },

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

fn default_channels() -> u16 {
    1
}

fn default_bits_per_sample() -> u16 {
    16
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthSuccess => "auth_success",
            ServerMessage::Transcription { .. } => "transcription",
            ServerMessage::Audio { .. } => "audio",
            ServerMessage::Candidates { .. } => "candidates",
            ServerMessage::TurnComplete => "turn_complete",
            ServerMessage::Interrupted => "interrupted",
            ServerMessage::StopAudio => "stop_audio",
            ServerMessage::ConversationEnded => "conversation_ended",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// A business the agent is considering calling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

#[derive(Deserialize)]
struct WrappedBusinesses {
    businesses: Vec<Business>,
}

/// Extract businesses from a `candidates` payload.
///
/// The backend sends either `{"businesses": [...]}` or a bare array. Both are
/// accepted; the bare form and anything unrecognised are logged so the
/// schema drift can be chased upstream. Unrecognised payloads yield an empty
/// list.
pub fn parse_candidates(payload: &Value) -> Vec<Business> {
    if payload.is_object() {
        if let Ok(wrapped) = serde_json::from_value::<WrappedBusinesses>(payload.clone()) {
            return wrapped.businesses;
        }
    } else if payload.is_array() {
        if let Ok(list) = serde_json::from_value::<Vec<Business>>(payload.clone()) {
            log::info!(
                "candidates arrived as a bare array ({} entries), expected {{businesses: [...]}}",
                list.len()
            );
            return list;
        }
    }

    log::warn!("Unrecognised candidates payload, clearing list: {}", payload);
    Vec::new()
}
