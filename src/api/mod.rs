//! Concierge backend REST API.
//!
//! This module provides:
//! - Session listing and creation
//! - The per-session list of outbound calls and their details
//! - Stored conversation history for a session
//!
//! Every request carries the same bearer token as the session socket.

mod client;
mod types;

pub use client::{ApiClient, DEFAULT_BACKEND_URL};
pub use types::{CallDetail, CallSummary, SessionSummary, TranscriptLine};

#[derive(Debug, Clone)]
pub enum ApiError {
    MissingToken,
    Network(String),
    Unauthorized,
    NotFound,
    Status { code: u16, detail: String },
    Parse(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::MissingToken => write!(f, "Not signed in"),
            ApiError::Network(e) => write!(f, "Network error: {}", e),
            ApiError::Unauthorized => write!(f, "Token rejected by backend"),
            ApiError::NotFound => write!(f, "Not found"),
            ApiError::Status { code, detail } => write!(f, "API error {}: {}", code, detail),
            ApiError::Parse(e) => write!(f, "Failed to parse response: {}", e),
        }
    }
}

impl std::error::Error for ApiError {}
