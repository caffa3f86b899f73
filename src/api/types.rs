//! Data structures for the sessions/calls REST endpoints.

use serde::{Deserialize, Serialize};

use crate::conversation::Utterance;
use crate::streaming::Speaker;

/// A concierge request (one conversation the user can call into)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SessionSummary {
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or("New Voice Request")
    }
}

/// An outbound phone call the agent placed on the user's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    #[serde(default)]
    pub biz_name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub outcome_summary: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
}

/// One line of a stored transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

impl TranscriptLine {
    /// Map the stored role onto a speaker; unknown roles are skipped
    pub fn to_utterance(&self) -> Option<Utterance> {
        let speaker = match self.role.as_str() {
            "user" => Speaker::User,
            "agent" | "model" => Speaker::Agent,
            other => {
                log::debug!("Skipping transcript line with role {:?}", other);
                return None;
            }
        };
        Some(Utterance::new(speaker, self.text.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDetail {
    #[serde(flatten)]
    pub call: CallSummary,
    #[serde(default)]
    pub transcript: Vec<TranscriptLine>,
}

// ============================================================================
// Response envelopes
// ============================================================================

#[derive(Debug, Deserialize)]
pub(super) struct SessionsResponse {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CallsResponse {
    #[serde(default)]
    pub calls: Vec<CallSummary>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ConversationResponse {
    #[serde(default)]
    pub conversation: Vec<TranscriptLine>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorBody {
    pub detail: Option<String>,
}
