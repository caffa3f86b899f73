//! REST client for sessions, calls and stored conversations.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;

use super::types::{
    CallDetail, CallSummary, CallsResponse, ConversationResponse, ErrorBody, SessionSummary,
    SessionsResponse,
};
use super::ApiError;
use crate::conversation::{history_from_transcript, History, Utterance};

/// Backend used when no override is configured
pub const DEFAULT_BACKEND_URL: &str = "https://nlpconnector.web.app";

/// Global HTTP client for reuse across requests
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build configured HTTP client ({}), using defaults", e);
                Client::new()
            })
    })
}

/// Authenticated client for the concierge backend
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        if token.is_empty() {
            return Err(ApiError::MissingToken);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, ApiError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, ApiError> {
        let response = self.send(get_http_client().get(self.url(path)), what).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("{}: {}", what, e)))
    }

    /// `GET /api/sessions`
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        let body: SessionsResponse = self.get_json("/api/sessions", "list sessions").await?;
        Ok(body.sessions)
    }

    /// `POST /api/sessions`
    pub async fn create_session(&self) -> Result<SessionSummary, ApiError> {
        let response = self
            .send(
                get_http_client().post(self.url("/api/sessions")),
                "create session",
            )
            .await?;
        let session: SessionSummary = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("create session: {}", e)))?;
        log::info!("Created session {}", session.session_id);
        Ok(session)
    }

    /// `GET /api/sessions/{id}/calls`
    pub async fn list_calls(&self, session_id: &str) -> Result<Vec<CallSummary>, ApiError> {
        let path = format!("/api/sessions/{}/calls", session_id);
        let body: CallsResponse = self.get_json(&path, "list calls").await?;
        Ok(body.calls)
    }

    /// `GET /api/calls/{id}`
    pub async fn get_call_detail(&self, call_id: &str) -> Result<CallDetail, ApiError> {
        let path = format!("/api/calls/{}", call_id);
        self.get_json(&path, "call detail").await
    }

    /// `GET /api/sessions/{id}/conversation`, as turns.
    ///
    /// A session with no stored conversation (404) yields an empty history.
    pub async fn get_conversation(&self, session_id: &str) -> Result<History, ApiError> {
        let path = format!("/api/sessions/{}/conversation", session_id);
        let body: ConversationResponse = match self.get_json(&path, "conversation").await {
            Ok(body) => body,
            Err(ApiError::NotFound) => return Ok(History::new()),
            Err(e) => return Err(e),
        };

        let lines: Vec<Utterance> = body
            .conversation
            .iter()
            .filter_map(|line| line.to_utterance())
            .collect();
        Ok(history_from_transcript(&lines))
    }
}

fn error_for_status(status: StatusCode, body: &str) -> ApiError {
    match status.as_u16() {
        401 | 403 => ApiError::Unauthorized,
        404 => ApiError::NotFound,
        _ => {
            let detail = serde_json::from_str::<ErrorBody>(body)
                .ok()
                .and_then(|b| b.detail)
                .unwrap_or_else(|| body.to_string());
            ApiError::Status {
                code: status.as_u16(),
                detail,
            }
        }
    }
}
