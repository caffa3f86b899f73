pub mod api;
pub mod audio;
pub mod auth_token;
pub mod console;
pub mod conversation;
pub mod effects;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use api::CallSummary;
use conversation::{History, Utterance};
use effects::EffectRunner;
use session::SessionCore;
use state_machine::{CaptureState, Effect, Event, State};
use streaming::Business;

/// Capacity of the session event queue
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Call status shown to the user.
/// Uses tagged union format: { "status": "ready" } or { "status": "closed", "message": "..." }
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CallStatus {
    Disconnected,
    Connecting,
    Ready,
    Listening,
    MicrophoneUnavailable { reason: String },
    Closed { message: String },
}

/// Everything the front end renders
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(flatten)]
    pub status: CallStatus,
    pub session_id: Option<String>,
    /// Utterance still being transcribed
    pub live: Option<Utterance>,
    pub history: History,
    pub candidates: Vec<Business>,
    pub calls: Vec<CallSummary>,
    pub agent_speaking: bool,
}

fn status_for(state: &State) -> CallStatus {
    match state {
        State::Idle => CallStatus::Disconnected,
        State::Connecting { .. } => CallStatus::Connecting,
        State::Ready { capture, .. } => match capture {
            CaptureState::Live => CallStatus::Listening,
            CaptureState::Unavailable { reason } => CallStatus::MicrophoneUnavailable {
                reason: reason.clone(),
            },
            CaptureState::Off | CaptureState::Starting => CallStatus::Ready,
        },
        State::Closed { message } => CallStatus::Closed {
            message: message.clone(),
        },
    }
}

/// Snapshot the session for rendering
pub fn ui_state(core: &SessionCore) -> UiState {
    UiState {
        status: status_for(core.state()),
        session_id: core.session_id().map(str::to_string),
        live: core.live().cloned(),
        history: core.history().clone(),
        candidates: core.candidates().to_vec(),
        calls: core.calls().to_vec(),
        agent_speaking: core.playback().is_playing(),
    }
}

/// Where UI snapshots go (terminal, tests, ...)
pub trait UiSink: Send + Sync + 'static {
    fn render(&self, state: &UiState);
}

/// Run the session loop
///
/// Single consumer of the event queue: every state change, transcript
/// update and playback advance happens here, in arrival order. Returns the
/// core after `Exit` (once the exit teardown has run) or when every sender
/// is gone.
pub async fn run_session_loop(
    mut core: SessionCore,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui: Arc<dyn UiSink>,
) -> SessionCore {
    // Emit initial state
    ui.render(&ui_state(&core));
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);
        let exit = matches!(event, Event::Exit);

        for eff in core.handle(event) {
            match eff {
                Effect::EmitUi => ui.render(&ui_state(&core)),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        if exit {
            log::info!("Exit requested, shutting down session loop");
            break;
        }
    }

    log::info!("Session loop ended");
    core
}
