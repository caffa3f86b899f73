//! Conversation side of the session loop
//!
//! `SessionCore` wraps the reducer with the state it does not own: the
//! transcript reconciler, the playback queue, the candidate list and the
//! calls list. Conversation effects are applied here, in the order the
//! reducer produced them; I/O effects are handed back to the caller.

use serde_json::Value;
use uuid::Uuid;

use crate::api::CallSummary;
use crate::audio::{AudioChunk, PlaybackQueue};
use crate::conversation::{FinalizeOutcome, History, TranscriptReconciler, Utterance};
use crate::metrics::MetricsCollector;
use crate::state_machine::{reduce, Effect, Event, State, CALL_ENDED, CONVERSATION_ENDED};
use crate::streaming::{parse_candidates, Business, Speaker};

pub struct SessionCore {
    state: State,
    /// Session the conversation belongs to, kept across calls
    session_id: Option<String>,
    reconciler: TranscriptReconciler,
    playback: PlaybackQueue,
    candidates: Vec<Business>,
    calls: Vec<CallSummary>,
    metrics: MetricsCollector,
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            state: State::default(),
            session_id: None,
            reconciler: TranscriptReconciler::new(),
            playback: PlaybackQueue::new(),
            candidates: Vec::new(),
            calls: Vec::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Start from a conversation fetched for `session_id`.
    ///
    /// A later call in the same session keeps this history.
    pub fn with_history(session_id: &str, history: History) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            reconciler: TranscriptReconciler::with_history(history),
            ..Self::new()
        }
    }

    /// Run one event through the reducer and apply its conversation effects.
    ///
    /// Returns the I/O effects (plus `EmitUi`) in order.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let (next, effects) = reduce(&self.state, event);

        if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
            log::info!("State transition: {:?} -> {:?}", self.state, next);
            if matches!(
                (&self.state, &next),
                (State::Connecting { .. }, State::Ready { .. })
            ) {
                self.metrics.connected();
            }
        }
        self.state = next;

        let mut out = Vec::with_capacity(effects.len());
        for effect in effects {
            self.apply(effect, &mut out);
        }
        out
    }

    fn apply(&mut self, effect: Effect, out: &mut Vec<Effect>) {
        match effect {
            Effect::BindConversation {
                call_id,
                session_id,
            } => {
                if self.session_id.as_deref() != Some(session_id.as_str()) {
                    log::info!("Switching conversation to session {}", session_id);
                    self.reconciler.reset(History::new());
                    self.candidates.clear();
                    self.calls.clear();
                    self.session_id = Some(session_id.clone());
                }
                self.playback.interrupt();
                self.metrics.start_call(call_id, &session_id);
            }
            Effect::ApplyTranscript { speaker, text } => {
                self.metrics.fragment_received();
                if let Some(outcome) = self.reconciler.apply_fragment(speaker, &text) {
                    self.record(outcome);
                }
            }
            Effect::FinalizeUtterance => {
                let outcome = self.reconciler.finalize();
                self.record(outcome);
            }
            Effect::SubmitText { text } => self.reconciler.submit_text(&text),
            Effect::EnqueueAudio {
                call_id,
                data,
                sample_rate,
                channels,
                bits_per_sample,
            } => {
                let decoded = AudioChunk::from_base64(&data, sample_rate, channels, bits_per_sample)
                    .and_then(|chunk| chunk.decode());
                match decoded {
                    Ok(audio) => {
                        if let Some(chunk) = self.playback.enqueue(audio) {
                            out.push(Effect::PlayChunk { call_id, chunk });
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping inbound audio chunk: {}", e);
                        self.metrics.decode_error(e.to_string());
                    }
                }
            }
            Effect::InterruptPlayback { call_id } => {
                if self.playback.interrupt() {
                    out.push(Effect::StopPlayback { call_id });
                }
            }
            Effect::AdvancePlayback {
                call_id,
                chunk_id,
                failed,
            } => {
                if self.playback.current() == Some(chunk_id) {
                    if failed {
                        self.metrics
                            .playback_error(format!("chunk {} failed to play", chunk_id));
                    } else {
                        self.metrics.chunk_played();
                    }
                }
                if let Some(chunk) = self.playback.complete(chunk_id) {
                    out.push(Effect::PlayChunk { call_id, chunk });
                }
            }
            Effect::UpdateCandidates { payload } => self.update_candidates(&payload),
            Effect::UpdateCalls { session_id, calls } => {
                if self.session_id.as_deref() == Some(session_id.as_str()) {
                    self.calls = calls;
                } else {
                    log::debug!("Ignoring calls for inactive session {}", session_id);
                }
            }
            Effect::ReleaseCall { call_id } => {
                let (success, reason) = match &self.state {
                    State::Closed { message } => (
                        message == CALL_ENDED || message == CONVERSATION_ENDED,
                        message.clone(),
                    ),
                    _ => (true, "Replaced by a new call".to_string()),
                };
                self.metrics.end_call(success, &reason);
                out.push(Effect::ReleaseCall { call_id });
            }
            other => out.push(other),
        }
    }

    fn record(&mut self, outcome: FinalizeOutcome) {
        if outcome.is_duplicate() {
            log::debug!("DuplicateSuppressed: {:?}", outcome);
        }
        self.metrics.finalized(outcome);
    }

    fn update_candidates(&mut self, payload: &Value) {
        self.candidates = parse_candidates(payload);
        log::info!("Candidates updated: {} businesses", self.candidates.len());
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.state.call_id()
    }

    pub fn live(&self) -> Option<&Utterance> {
        self.reconciler.live()
    }

    pub fn live_speaker(&self) -> Option<Speaker> {
        self.reconciler.live().map(|u| u.speaker)
    }

    pub fn history(&self) -> &History {
        self.reconciler.history()
    }

    pub fn candidates(&self) -> &[Business] {
        &self.candidates
    }

    pub fn calls(&self) -> &[CallSummary] {
        &self.calls
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}
