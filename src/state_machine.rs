//! State machine for scout-voice calls
//!
//! This module implements the call lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! Effects come in two kinds. Conversation effects (transcript, playback
//! queue, candidates) are applied in order by `SessionCore` on the loop's
//! own thread; everything else is I/O handed to the `EffectRunner`.

use serde_json::Value;
use uuid::Uuid;

use crate::api::CallSummary;
use crate::audio::QueuedChunk;
use crate::streaming::{ClientMessage, ServerMessage, SessionError, Speaker};

/// Microphone status within a connected call
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureState {
    Off,
    Starting,
    Live,
    /// Device missing or denied; text still works
    Unavailable { reason: String },
}

/// Internal state of the call lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        call_id: Uuid,
        session_id: String,
        voice: bool,
    },
    Ready {
        call_id: Uuid,
        session_id: String,
        capture: CaptureState,
    },
    Closed {
        message: String,
    },
}

impl State {
    pub fn call_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { call_id, .. } | State::Ready { call_id, .. } => Some(*call_id),
            State::Idle | State::Closed { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            State::Connecting { session_id, .. } | State::Ready { session_id, .. } => {
                Some(session_id)
            }
            State::Idle | State::Closed { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.call_id().is_some()
    }
}

/// Events that can trigger state transitions.
/// These come from the user, the socket reader, the capture and output
/// devices, and the REST refresher.
#[derive(Debug, Clone)]
pub enum Event {
    // User intents
    StartCall {
        session_id: String,
        voice: bool,
    },
    EndCall,
    ToggleCapture,
    SendText {
        text: String,
    },
    /// Application exit requested
    Exit,

    // Connection events
    Connected {
        call_id: Uuid,
    },
    ConnectFailed {
        call_id: Uuid,
        err: SessionError,
    },
    Inbound {
        call_id: Uuid,
        message: ServerMessage,
    },
    ConnectionLost {
        call_id: Uuid,
        err: SessionError,
    },

    // Device events
    CaptureStarted {
        call_id: Uuid,
    },
    CaptureFailed {
        call_id: Uuid,
        err: String,
    },
    PlaybackFinished {
        call_id: Uuid,
        chunk_id: u64,
    },
    PlaybackFailed {
        call_id: Uuid,
        chunk_id: u64,
        err: String,
    },

    // REST
    CallsRefreshed {
        session_id: String,
        calls: Vec<CallSummary>,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    // ---- I/O, executed by the effect runner ----
    OpenConnection {
        call_id: Uuid,
        session_id: String,
    },
    StartCapture {
        call_id: Uuid,
    },
    StopCapture {
        call_id: Uuid,
    },
    Send {
        call_id: Uuid,
        message: ClientMessage,
    },
    CloseConnection {
        call_id: Uuid,
    },
    PlayChunk {
        call_id: Uuid,
        chunk: QueuedChunk,
    },
    StopPlayback {
        call_id: Uuid,
    },
    /// Drop every device and socket held for the call
    ReleaseCall {
        call_id: Uuid,
    },
    RefreshCalls {
        session_id: String,
    },
    /// Signal to render the UI state
    EmitUi,

    // ---- Conversation, applied by SessionCore ----
    BindConversation {
        call_id: Uuid,
        session_id: String,
    },
    ApplyTranscript {
        speaker: Speaker,
        text: String,
    },
    FinalizeUtterance,
    SubmitText {
        text: String,
    },
    EnqueueAudio {
        call_id: Uuid,
        data: String,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    },
    InterruptPlayback {
        call_id: Uuid,
    },
    AdvancePlayback {
        call_id: Uuid,
        chunk_id: u64,
        failed: bool,
    },
    UpdateCandidates {
        payload: Value,
    },
    UpdateCalls {
        session_id: String,
        calls: Vec<CallSummary>,
    },
}

/// Status line shown after a normal hang-up
pub const CALL_ENDED: &str = "Call ended";

/// Status line shown when the server ends the conversation
pub const CONVERSATION_ENDED: &str = "Conversation ended";

/// The teardown every exit path runs, in order
pub fn end_call_effects(call_id: Uuid, session_id: &str) -> Vec<Effect> {
    vec![
        Effect::FinalizeUtterance,
        Effect::StopCapture { call_id },
        Effect::Send {
            call_id,
            message: ClientMessage::End,
        },
        Effect::CloseConnection { call_id },
        Effect::InterruptPlayback { call_id },
        Effect::ReleaseCall { call_id },
        Effect::RefreshCalls {
            session_id: session_id.to_string(),
        },
    ]
}

fn start_call(session_id: String, voice: bool) -> (State, Vec<Effect>) {
    let call_id = Uuid::new_v4();
    (
        State::Connecting {
            call_id,
            session_id: session_id.clone(),
            voice,
        },
        vec![
            Effect::BindConversation {
                call_id,
                session_id: session_id.clone(),
            },
            Effect::OpenConnection {
                call_id,
                session_id,
            },
            Effect::EmitUi,
        ],
    )
}

fn end_call(call_id: Uuid, session_id: &str, message: String) -> (State, Vec<Effect>) {
    let mut effects = end_call_effects(call_id, session_id);
    effects.push(Effect::EmitUi);
    (State::Closed { message }, effects)
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale call IDs
/// - Every way out of an active call runs `end_call_effects`
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.call_id();

    // Helper: check if event's ID is stale (doesn't match current call)
    let is_stale = |eid: Uuid| current_id != Some(eid);

    match (state, event) {
        // -----------------
        // Starting a call
        // -----------------
        (State::Idle | State::Closed { .. }, StartCall { session_id, voice }) => {
            start_call(session_id, voice)
        }
        // Starting while active tears the old call down first
        (
            State::Connecting {
                call_id,
                session_id: old_session,
                ..
            }
            | State::Ready {
                call_id,
                session_id: old_session,
                ..
            },
            StartCall { session_id, voice },
        ) => {
            log::info!("Starting a new call, ending call {} first", call_id);
            let mut effects = end_call_effects(*call_id, old_session);
            let (next, start_effects) = start_call(session_id, voice);
            effects.extend(start_effects);
            (next, effects)
        }

        // -----------------
        // Connecting
        // -----------------
        (
            State::Connecting {
                call_id,
                session_id,
                voice,
            },
            Connected { call_id: id },
        ) if *call_id == id => {
            let capture = if *voice {
                CaptureState::Starting
            } else {
                CaptureState::Off
            };
            let mut effects = vec![Send {
                call_id: id,
                message: ClientMessage::Start,
            }];
            if *voice {
                effects.push(StartCapture { call_id: id });
            }
            effects.push(EmitUi);
            (
                State::Ready {
                    call_id: id,
                    session_id: session_id.clone(),
                    capture,
                },
                effects,
            )
        }
        (State::Connecting { call_id, session_id, .. }, ConnectFailed { call_id: id, err })
            if *call_id == id =>
        {
            log::warn!("Call {} failed to connect: {}", call_id, err);
            end_call(*call_id, session_id, err.status_message())
        }
        (State::Connecting { .. }, SendText { .. } | ToggleCapture) => {
            log::info!("Not connected yet, ignoring input");
            (state.clone(), vec![])
        }

        // -----------------
        // Ready
        // -----------------
        (
            State::Ready {
                call_id,
                session_id,
                capture,
            },
            ToggleCapture,
        ) => {
            let (capture, effect) = match capture {
                CaptureState::Off | CaptureState::Unavailable { .. } => (
                    CaptureState::Starting,
                    StartCapture { call_id: *call_id },
                ),
                CaptureState::Starting | CaptureState::Live => {
                    (CaptureState::Off, StopCapture { call_id: *call_id })
                }
            };
            (
                State::Ready {
                    call_id: *call_id,
                    session_id: session_id.clone(),
                    capture,
                },
                vec![effect, EmitUi],
            )
        }
        (
            State::Ready {
                call_id,
                session_id,
                capture,
            },
            CaptureStarted { call_id: id },
        ) if *call_id == id => {
            if *capture == CaptureState::Starting {
                (
                    State::Ready {
                        call_id: *call_id,
                        session_id: session_id.clone(),
                        capture: CaptureState::Live,
                    },
                    vec![EmitUi],
                )
            } else {
                // Toggled off while the device was opening
                (state.clone(), vec![StopCapture { call_id: id }])
            }
        }
        (
            State::Ready {
                call_id,
                session_id,
                capture,
            },
            CaptureFailed { call_id: id, err },
        ) if *call_id == id => {
            if *capture == CaptureState::Off {
                return (state.clone(), vec![]);
            }
            log::warn!("Microphone unavailable, continuing text-only: {}", err);
            (
                State::Ready {
                    call_id: *call_id,
                    session_id: session_id.clone(),
                    capture: CaptureState::Unavailable { reason: err },
                },
                vec![EmitUi],
            )
        }
        (
            State::Ready {
                call_id,
                session_id,
                ..
            },
            SendText { text },
        ) => {
            let text = text.trim().to_string();
            if text.is_empty() {
                return (state.clone(), vec![]);
            }
            (
                state.clone(),
                vec![
                    Send {
                        call_id: *call_id,
                        message: ClientMessage::Text { text: text.clone() },
                    },
                    SubmitText { text },
                    RefreshCalls {
                        session_id: session_id.clone(),
                    },
                    EmitUi,
                ],
            )
        }
        (
            State::Ready {
                call_id,
                session_id,
                ..
            },
            Inbound { call_id: id, message },
        ) if *call_id == id => reduce_inbound(state, id, session_id, message),
        (State::Ready { .. }, PlaybackFinished { call_id, chunk_id }) if !is_stale(call_id) => (
            state.clone(),
            vec![AdvancePlayback {
                call_id,
                chunk_id,
                failed: false,
            }],
        ),
        (
            State::Ready { .. },
            PlaybackFailed {
                call_id,
                chunk_id,
                err,
            },
        ) if !is_stale(call_id) => {
            log::warn!("Playback of chunk {} failed, skipping: {}", chunk_id, err);
            (
                state.clone(),
                vec![AdvancePlayback {
                    call_id,
                    chunk_id,
                    failed: true,
                }],
            )
        }

        // -----------------
        // Leaving an active call
        // -----------------
        (
            State::Connecting {
                call_id,
                session_id,
                ..
            }
            | State::Ready {
                call_id,
                session_id,
                ..
            },
            ConnectionLost { call_id: id, err },
        ) if *call_id == id => {
            if err.is_protocol_violation() {
                log::warn!("Call {} closed on protocol violation: {}", call_id, err);
            } else {
                log::info!("Call {} lost its connection: {}", call_id, err);
            }
            end_call(*call_id, session_id, err.status_message())
        }
        (
            State::Connecting {
                call_id,
                session_id,
                ..
            }
            | State::Ready {
                call_id,
                session_id,
                ..
            },
            EndCall | Exit,
        ) => end_call(*call_id, session_id, CALL_ENDED.to_string()),

        // -----------------
        // Any state
        // -----------------
        (_, CallsRefreshed { session_id, calls }) => {
            (state.clone(), vec![UpdateCalls { session_id, calls }, EmitUi])
        }
        (State::Idle | State::Closed { .. }, SendText { .. } | ToggleCapture) => {
            log::info!("No active call, ignoring input");
            (state.clone(), vec![])
        }

        // -----------------
        // Stale or unhandled events (drop silently)
        // -----------------
        (_, Connected { call_id } | CaptureStarted { call_id }) if is_stale(call_id) => {
            log::debug!("Ignoring stale event for call {}", call_id);
            (state.clone(), vec![])
        }
        _ => (state.clone(), vec![]),
    }
}

/// Handle one server message for the active call
fn reduce_inbound(
    state: &State,
    call_id: Uuid,
    session_id: &str,
    message: ServerMessage,
) -> (State, Vec<Effect>) {
    use Effect::*;

    match message {
        ServerMessage::Transcription { role, text } => (
            state.clone(),
            vec![
                ApplyTranscript {
                    speaker: role,
                    text,
                },
                EmitUi,
            ],
        ),
        ServerMessage::Audio {
            data,
            sample_rate,
            channels,
            bits_per_sample,
        } => (
            state.clone(),
            vec![EnqueueAudio {
                call_id,
                data,
                sample_rate,
                channels,
                bits_per_sample,
            }],
        ),
        ServerMessage::Candidates { candidates } => (
            state.clone(),
            vec![
                UpdateCandidates {
                    payload: candidates,
                },
                EmitUi,
            ],
        ),
        ServerMessage::TurnComplete => (
            state.clone(),
            vec![
                FinalizeUtterance,
                RefreshCalls {
                    session_id: session_id.to_string(),
                },
                EmitUi,
            ],
        ),
        ServerMessage::Interrupted => (
            state.clone(),
            vec![FinalizeUtterance, InterruptPlayback { call_id }, EmitUi],
        ),
        ServerMessage::StopAudio => (state.clone(), vec![InterruptPlayback { call_id }]),
        ServerMessage::ConversationEnded => {
            log::info!("Server ended the conversation");
            end_call(call_id, session_id, CONVERSATION_ENDED.to_string())
        }
        ServerMessage::Error { message } => {
            log::warn!("Server error during call: {}", message);
            (state.clone(), vec![])
        }
        ServerMessage::AuthSuccess | ServerMessage::Unknown => {
            log::debug!("Ignoring {} during call", message.kind());
            (state.clone(), vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(call_id: Uuid, capture: CaptureState) -> State {
        State::Ready {
            call_id,
            session_id: "sess".to_string(),
            capture,
        }
    }

    fn connecting(call_id: Uuid, voice: bool) -> State {
        State::Connecting {
            call_id,
            session_id: "sess".to_string(),
            voice,
        }
    }

    /// Position of the first effect matching `pred`
    fn position(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> usize {
        effects
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("effect not found in {:?}", effects))
    }

    fn assert_end_call_sequence(effects: &[Effect]) {
        let finalize = position(effects, |e| matches!(e, Effect::FinalizeUtterance));
        let stop = position(effects, |e| matches!(e, Effect::StopCapture { .. }));
        let end = position(effects, |e| {
            matches!(
                e,
                Effect::Send {
                    message: ClientMessage::End,
                    ..
                }
            )
        });
        let close = position(effects, |e| matches!(e, Effect::CloseConnection { .. }));
        let clear = position(effects, |e| matches!(e, Effect::InterruptPlayback { .. }));
        let release = position(effects, |e| matches!(e, Effect::ReleaseCall { .. }));
        assert!(finalize < stop && stop < end && end < close && close < clear && clear < release);
    }

    #[test]
    fn idle_start_call_opens_connection() {
        let (next, effects) = reduce(
            &State::Idle,
            Event::StartCall {
                session_id: "sess".to_string(),
                voice: true,
            },
        );
        assert!(matches!(next, State::Connecting { voice: true, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::OpenConnection { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::BindConversation { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitUi)));
    }

    #[test]
    fn connected_sends_start_and_starts_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id, true), Event::Connected { call_id: id });

        assert_eq!(next, ready(id, CaptureState::Starting));
        let start = position(&effects, |e| {
            matches!(
                e,
                Effect::Send {
                    message: ClientMessage::Start,
                    ..
                }
            )
        });
        let capture = position(&effects, |e| matches!(e, Effect::StartCapture { .. }));
        assert!(start < capture);
    }

    #[test]
    fn connected_text_only_skips_capture() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&connecting(id, false), Event::Connected { call_id: id });
        assert_eq!(next, ready(id, CaptureState::Off));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn stale_event_is_ignored() {
        let id = Uuid::new_v4();
        let state = connecting(id, true);
        let (next, effects) = reduce(
            &state,
            Event::Connected {
                call_id: Uuid::new_v4(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_inbound_after_new_call_is_ignored() {
        let id = Uuid::new_v4();
        let state = ready(id, CaptureState::Live);
        let (next, effects) = reduce(
            &state,
            Event::Inbound {
                call_id: Uuid::new_v4(),
                message: ServerMessage::Interrupted,
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn connect_failure_closes_with_status() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &connecting(id, true),
            Event::ConnectFailed {
                call_id: id,
                err: SessionError::AuthenticationFailed("Invalid token".to_string()),
            },
        );
        match next {
            State::Closed { message } => assert!(message.contains("Invalid token")),
            other => panic!("expected Closed, got {:?}", other),
        }
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseCall { .. })));
    }

    #[test]
    fn end_call_runs_full_teardown_in_order() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&ready(id, CaptureState::Live), Event::EndCall);
        assert_eq!(
            next,
            State::Closed {
                message: CALL_ENDED.to_string()
            }
        );
        assert_end_call_sequence(&effects);
    }

    #[test]
    fn every_exit_path_tears_down() {
        let id = Uuid::new_v4();
        let state = ready(id, CaptureState::Live);

        let exits = vec![
            Event::EndCall,
            Event::Exit,
            Event::ConnectionLost {
                call_id: id,
                err: SessionError::Disconnected("reset".to_string()),
            },
            Event::ConnectionLost {
                call_id: id,
                err: SessionError::ProtocolViolation("bad frame".to_string()),
            },
            Event::Inbound {
                call_id: id,
                message: ServerMessage::ConversationEnded,
            },
        ];

        for event in exits {
            let (next, effects) = reduce(&state, event);
            assert!(matches!(next, State::Closed { .. }));
            assert_end_call_sequence(&effects);
        }
    }

    #[test]
    fn start_call_while_active_tears_down_first() {
        let old = Uuid::new_v4();
        let (next, effects) = reduce(
            &ready(old, CaptureState::Live),
            Event::StartCall {
                session_id: "other".to_string(),
                voice: true,
            },
        );

        let new_id = match next {
            State::Connecting {
                call_id,
                ref session_id,
                ..
            } => {
                assert_eq!(session_id, "other");
                call_id
            }
            other => panic!("expected Connecting, got {:?}", other),
        };
        assert_ne!(new_id, old);

        let release = position(
            &effects,
            |e| matches!(e, Effect::ReleaseCall { call_id } if *call_id == old),
        );
        let open = position(
            &effects,
            |e| matches!(e, Effect::OpenConnection { call_id, .. } if *call_id == new_id),
        );
        assert!(release < open);
    }

    #[test]
    fn capture_failure_keeps_connection() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &ready(id, CaptureState::Starting),
            Event::CaptureFailed {
                call_id: id,
                err: "No audio input device found".to_string(),
            },
        );
        assert!(matches!(
            next,
            State::Ready {
                capture: CaptureState::Unavailable { .. },
                ..
            }
        ));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::CloseConnection { .. })));
    }

    #[test]
    fn toggle_capture_cycles() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&ready(id, CaptureState::Live), Event::ToggleCapture);
        assert_eq!(next, ready(id, CaptureState::Off));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));

        let (next, effects) = reduce(&next, Event::ToggleCapture);
        assert_eq!(next, ready(id, CaptureState::Starting));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn capture_started_after_toggle_off_is_stopped() {
        let id = Uuid::new_v4();
        let state = ready(id, CaptureState::Off);
        let (next, effects) = reduce(&state, Event::CaptureStarted { call_id: id });
        assert_eq!(next, state);
        assert!(matches!(effects.as_slice(), [Effect::StopCapture { .. }]));
    }

    #[test]
    fn send_text_sends_and_echoes() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(
            &ready(id, CaptureState::Off),
            Event::SendText {
                text: "  Find a dentist ".to_string(),
            },
        );
        let send = position(&effects, |e| {
            matches!(
                e,
                Effect::Send {
                    message: ClientMessage::Text { text },
                    ..
                } if text == "Find a dentist"
            )
        });
        let echo = position(&effects, |e| matches!(e, Effect::SubmitText { .. }));
        assert!(send < echo);
    }

    #[test]
    fn blank_text_is_ignored() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(
            &ready(id, CaptureState::Off),
            Event::SendText {
                text: "   ".to_string(),
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn interrupted_finalizes_and_clears_playback() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(
            &ready(id, CaptureState::Live),
            Event::Inbound {
                call_id: id,
                message: ServerMessage::Interrupted,
            },
        );
        let finalize = position(&effects, |e| matches!(e, Effect::FinalizeUtterance));
        let clear = position(&effects, |e| matches!(e, Effect::InterruptPlayback { .. }));
        assert!(finalize < clear);
    }

    #[test]
    fn playback_failure_still_advances() {
        let id = Uuid::new_v4();
        let (_, effects) = reduce(
            &ready(id, CaptureState::Live),
            Event::PlaybackFailed {
                call_id: id,
                chunk_id: 3,
                err: "device lost".to_string(),
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::AdvancePlayback {
                chunk_id: 3,
                failed: true,
                ..
            }]
        ));
    }

    #[test]
    fn end_call_when_idle_is_noop() {
        let (next, effects) = reduce(&State::Idle, Event::EndCall);
        assert_eq!(next, State::Idle);
        assert!(effects.is_empty());
    }
}
