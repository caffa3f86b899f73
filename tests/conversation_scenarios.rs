//! End-to-end conversation scenarios through the session loop, with a
//! scripted effect runner standing in for the socket and audio devices.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use scout_voice::audio::pcm::{encode_base64, encode_pcm16};
use scout_voice::conversation::{AgentText, HistoryEntry};
use scout_voice::effects::EffectRunner;
use scout_voice::session::SessionCore;
use scout_voice::state_machine::{Effect, Event, State};
use scout_voice::streaming::{ClientMessage, ServerMessage, Speaker};
use scout_voice::{run_session_loop, CallStatus, UiSink, UiState, EVENT_QUEUE_CAPACITY};

/// Acknowledges connections immediately and records everything else
#[derive(Default)]
struct ScriptedRunner {
    effects: Mutex<Vec<Effect>>,
}

impl ScriptedRunner {
    fn effects(&self) -> Vec<Effect> {
        self.effects.lock().unwrap().clone()
    }

    fn sent(&self) -> Vec<&'static str> {
        self.effects()
            .iter()
            .filter_map(|e| match e {
                Effect::Send { message, .. } => Some(message.kind()),
                _ => None,
            })
            .collect()
    }
}

impl EffectRunner for ScriptedRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        if let Effect::OpenConnection { call_id, .. } = &effect {
            let call_id = *call_id;
            tokio::spawn(async move {
                let _ = tx.send(Event::Connected { call_id }).await;
            });
        }
        self.effects.lock().unwrap().push(effect);
    }
}

#[derive(Default)]
struct LastUi(Mutex<Option<UiState>>);

impl UiSink for LastUi {
    fn render(&self, state: &UiState) {
        *self.0.lock().unwrap() = Some(state.clone());
    }
}

fn start(session_id: &str, voice: bool) -> Event {
    Event::StartCall {
        session_id: session_id.to_string(),
        voice,
    }
}

fn connect(core: &mut SessionCore) -> Uuid {
    core.handle(start("sess", false));
    let call_id = core.call_id().unwrap();
    core.handle(Event::Connected { call_id });
    call_id
}

fn say(core: &mut SessionCore, call_id: Uuid, role: Speaker, text: &str) -> Vec<Effect> {
    core.handle(Event::Inbound {
        call_id,
        message: ServerMessage::Transcription {
            role,
            text: text.to_string(),
        },
    })
}

fn control(core: &mut SessionCore, call_id: Uuid, message: ServerMessage) -> Vec<Effect> {
    core.handle(Event::Inbound { call_id, message })
}

fn audio_message() -> ServerMessage {
    ServerMessage::Audio {
        data: encode_base64(&encode_pcm16(&[0.25; 480])),
        sample_rate: 24000,
        channels: 1,
        bits_per_sample: 16,
    }
}

#[test]
fn plumber_request_pairs_into_one_entry() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);

    say(&mut core, call_id, Speaker::User, "I need a plumber");
    say(&mut core, call_id, Speaker::Agent, "Sure, what area?");
    control(&mut core, call_id, ServerMessage::TurnComplete);

    assert_eq!(
        core.history().entries(),
        &[HistoryEntry {
            user_text: "I need a plumber".to_string(),
            agent_text: AgentText::Text("Sure, what area?".to_string()),
        }]
    );
}

#[test]
fn interrupted_with_no_live_utterance_clears_queue_only() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);

    say(&mut core, call_id, Speaker::User, "hello");
    control(&mut core, call_id, ServerMessage::TurnComplete);
    let before = core.history().clone();

    control(&mut core, call_id, audio_message());
    control(&mut core, call_id, audio_message());
    control(&mut core, call_id, audio_message());
    assert!(core.playback().is_playing());
    assert_eq!(core.playback().queued(), 2);

    let effects = control(&mut core, call_id, ServerMessage::Interrupted);

    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::StopPlayback { .. })));
    assert!(!core.playback().is_playing());
    assert_eq!(core.playback().queued(), 0);
    assert_eq!(core.history(), &before);
}

#[test]
fn repeated_user_turn_is_suppressed() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);

    say(&mut core, call_id, Speaker::User, "find a dentist");
    control(&mut core, call_id, ServerMessage::TurnComplete);
    say(&mut core, call_id, Speaker::User, "find a dentist");
    control(&mut core, call_id, ServerMessage::TurnComplete);

    assert_eq!(core.history().len(), 1);
}

#[test]
fn fragments_join_before_speaker_change() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);

    say(&mut core, call_id, Speaker::User, "hello");
    say(&mut core, call_id, Speaker::User, "world");
    assert_eq!(core.live().map(|u| u.text.as_str()), Some("hello world"));
    assert!(core.history().is_empty());

    say(&mut core, call_id, Speaker::Agent, "Hi");
    assert_eq!(core.history().entries()[0].user_text, "hello world");
}

#[test]
fn agent_audio_drains_one_completion_at_a_time() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);

    let mut started = Vec::new();
    for _ in 0..3 {
        for effect in control(&mut core, call_id, audio_message()) {
            if let Effect::PlayChunk { chunk, .. } = effect {
                started.push(chunk.id);
            }
        }
    }
    assert_eq!(started, vec![0]);

    for chunk_id in 0..3 {
        for effect in core.handle(Event::PlaybackFinished { call_id, chunk_id }) {
            if let Effect::PlayChunk { chunk, .. } = effect {
                started.push(chunk.id);
            }
        }
    }
    assert_eq!(started, vec![0, 1, 2]);
    assert!(!core.playback().is_playing());
}

#[test]
fn protocol_violation_tears_down_with_neutral_status() {
    let mut core = SessionCore::new();
    let call_id = connect(&mut core);
    say(&mut core, call_id, Speaker::User, "half a sentence");

    let effects = core.handle(Event::ConnectionLost {
        call_id,
        err: scout_voice::streaming::SessionError::ProtocolViolation(
            "malformed frame: expected value".to_string(),
        ),
    });

    assert_eq!(core.history().len(), 1);
    match core.state() {
        State::Closed { message } => assert!(!message.contains("expected value")),
        other => panic!("expected Closed, got {:?}", other),
    }
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::ReleaseCall { .. })));
}

#[tokio::test]
async fn full_call_through_session_loop() {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let runner = Arc::new(ScriptedRunner::default());
    let ui = Arc::new(LastUi::default());

    let loop_task = tokio::spawn(run_session_loop(
        SessionCore::new(),
        rx,
        tx.clone(),
        runner.clone(),
        ui.clone(),
    ));

    tx.send(start("sess", true)).await.unwrap();

    // Wait for the scripted connect to land
    let call_id = loop {
        tokio::task::yield_now().await;
        let connected = runner
            .effects()
            .iter()
            .find_map(|e| match e {
                Effect::StartCapture { call_id } => Some(*call_id),
                _ => None,
            });
        if let Some(id) = connected {
            break id;
        }
    };

    for message in [
        ServerMessage::Transcription {
            role: Speaker::User,
            text: "I need a plumber".to_string(),
        },
        ServerMessage::Transcription {
            role: Speaker::Agent,
            text: "Sure, what area?".to_string(),
        },
        ServerMessage::TurnComplete,
    ] {
        tx.send(Event::Inbound { call_id, message }).await.unwrap();
    }
    tx.send(Event::CaptureStarted { call_id }).await.unwrap();
    tx.send(Event::SendText {
        text: "Downtown".to_string(),
    })
    .await
    .unwrap();
    tx.send(Event::EndCall).await.unwrap();
    tx.send(Event::Exit).await.unwrap();

    let core = loop_task.await.unwrap();

    assert_eq!(runner.sent(), vec!["start", "text", "end"]);
    assert_eq!(core.history().len(), 2);
    assert_eq!(core.history().entries()[1].user_text, "Downtown");

    let ui = ui.0.lock().unwrap().clone().unwrap();
    assert_eq!(
        ui.status,
        CallStatus::Closed {
            message: "Call ended".to_string()
        }
    );
    assert_eq!(ui.history.len(), 2);

    let effects = runner.effects();
    let released = effects
        .iter()
        .filter(|e| matches!(e, Effect::ReleaseCall { .. }))
        .count();
    assert_eq!(released, 1);
    assert!(!runner
        .effects()
        .iter()
        .any(|e| matches!(e, Effect::Send { message: ClientMessage::Auth { .. }, .. })));
}
