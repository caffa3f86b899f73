//! Effect runner for scout-voice
//!
//! This module executes the I/O effects produced by the state machine:
//! the session socket, microphone capture, speaker output and the calls
//! refresh. Completion events are sent back to the session loop.
//!
//! Every resource a call holds lives in one `CallResources` entry keyed by
//! the call id. `ReleaseCall` removes the entry and drops everything in it
//! before returning, so the next call can acquire the devices. Device opens
//! still in flight hold a per-device gate until their handle is installed or
//! released, so a new call's open waits for the old call's to settle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::ApiClient;
use crate::audio::{start_capture, AudioOutput, CaptureHandle, CapturedFrame, QueuedChunk};
use crate::auth_token::TokenProvider;
use crate::settings::AppSettings;
use crate::state_machine::{Effect, Event};
use crate::streaming::{
    spawn_streamer, ClientMessage, ConnectionSender, InboundStream, SessionClient,
    SessionConnection, SessionError,
};

/// Captured frames buffered between the device thread and the streamer
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

struct ActiveCapture {
    handle: CaptureHandle,
    cancel: CancellationToken,
    streamer: JoinHandle<()>,
}

impl ActiveCapture {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.stop();
        // The streamer exits on cancel; nothing to wait for
        drop(self.streamer);
    }
}

/// Everything one call holds
#[derive(Default)]
struct CallResources {
    connection: Option<SessionConnection>,
    sender: Option<ConnectionSender>,
    capture: Option<ActiveCapture>,
    /// Bumped on every start/stop so a slow device open can tell it lost
    capture_generation: u64,
    output: Option<AudioOutput>,
    output_opening: bool,
    /// Chunk to start once the output device is open
    pending_play: Option<QueuedChunk>,
    /// Set after the output device failed to open; later chunks fail fast
    output_failed: Option<String>,
}

impl CallResources {
    fn release(mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.pending_play = None;
        drop(self.output.take());
        // Dropping the connection closes it and stops its reader
        drop(self.connection.take());
    }
}

type Calls = Arc<Mutex<HashMap<Uuid, CallResources>>>;

/// Held across one device open, until its handle is installed or dropped
type DeviceGate = Arc<tokio::sync::Mutex<()>>;

fn lock_calls(calls: &Calls) -> MutexGuard<'_, HashMap<Uuid, CallResources>> {
    calls.lock().unwrap_or_else(|poisoned| {
        log::error!("Call resource lock poisoned, recovering");
        poisoned.into_inner()
    })
}

fn send_later(tx: mpsc::Sender<Event>, event: Event) {
    tokio::spawn(async move {
        if tx.send(event).await.is_err() {
            log::debug!("Session loop gone, dropping event");
        }
    });
}

/// Real effect runner: WebSocket session, CPAL capture and playback, REST refresh.
pub struct LiveEffectRunner {
    settings: AppSettings,
    tokens: Arc<dyn TokenProvider>,
    calls: Calls,
    capture_gate: DeviceGate,
    output_gate: DeviceGate,
}

impl LiveEffectRunner {
    pub fn new(settings: AppSettings, tokens: Arc<dyn TokenProvider>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            tokens,
            calls: Arc::new(Mutex::new(HashMap::new())),
            capture_gate: DeviceGate::default(),
            output_gate: DeviceGate::default(),
        })
    }

    /// Number of calls still holding resources
    pub fn active_calls(&self) -> usize {
        lock_calls(&self.calls).len()
    }

    fn open_connection(&self, call_id: Uuid, session_id: String, tx: mpsc::Sender<Event>) {
        lock_calls(&self.calls).insert(call_id, CallResources::default());

        let token = match self.tokens.get_token() {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Cannot open call {}: {}", call_id, e);
                send_later(
                    tx,
                    Event::ConnectFailed {
                        call_id,
                        err: SessionError::MissingToken,
                    },
                );
                return;
            }
        };

        let config = self.settings.client_config();
        let calls = self.calls.clone();

        tokio::spawn(async move {
            let mut connection = match SessionClient::open(&config, &session_id, &token).await {
                Ok(connection) => connection,
                Err(err) => {
                    let _ = tx.send(Event::ConnectFailed { call_id, err }).await;
                    return;
                }
            };

            let inbound = connection.take_inbound();
            let sender = connection.sender();

            // The call may have been released while we were connecting
            let orphan = {
                let mut calls = lock_calls(&calls);
                match calls.get_mut(&call_id) {
                    Some(entry) => {
                        entry.sender = Some(sender);
                        entry.connection = Some(connection);
                        None
                    }
                    None => Some(connection),
                }
            };
            if let Some(connection) = orphan {
                log::info!("Call {} released while connecting, closing socket", call_id);
                drop(connection);
                return;
            }

            if tx.send(Event::Connected { call_id }).await.is_err() {
                return;
            }
            if let Some(inbound) = inbound {
                forward_inbound(call_id, inbound, tx).await;
            }
        });
    }

    fn start_capture(&self, call_id: Uuid, tx: mpsc::Sender<Event>) {
        let (sender, generation) = {
            let mut calls = lock_calls(&self.calls);
            let Some(entry) = calls.get_mut(&call_id) else {
                log::debug!("StartCapture for released call {}", call_id);
                return;
            };
            if entry.capture.is_some() {
                drop(calls);
                send_later(tx, Event::CaptureStarted { call_id });
                return;
            }
            let Some(sender) = entry.sender.clone() else {
                log::warn!("StartCapture before call {} connected", call_id);
                return;
            };
            entry.capture_generation += 1;
            (sender, entry.capture_generation)
        };

        let streamer_config = self.settings.streamer_config();
        let calls = self.calls.clone();
        let gate = self.capture_gate.clone();

        tokio::spawn(async move {
            let _device = gate.lock_owned().await;
            if !capture_wanted(&calls, call_id, generation) {
                log::debug!("Capture for call {} cancelled before opening", call_id);
                return;
            }

            let (frames_tx, frames_rx) = mpsc::channel::<CapturedFrame>(CAPTURE_CHANNEL_CAPACITY);

            let handle = match start_capture(frames_tx).await {
                Ok(handle) => handle,
                Err(e) => {
                    log::warn!("Capture failed for call {}: {}", call_id, e);
                    let _ = tx
                        .send(Event::CaptureFailed {
                            call_id,
                            err: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let stale = {
                let mut calls = lock_calls(&calls);
                match calls.get_mut(&call_id) {
                    Some(entry) if entry.capture_generation == generation => {
                        let cancel = CancellationToken::new();
                        let streamer =
                            spawn_streamer(frames_rx, sender, streamer_config, cancel.clone());
                        entry.capture = Some(ActiveCapture {
                            handle,
                            cancel,
                            streamer,
                        });
                        None
                    }
                    _ => Some(handle),
                }
            };

            match stale {
                Some(handle) => {
                    log::debug!("Capture for call {} no longer wanted, releasing", call_id);
                    handle.stop();
                }
                None => {
                    let _ = tx.send(Event::CaptureStarted { call_id }).await;
                }
            }
        });
    }

    fn stop_capture(&self, call_id: Uuid) {
        let capture = {
            let mut calls = lock_calls(&self.calls);
            calls.get_mut(&call_id).and_then(|entry| {
                entry.capture_generation += 1;
                entry.capture.take()
            })
        };
        if let Some(capture) = capture {
            log::info!("Stopping capture for call {}", call_id);
            capture.stop();
        }
    }

    fn send(&self, call_id: Uuid, message: ClientMessage) {
        let sender = lock_calls(&self.calls)
            .get(&call_id)
            .and_then(|entry| entry.sender.clone());

        let Some(sender) = sender else {
            log::debug!("No connection for call {}, {} not sent", call_id, message.kind());
            return;
        };

        let kind = message.kind();
        if let Err(e) = sender.send(message) {
            match kind {
                "end" => log::debug!("Could not send end for call {}: {}", call_id, e),
                _ => log::warn!("Could not send {} for call {}: {}", kind, call_id, e),
            }
        }
    }

    fn close_connection(&self, call_id: Uuid) {
        if let Some(connection) = lock_calls(&self.calls)
            .get(&call_id)
            .and_then(|entry| entry.connection.as_ref())
        {
            connection.close();
        }
    }

    fn play_chunk(&self, call_id: Uuid, chunk: QueuedChunk, tx: mpsc::Sender<Event>) {
        {
            let mut calls = lock_calls(&self.calls);
            let Some(entry) = calls.get_mut(&call_id) else {
                return;
            };

            if let Some(output) = entry.output.as_ref() {
                output.play(chunk.id, chunk.audio);
                return;
            }
            if let Some(err) = entry.output_failed.clone() {
                drop(calls);
                send_later(
                    tx,
                    Event::PlaybackFailed {
                        call_id,
                        chunk_id: chunk.id,
                        err,
                    },
                );
                return;
            }

            entry.pending_play = Some(chunk);
            if entry.output_opening {
                return;
            }
            entry.output_opening = true;
        }

        let calls = self.calls.clone();
        let gate = self.output_gate.clone();
        tokio::spawn(async move {
            let _device = gate.lock_owned().await;
            if !lock_calls(&calls).contains_key(&call_id) {
                log::debug!("Output for call {} cancelled before opening", call_id);
                return;
            }

            let opened = AudioOutput::open(call_id, tx.clone()).await;

            let mut failed_chunk = None;
            let orphan = {
                let mut guard = lock_calls(&calls);
                match (guard.get_mut(&call_id), opened) {
                    (Some(entry), Ok(output)) => {
                        entry.output_opening = false;
                        if let Some(chunk) = entry.pending_play.take() {
                            output.play(chunk.id, chunk.audio);
                        }
                        entry.output = Some(output);
                        None
                    }
                    (Some(entry), Err(e)) => {
                        log::warn!("Output device unavailable for call {}: {}", call_id, e);
                        entry.output_opening = false;
                        entry.output_failed = Some(e.to_string());
                        failed_chunk = entry
                            .pending_play
                            .take()
                            .map(|chunk| (chunk.id, e.to_string()));
                        None
                    }
                    (None, Ok(output)) => Some(output),
                    (None, Err(_)) => None,
                }
            };
            drop(orphan);

            if let Some((chunk_id, err)) = failed_chunk {
                let _ = tx
                    .send(Event::PlaybackFailed {
                        call_id,
                        chunk_id,
                        err,
                    })
                    .await;
            }
        });
    }

    fn stop_playback(&self, call_id: Uuid) {
        if let Some(entry) = lock_calls(&self.calls).get_mut(&call_id) {
            entry.pending_play = None;
            if let Some(output) = entry.output.as_ref() {
                output.stop();
            }
        }
    }

    fn release_call(&self, call_id: Uuid) {
        let resources = lock_calls(&self.calls).remove(&call_id);
        match resources {
            Some(resources) => {
                resources.release();
                log::info!("Released resources for call {}", call_id);
            }
            None => log::debug!("ReleaseCall: call {} holds nothing", call_id),
        }
    }

    fn refresh_calls(&self, session_id: String, tx: mpsc::Sender<Event>) {
        let client = match self
            .tokens
            .get_token()
            .map_err(|e| e.to_string())
            .and_then(|token| {
                ApiClient::new(&self.settings.backend_url, &token).map_err(|e| e.to_string())
            }) {
            Ok(client) => client,
            Err(e) => {
                log::debug!("Skipping calls refresh: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            match client.list_calls(&session_id).await {
                Ok(calls) => {
                    log::debug!("Fetched {} calls for session {}", calls.len(), session_id);
                    let _ = tx.send(Event::CallsRefreshed { session_id, calls }).await;
                }
                Err(e) => log::warn!("Failed to refresh calls: {}", e),
            }
        });
    }
}

/// Whether `generation` is still the capture the call wants
fn capture_wanted(calls: &Calls, call_id: Uuid, generation: u64) -> bool {
    lock_calls(calls)
        .get(&call_id)
        .is_some_and(|entry| entry.capture_generation == generation)
}

/// Forward server messages as events until the connection ends
async fn forward_inbound(call_id: Uuid, mut inbound: InboundStream, tx: mpsc::Sender<Event>) {
    while let Some(item) = inbound.next().await {
        let event = match item {
            Ok(message) => Event::Inbound { call_id, message },
            Err(err) => Event::ConnectionLost { call_id, err },
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    log::debug!("Inbound forwarding for call {} finished", call_id);
}

impl EffectRunner for LiveEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::OpenConnection {
                call_id,
                session_id,
            } => self.open_connection(call_id, session_id, tx),
            Effect::StartCapture { call_id } => self.start_capture(call_id, tx),
            Effect::StopCapture { call_id } => self.stop_capture(call_id),
            Effect::Send { call_id, message } => self.send(call_id, message),
            Effect::CloseConnection { call_id } => self.close_connection(call_id),
            Effect::PlayChunk { call_id, chunk } => self.play_chunk(call_id, chunk, tx),
            Effect::StopPlayback { call_id } => self.stop_playback(call_id),
            Effect::ReleaseCall { call_id } => self.release_call(call_id),
            Effect::RefreshCalls { session_id } => self.refresh_calls(session_id, tx),
            other => log::debug!("LiveEffectRunner: ignoring {:?}", other),
        }
    }
}
