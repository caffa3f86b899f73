//! Agent audio output using CPAL
//!
//! Mirrors the capture side: the output stream is owned by a dedicated
//! thread, and the audio callback pulls samples from the chunk currently
//! loaded. When a chunk runs out, the callback reports it to the output
//! thread, which forwards a `PlaybackFinished` event to the session loop.
//! Nothing here decides what plays next; that is the `PlaybackQueue`'s job.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::capture::AudioError;
use super::pcm::{resample, DecodedAudio};
use crate::state_machine::Event;

enum OutputCommand {
    Play { chunk_id: u64, audio: DecodedAudio },
    Stop,
    Finished(u64),
    DeviceError(String),
    Shutdown,
}

struct Playing {
    chunk_id: u64,
    samples: Vec<f32>,
    position: usize,
}

#[derive(Default)]
struct OutputState {
    current: Option<Playing>,
}

/// Handle to the output device for one call.
/// Dropping it stops the stream and releases the device.
pub struct AudioOutput {
    commands: std_mpsc::Sender<OutputCommand>,
    thread: Option<JoinHandle<()>>,
    device_rate: u32,
}

impl AudioOutput {
    /// Open the default output device. Completion events for played chunks
    /// are sent to `events` tagged with `call_id`.
    pub async fn open(call_id: Uuid, events: mpsc::Sender<Event>) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands_tx, commands_rx) = std_mpsc::channel();
        let callback_tx = commands_tx.clone();

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || run_output_thread(call_id, events, callback_tx, commands_rx, ready_tx))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(device_rate)) => Ok(Self {
                commands: commands_tx,
                thread: Some(thread),
                device_rate,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceThreadExited)
            }
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Start playing a chunk, replacing whatever is loaded
    pub fn play(&self, chunk_id: u64, audio: DecodedAudio) {
        if self
            .commands
            .send(OutputCommand::Play { chunk_id, audio })
            .is_err()
        {
            log::warn!("AudioOutput: output thread gone, chunk {} dropped", chunk_id);
        }
    }

    /// Silence the output immediately without reporting completion
    pub fn stop(&self) {
        let _ = self.commands.send(OutputCommand::Stop);
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(OutputCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Output thread panicked during shutdown");
            }
        }
    }
}

fn run_output_thread(
    call_id: Uuid,
    events: mpsc::Sender<Event>,
    callback_tx: std_mpsc::Sender<OutputCommand>,
    commands: std_mpsc::Receiver<OutputCommand>,
    ready_tx: oneshot::Sender<Result<u32, AudioError>>,
) {
    let state = Arc::new(Mutex::new(OutputState::default()));

    let (stream, device_rate) = match open_output_stream(state.clone(), callback_tx) {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("Output device unavailable: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    if ready_tx.send(Ok(device_rate)).is_err() {
        return;
    }

    let mut worker = OutputWorker {
        call_id,
        events,
        state,
        device_rate,
        failed: None,
    };
    while let Ok(command) = commands.recv() {
        if !worker.handle(command) {
            break;
        }
    }

    drop(stream);
    log::info!("Playback stopped, output device released");
}

/// Command side of the output thread. Once the device reports an error the
/// stream is treated as dead: cpal stops pulling samples, so every later
/// chunk is failed straight away instead of waiting on a callback.
struct OutputWorker {
    call_id: Uuid,
    events: mpsc::Sender<Event>,
    state: Arc<Mutex<OutputState>>,
    device_rate: u32,
    failed: Option<String>,
}

impl OutputWorker {
    /// Returns false when the thread should exit
    fn handle(&mut self, command: OutputCommand) -> bool {
        match command {
            OutputCommand::Play { chunk_id, audio } => {
                if let Some(err) = self.failed.clone() {
                    return self.report_failed(chunk_id, err);
                }
                let samples = resample(&audio.samples, audio.sample_rate, self.device_rate);
                lock_state(&self.state).current = Some(Playing {
                    chunk_id,
                    samples,
                    position: 0,
                });
                true
            }
            OutputCommand::Stop => {
                lock_state(&self.state).current = None;
                true
            }
            OutputCommand::Finished(chunk_id) => self
                .events
                .blocking_send(Event::PlaybackFinished {
                    call_id: self.call_id,
                    chunk_id,
                })
                .is_ok(),
            OutputCommand::DeviceError(err) => {
                if self.failed.is_none() {
                    log::warn!("Output device lost for call {}: {}", self.call_id, err);
                    self.failed = Some(err.clone());
                }
                let interrupted = lock_state(&self.state).current.take();
                match interrupted {
                    Some(playing) => self.report_failed(playing.chunk_id, err),
                    None => true,
                }
            }
            OutputCommand::Shutdown => false,
        }
    }

    fn report_failed(&self, chunk_id: u64, err: String) -> bool {
        self.events
            .blocking_send(Event::PlaybackFailed {
                call_id: self.call_id,
                chunk_id,
                err,
            })
            .is_ok()
    }
}

fn lock_state(state: &Mutex<OutputState>) -> std::sync::MutexGuard<'_, OutputState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn open_output_stream(
    state: Arc<Mutex<OutputState>>,
    callback_tx: std_mpsc::Sender<OutputCommand>,
) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let device_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_output_stream_typed::<i16>(&device, &config, state, callback_tx),
        SampleFormat::U16 => build_output_stream_typed::<u16>(&device, &config, state, callback_tx),
        SampleFormat::F32 => build_output_stream_typed::<f32>(&device, &config, state, callback_tx),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, device_rate))
}

fn build_output_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    state: Arc<Mutex<OutputState>>,
    callback_tx: std_mpsc::Sender<OutputCommand>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let error_tx = callback_tx.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let finished = fill_output(&mut lock_state(&state), data, channels);
                if let Some(chunk_id) = finished {
                    let _ = callback_tx.send(OutputCommand::Finished(chunk_id));
                }
            },
            move |err| {
                log::error!("Audio output stream error: {}", err);
                let _ = error_tx.send(OutputCommand::DeviceError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Copy the loaded chunk into an interleaved device buffer, padding with
/// silence. Returns the chunk id once its last sample has been written.
fn fill_output<T>(state: &mut OutputState, data: &mut [T], channels: usize) -> Option<u64>
where
    T: cpal::Sample + cpal::FromSample<f32>,
{
    let channels = channels.max(1);

    for frame in data.chunks_mut(channels) {
        let value = match state.current.as_mut() {
            Some(playing) if playing.position < playing.samples.len() => {
                let value = playing.samples[playing.position];
                playing.position += 1;
                value
            }
            _ => 0.0,
        };
        for out in frame.iter_mut() {
            *out = T::from_sample(value);
        }
    }

    let done = matches!(
        state.current.as_ref(),
        Some(playing) if playing.position >= playing.samples.len()
    );
    if done {
        state.current.take().map(|playing| playing.chunk_id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(chunk_id: u64, samples: Vec<f32>) -> OutputState {
        OutputState {
            current: Some(Playing {
                chunk_id,
                samples,
                position: 0,
            }),
        }
    }

    #[test]
    fn test_fill_duplicates_mono_across_channels() {
        let mut state = loaded(3, vec![0.5, -0.5, 0.25, 0.0]);
        let mut buffer = [0.0f32; 4];
        assert!(fill_output(&mut state, &mut buffer, 2).is_none());
        assert_eq!(buffer, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_fill_reports_completion_and_pads_silence() {
        let mut state = loaded(7, vec![0.5, 0.5]);
        let mut buffer = [1.0f32; 4];
        assert_eq!(fill_output(&mut state, &mut buffer, 1), Some(7));
        assert_eq!(buffer, [0.5, 0.5, 0.0, 0.0]);
        assert!(state.current.is_none());
    }

    #[test]
    fn test_fill_empty_chunk_completes_on_next_callback() {
        let mut state = loaded(1, Vec::new());
        let mut buffer = [1.0f32; 2];
        assert_eq!(fill_output(&mut state, &mut buffer, 1), Some(1));
        assert_eq!(buffer, [0.0, 0.0]);
    }

    fn worker() -> (OutputWorker, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(8);
        let worker = OutputWorker {
            call_id: Uuid::new_v4(),
            events,
            state: Arc::new(Mutex::new(OutputState::default())),
            device_rate: 24000,
            failed: None,
        };
        (worker, rx)
    }

    fn chunk() -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.25; 240],
            sample_rate: 24000,
        }
    }

    #[test]
    fn test_device_error_mid_chunk_fails_it() {
        let (mut worker, mut rx) = worker();
        assert!(worker.handle(OutputCommand::Play {
            chunk_id: 4,
            audio: chunk(),
        }));
        assert!(worker.handle(OutputCommand::DeviceError("unplugged".to_string())));

        match rx.try_recv() {
            Ok(Event::PlaybackFailed { chunk_id, err, .. }) => {
                assert_eq!(chunk_id, 4);
                assert_eq!(err, "unplugged");
            }
            other => panic!("expected PlaybackFailed, got {:?}", other),
        }
        assert!(lock_state(&worker.state).current.is_none());
    }

    #[test]
    fn test_chunks_after_device_error_fail_immediately() {
        let (mut worker, mut rx) = worker();
        // Error lands between chunks: nothing to fail yet
        assert!(worker.handle(OutputCommand::DeviceError("device lost".to_string())));
        assert!(rx.try_recv().is_err());

        for chunk_id in [1, 2] {
            assert!(worker.handle(OutputCommand::Play {
                chunk_id,
                audio: chunk(),
            }));
            match rx.try_recv() {
                Ok(Event::PlaybackFailed { chunk_id: id, .. }) => assert_eq!(id, chunk_id),
                other => panic!("expected PlaybackFailed, got {:?}", other),
            }
        }
        assert!(lock_state(&worker.state).current.is_none());
    }

    #[test]
    fn test_finished_is_forwarded_and_shutdown_stops() {
        let (mut worker, mut rx) = worker();
        assert!(worker.handle(OutputCommand::Finished(9)));
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::PlaybackFinished { chunk_id: 9, .. })
        ));
        assert!(!worker.handle(OutputCommand::Shutdown));
    }

    #[test]
    fn test_fill_idle_outputs_silence() {
        let mut state = OutputState::default();
        let mut buffer = [1.0f32; 3];
        assert!(fill_output(&mut state, &mut buffer, 1).is_none());
        assert_eq!(buffer, [0.0, 0.0, 0.0]);
    }
}
