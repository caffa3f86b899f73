//! Microphone capture using CPAL
//!
//! The input stream lives on a dedicated audio thread because `cpal::Stream`
//! is not `Send`. The thread down-mixes every callback buffer to mono `f32`
//! and forwards it to the async side with `try_send`, so a slow consumer
//! drops frames instead of blocking the audio callback.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

/// Errors that can occur while opening or running an audio device.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    DeviceThreadExited,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::DeviceThreadExited => {
                write!(f, "Audio device thread exited unexpectedly")
            }
        }
    }
}

impl std::error::Error for AudioError {}

/// One callback's worth of mono samples at the device rate
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

struct InputInfo {
    device_name: String,
    sample_rate: u32,
}

/// Handle to a running capture.
/// When dropped, the input stream is stopped and the device released.
pub struct CaptureHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    device_name: String,
}

impl CaptureHandle {
    /// Native sample rate of the capture device
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stop capturing and wait for the device to be released.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open the default input device and start forwarding frames to `frames_tx`.
///
/// Resolves once the stream is playing, or with the device error
/// (missing device, denied access, unsupported format).
pub async fn start_capture(
    frames_tx: mpsc::Sender<CapturedFrame>,
) -> Result<CaptureHandle, AudioError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel();

    let thread = std::thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || run_capture_thread(frames_tx, ready_tx, stop_rx))
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

    match ready_rx.await {
        Ok(Ok(info)) => {
            log::info!(
                "Capture started on {:?} at {} Hz",
                info.device_name,
                info.sample_rate
            );
            Ok(CaptureHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
                sample_rate: info.sample_rate,
                device_name: info.device_name,
            })
        }
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

fn run_capture_thread(
    frames_tx: mpsc::Sender<CapturedFrame>,
    ready_tx: oneshot::Sender<Result<InputInfo, AudioError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let (stream, info) = match open_input_stream(frames_tx) {
        Ok(opened) => opened,
        Err(e) => {
            log::warn!("Capture device unavailable: {}", e);
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

    if ready_tx.send(Ok(info)).is_err() {
        // Caller gave up waiting
        return;
    }

    // Park until stop() is called or the handle is dropped
    let _ = stop_rx.recv();
    drop(stream);
    log::info!("Capture stopped, input device released");
}

fn open_input_stream(
    frames_tx: mpsc::Sender<CapturedFrame>,
) -> Result<(Stream, InputInfo), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let info = InputInfo {
        device_name,
        sample_rate: config.sample_rate.0,
    };

    let err_fn = |err| log::error!("Audio input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => build_input_stream_typed::<i16>(&device, &config, frames_tx, err_fn),
        SampleFormat::U16 => build_input_stream_typed::<u16>(&device, &config, frames_tx, err_fn),
        SampleFormat::F32 => build_input_stream_typed::<f32>(&device, &config, frames_tx, err_fn),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, info))
}

fn build_input_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frames_tx: mpsc::Sender<CapturedFrame>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;
    let mut dropped: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frame = CapturedFrame {
                    samples: downmix(data, channels),
                    sample_rate,
                };
                match frames_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            log::trace!("Capture consumer lagging, {} frames dropped", dropped);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Average interleaved channels into one mono `f32` track
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    if channels <= 1 {
        return data.iter().map(|&s| s.to_sample::<f32>()).collect();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
            sum / frame.len() as f32
        })
        .collect()
}
