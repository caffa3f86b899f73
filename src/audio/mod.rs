//! Audio devices and PCM handling
//!
//! Microphone capture and speaker output both use CPAL on dedicated threads.
//! `pcm` converts between device samples and the socket's PCM16 payloads,
//! and `playback` orders inbound agent speech.

mod capture;
mod output;
pub mod pcm;
mod playback;

pub use capture::{start_capture, AudioError, CaptureHandle, CapturedFrame};
pub use output::AudioOutput;
pub use pcm::{resample, AudioChunk, DecodeError, DecodedAudio, TRANSPORT_SAMPLE_RATE};
pub use playback::{PlaybackQueue, QueuedChunk};
