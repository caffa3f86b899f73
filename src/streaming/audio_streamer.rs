//! Outbound microphone pipeline
//!
//! Bridges the CPAL capture thread (sync) to the session socket (async).
//! Receives mono frames at the device rate, resamples, chunks, encodes and
//! queues `audio` frames on the connection.
//!
//! # Architecture
//!
//! ```text
//! Capture Thread (sync)             Tokio Runtime (async)
//! ┌──────────────────┐              ┌────────────────────────┐
//! │ CPAL Callback    │──channel──▶  │ AudioStreamer::run()   │
//! │ try_send(frame)  │              │   ├─ resample (16kHz)  │
//! └──────────────────┘              │   ├─ chunk (100ms)     │
//!                                   │   └─ PCM16 → base64    │
//!                                   └────────────────────────┘
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::ClientMessage;
use super::session_client::ConnectionSender;
use super::SessionError;
use crate::audio::{resample, AudioChunk, CapturedFrame, TRANSPORT_SAMPLE_RATE};

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Sample rate on the wire (the backend expects 16000)
    pub target_sample_rate: u32,
    /// Chunk duration in milliseconds
    pub chunk_duration_ms: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: TRANSPORT_SAMPLE_RATE,
            chunk_duration_ms: 100,
        }
    }
}

impl StreamerConfig {
    /// Calculate samples per chunk at target sample rate
    pub fn samples_per_chunk(&self) -> usize {
        ((self.target_sample_rate as u64 * self.chunk_duration_ms as u64 / 1000) as usize).max(1)
    }
}

/// Resamples incoming frames and cuts them into fixed-size chunks
#[derive(Debug)]
struct ChunkAccumulator {
    target_sample_rate: u32,
    samples_per_chunk: usize,
    buffer: Vec<f32>,
}

impl ChunkAccumulator {
    fn new(config: &StreamerConfig) -> Self {
        let samples_per_chunk = config.samples_per_chunk();
        Self {
            target_sample_rate: config.target_sample_rate,
            samples_per_chunk,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
        }
    }

    /// Add a frame and return every complete chunk now available
    fn push(&mut self, frame: &CapturedFrame) -> Vec<Vec<f32>> {
        let resampled = resample(&frame.samples, frame.sample_rate, self.target_sample_rate);
        self.buffer.extend(resampled);

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.samples_per_chunk {
            chunks.push(self.buffer.drain(..self.samples_per_chunk).collect());
        }
        chunks
    }

    /// Remaining partial chunk, if any
    fn flush(&mut self) -> Option<Vec<f32>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Streams captured audio onto a session connection
pub struct AudioStreamer {
    frames: mpsc::Receiver<CapturedFrame>,
    sender: ConnectionSender,
    accumulator: ChunkAccumulator,
    cancel: CancellationToken,
    chunks_sent: u64,
}

impl AudioStreamer {
    pub fn new(
        frames: mpsc::Receiver<CapturedFrame>,
        sender: ConnectionSender,
        config: StreamerConfig,
        cancel: CancellationToken,
    ) -> Self {
        log::info!(
            "AudioStreamer: initialized (→ {}Hz, {}ms chunks = {} samples)",
            config.target_sample_rate,
            config.chunk_duration_ms,
            config.samples_per_chunk()
        );

        Self {
            frames,
            accumulator: ChunkAccumulator::new(&config),
            sender,
            cancel,
            chunks_sent: 0,
        }
    }

    /// Run until cancelled, the capture channel closes, or a send fails.
    ///
    /// Cancellation discards the partial chunk; a closed capture channel
    /// flushes it. Returns the number of chunks sent.
    pub async fn run(mut self) -> Result<u64, SessionError> {
        log::debug!("AudioStreamer: starting streaming loop");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    log::debug!(
                        "AudioStreamer: cancelled, discarding {} buffered samples",
                        self.accumulator.buffered()
                    );
                    break;
                }
                frame = self.frames.recv() => match frame {
                    Some(frame) => {
                        for chunk in self.accumulator.push(&frame) {
                            self.send_chunk(&chunk)?;
                        }
                    }
                    None => {
                        if let Some(rest) = self.accumulator.flush() {
                            log::debug!(
                                "AudioStreamer: sending final partial chunk ({} samples)",
                                rest.len()
                            );
                            self.send_chunk(&rest)?;
                        }
                        break;
                    }
                },
            }
        }

        log::info!(
            "AudioStreamer: streaming complete, {} chunks sent",
            self.chunks_sent
        );
        Ok(self.chunks_sent)
    }

    fn send_chunk(&mut self, samples: &[f32]) -> Result<(), SessionError> {
        let chunk = AudioChunk::outbound(samples);
        self.sender.send(ClientMessage::Audio {
            data: chunk.to_base64(),
        })?;

        self.chunks_sent += 1;

        // Periodic logging (every 50 chunks = ~5 seconds)
        if self.chunks_sent % 50 == 0 {
            log::debug!("AudioStreamer: sent {} chunks", self.chunks_sent);
        }
        Ok(())
    }
}

/// Spawn a streamer task for one capture session
pub fn spawn_streamer(
    frames: mpsc::Receiver<CapturedFrame>,
    sender: ConnectionSender,
    config: StreamerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = AudioStreamer::new(frames, sender, config, cancel).run().await {
            // The connection's own reader reports why it closed
            log::debug!("AudioStreamer: stopped: {}", e);
        }
    })
}
