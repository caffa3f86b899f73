//! PCM conversion for the session socket
//!
//! Outbound audio is captured as `f32` at the device rate, resampled to
//! 16 kHz, quantized to 16-bit little-endian PCM and base64-wrapped for the
//! JSON envelope. Inbound audio goes the opposite way.
//!
//! # Resampling
//!
//! Nearest-neighbour only: output sample `i` is input sample
//! `floor(i * input_rate / output_rate)`. It is not band-limited, so
//! downsampling aliases anything above the new Nyquist frequency. That is a
//! known quality limitation, traded for a resampler that costs nothing on
//! the real-time path.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Transport sample rate for outbound audio
pub const TRANSPORT_SAMPLE_RATE: u32 = 16_000;

/// Bit depth used on the wire in both directions
pub const PCM_BIT_DEPTH: u16 = 16;

/// Channel count used on the wire in both directions
pub const PCM_CHANNELS: u16 = 1;

/// Errors produced while decoding an inbound audio payload
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload is not valid base64
    InvalidBase64(String),
    /// PCM16 payload has an odd number of bytes
    TruncatedSample(usize),
    /// Declared format is not 16-bit mono
    UnsupportedFormat { channels: u16, bit_depth: u16 },
    /// Declared sample rate is zero
    InvalidSampleRate,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidBase64(e) => write!(f, "Invalid base64 audio payload: {}", e),
            DecodeError::TruncatedSample(len) => {
                write!(f, "PCM16 payload has odd length ({} bytes)", len)
            }
            DecodeError::UnsupportedFormat {
                channels,
                bit_depth,
            } => write!(
                f,
                "Unsupported audio format: {} channel(s), {} bit",
                channels, bit_depth
            ),
            DecodeError::InvalidSampleRate => {
                write!(f, "Audio payload declares a zero sample rate")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// One unit of audio as it travels over the socket
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Little-endian PCM16 bytes
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Decoded mono audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

impl AudioChunk {
    /// Build an outbound chunk from mono samples already at the transport rate
    pub fn outbound(samples: &[f32]) -> Self {
        Self {
            pcm: encode_pcm16(samples),
            sample_rate: TRANSPORT_SAMPLE_RATE,
            channels: PCM_CHANNELS,
            bit_depth: PCM_BIT_DEPTH,
        }
    }

    /// Build an inbound chunk from a base64 payload and the server-declared format
    pub fn from_base64(
        data: &str,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
    ) -> Result<Self, DecodeError> {
        Ok(Self {
            pcm: decode_base64(data)?,
            sample_rate,
            channels,
            bit_depth,
        })
    }

    /// Base64 form of the PCM bytes for the JSON envelope
    pub fn to_base64(&self) -> String {
        encode_base64(&self.pcm)
    }

    /// Decode to normalized samples, validating the declared format
    pub fn decode(&self) -> Result<DecodedAudio, DecodeError> {
        if self.channels != PCM_CHANNELS || self.bit_depth != PCM_BIT_DEPTH {
            return Err(DecodeError::UnsupportedFormat {
                channels: self.channels,
                bit_depth: self.bit_depth,
            });
        }
        if self.sample_rate == 0 {
            return Err(DecodeError::InvalidSampleRate);
        }

        Ok(DecodedAudio {
            samples: decode_pcm16(&self.pcm)?,
            sample_rate: self.sample_rate,
        })
    }
}

/// Nearest-neighbour resample from `input_rate` to `output_rate`
///
/// Produces `floor(len * output_rate / input_rate)` samples. Integer math
/// keeps the mapping identical across platforms.
pub fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if input_rate == 0 || output_rate == 0 {
        log::warn!(
            "Invalid sample rate (input: {}, output: {}), returning original",
            input_rate,
            output_rate
        );
        return input.to_vec();
    }

    if input_rate == output_rate {
        return input.to_vec();
    }

    let input_rate = input_rate as u64;
    let output_rate = output_rate as u64;
    let output_len = (input.len() as u64 * output_rate / input_rate) as usize;

    (0..output_len)
        .map(|i| input[(i as u64 * input_rate / output_rate) as usize])
        .collect()
}

/// Quantize normalized samples to little-endian PCM16
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            ((clamped * 32767.0).round() as i16).to_le_bytes()
        })
        .collect()
}

/// Convert little-endian PCM16 bytes to samples in [-1.0, 1.0)
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::TruncatedSample(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}
