//! PCM codec for the streaming wire format
//!
//! Converts between float samples, 16-bit little-endian PCM, and the base64
//! text the live endpoint carries. Everything here is pure and synchronous.

use crate::error::{Result, VoiceError};
use base64::prelude::*;
use serde::{Deserialize, Serialize};

/// Sample rate of microphone audio sent to the endpoint
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of synthesized audio received from the endpoint
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

const PCM_SCALE: f32 = 32768.0;

/// A chunk of signed 16-bit mono PCM at a fixed rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Quantize float samples.
    ///
    /// Samples in [-1, 1] truncate toward zero, with `1.0` pinned to `i16::MAX`.
    /// Anything outside that range wraps modulo 2^16 like a JavaScript
    /// `Int16Array` store.
    pub fn from_float(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(samples.iter().map(|&s| quantize(s)).collect(), sample_rate)
    }

    /// Little-endian byte image of the samples
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// Encode for the wire
    pub fn encode(&self) -> EncodedPayload {
        EncodedPayload {
            mime_type: pcm_mime_type(self.sample_rate),
            data: BASE64_STANDARD.encode(self.to_le_bytes()),
        }
    }
}

/// Base64 PCM tagged with an `audio/pcm;rate=<rate>` descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPayload {
    pub mime_type: String,
    pub data: String,
}

impl EncodedPayload {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Sample rate from the `rate=` parameter of the descriptor, if present
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
    }

    /// Raw bytes behind the base64 text
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        BASE64_STANDARD
            .decode(self.data.trim())
            .map_err(|e| VoiceError::malformed(format!("invalid base64: {}", e)))
    }
}

/// Decoded float audio, one sample vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Frames per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to one
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

#[cfg(test)]
impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }
}

/// Encode a captured frame for sending
pub fn encode_outbound(samples: &[f32], sample_rate: u32) -> EncodedPayload {
    AudioChunk::from_float(samples, sample_rate).encode()
}

/// Decode a received payload into float audio.
///
/// The byte length must be a whole multiple of `2 * channels`.
pub fn decode_inbound(
    payload: &EncodedPayload,
    sample_rate: u32,
    channels: usize,
) -> Result<AudioBuffer> {
    if channels == 0 {
        return Err(VoiceError::malformed("channel count must be at least 1"));
    }

    let bytes = payload.decode_bytes()?;
    let stride = 2 * channels;
    if bytes.len() % stride != 0 {
        return Err(VoiceError::malformed(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit PCM)",
            bytes.len(),
            stride,
            channels
        )));
    }

    let frame_count = bytes.len() / stride;
    let mut data = vec![Vec::with_capacity(frame_count); channels];
    for frame in bytes.chunks_exact(stride) {
        for (channel, sample) in frame.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            data[channel].push(value as f32 / PCM_SCALE);
        }
    }

    Ok(AudioBuffer::new(data, sample_rate))
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

fn quantize(sample: f32) -> i16 {
    if (-1.0..=1.0).contains(&sample) {
        ((sample * PCM_SCALE) as i32).min(i16::MAX as i32) as i16
    } else {
        wrap_to_i16(sample as f64 * PCM_SCALE as f64)
    }
}

/// ToInt16: truncate, then reduce modulo 2^16; non-finite values become 0
fn wrap_to_i16(value: f64) -> i16 {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(65536.0) as u16 as i16
}
