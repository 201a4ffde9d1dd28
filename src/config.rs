//! Session and endpoint configuration

use crate::codec::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::error::{Result, VoiceError};

/// Default Gemini Live WebSocket endpoint
pub const DEFAULT_ENDPOINT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model; override with `--model` or the stored setting
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Capture frame size in samples
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Frames held while connecting (8 x 256 ms at 16 kHz)
pub const DEFAULT_PREOPEN_QUEUE_FRAMES: usize = 8;

/// Connection parameters for the live endpoint
#[derive(Clone)]
pub struct LiveConfig {
    pub endpoint_url: String,
    pub api_key: String,
    pub model: String,
    /// Prebuilt voice name, if the endpoint should not pick one
    pub voice: Option<String>,
    /// System instruction passed through verbatim
    pub instruction: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: None,
            instruction: None,
        }
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("instruction", &self.instruction.as_ref().map(|i| i.len()))
            .finish()
    }
}

/// Everything one voice session needs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Microphone rate (default: 16000)
    pub capture_sample_rate: u32,
    /// Output device rate for synthesized audio (default: 24000)
    pub playback_sample_rate: u32,
    /// Channels in inbound audio (default: 1)
    pub playback_channels: usize,
    /// Samples per outbound frame (default: 4096)
    pub frame_size: usize,
    /// Frames queued before the remote opens; 0 drops them instead
    pub preopen_queue_frames: usize,
    pub live: LiveConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            playback_channels: 1,
            frame_size: DEFAULT_FRAME_SIZE,
            preopen_queue_frames: DEFAULT_PREOPEN_QUEUE_FRAMES,
            live: LiveConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_live(mut self, live: LiveConfig) -> Self {
        self.live = live;
        self
    }

    pub fn with_preopen_queue_frames(mut self, frames: usize) -> Self {
        self.preopen_queue_frames = frames;
        self
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(VoiceError::config("sample rates must be non-zero"));
        }
        if self.playback_channels == 0 {
            return Err(VoiceError::config("playback needs at least one channel"));
        }
        if self.frame_size == 0 {
            return Err(VoiceError::config("frame size must be non-zero"));
        }
        if self.live.model.trim().is_empty() {
            return Err(VoiceError::config("model name is empty"));
        }
        Ok(())
    }
}
