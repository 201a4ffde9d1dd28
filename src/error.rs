//! Error types for the voice session.

use thiserror::Error;

/// Result type for voice session operations.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Errors that can occur while running a voice session.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone or output device could not be opened.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Inbound audio payload could not be decoded.
    #[error("Malformed audio payload: {0}")]
    MalformedPayload(String),

    /// Remote connect failed or the transport broke.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation on a handle that is not open.
    #[error("Session not connected")]
    NotConnected,

    /// `start()` called while a session is connecting or open.
    #[error("Session already active")]
    AlreadyActive,

    /// The activation was stopped before the remote side opened.
    #[error("Session start cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VoiceError {
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedPayload(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Message suitable for the voice overlay.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable(_) => "microphone or speaker unavailable",
            Self::Cancelled => "voice assistant stopped",
            _ => "voice assistant unavailable",
        }
    }
}
