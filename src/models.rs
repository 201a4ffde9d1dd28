//! Session state and remote message models

use crate::codec::EncodedPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a voice session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Error(String), // reason shown to the user
}

impl SessionState {
    /// Whether the voice overlay should be shown
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }

    /// Whether `start()` may begin a new activation from here
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Closed | SessionState::Error(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error(_))
    }
}

/// One message from the remote side
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundMessage {
    pub audio: Option<EncodedPayload>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl InboundMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && !self.interrupted && !self.turn_complete
    }
}

#[cfg(test)]
impl InboundMessage {
    pub fn audio(payload: EncodedPayload) -> Self {
        Self {
            audio: Some(payload),
            ..Default::default()
        }
    }

    pub fn interruption() -> Self {
        Self {
            interrupted: true,
            ..Default::default()
        }
    }
}

/// What the remote connection reports after it opens
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Message(InboundMessage),
    Closed(String),
    Error(String),
}

/// Identity of one `start()` activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ActivationInfo {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// Seconds since the activation began
    pub fn elapsed_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

impl Default for ActivationInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Microphone levels for the listening indicator
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionLevels {
    /// Smoothed RMS level (0.0 - 1.0)
    pub volume: f32,
    /// Peak level with slow decay
    pub peak: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Open.is_active());
        assert!(!SessionState::Closed.is_active());
        assert!(!SessionState::Error("x".into()).is_active());
    }

    #[test]
    fn test_start_allowed() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Closed.can_start());
        assert!(SessionState::Error("x".into()).can_start());
        assert!(!SessionState::Open.can_start());
        assert!(!SessionState::Connecting.can_start());
    }

    #[test]
    fn test_empty_message() {
        assert!(InboundMessage::default().is_empty());
        assert!(!InboundMessage::interruption().is_empty());
    }
}
