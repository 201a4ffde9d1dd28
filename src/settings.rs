//! Persistent preferences using dconf
//!
//! Settings are stored in dconf under `/com/raitha/voice/`. Command-line
//! flags override them for one run; `--save` writes the overrides back.

use log::error;

const DCONF_PATH: &str = "/com/raitha/voice/";

/// Keys for dconf settings
mod keys {
    pub const MODEL: &str = "model";
    pub const VOICE: &str = "voice";
    pub const PREOPEN_QUEUE_FRAMES: &str = "preopen-queue-frames";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

/// Live model name, if one was saved
pub fn get_model() -> Option<String> {
    dconf_rs::get_string(&key(keys::MODEL))
        .ok()
        .filter(|m| !m.is_empty())
}

pub fn set_model(model: &str) {
    if let Err(e) = dconf_rs::set_string(&key(keys::MODEL), model) {
        error!("Failed to save model to dconf: {}", e);
    }
}

/// Prebuilt voice name, if one was saved
pub fn get_voice() -> Option<String> {
    dconf_rs::get_string(&key(keys::VOICE))
        .ok()
        .filter(|v| !v.is_empty())
}

pub fn set_voice(voice: &str) {
    if let Err(e) = dconf_rs::set_string(&key(keys::VOICE), voice) {
        error!("Failed to save voice to dconf: {}", e);
    }
}

/// Frames held while connecting; unset or negative means the default
pub fn get_preopen_queue_frames() -> Option<usize> {
    dconf_rs::get_int(&key(keys::PREOPEN_QUEUE_FRAMES))
        .ok()
        .and_then(|n| usize::try_from(n).ok())
}

pub fn set_preopen_queue_frames(frames: usize) {
    let value = i32::try_from(frames).unwrap_or(i32::MAX);
    if let Err(e) = dconf_rs::set_int(&key(keys::PREOPEN_QUEUE_FRAMES), value) {
        error!("Failed to save pre-open queue size to dconf: {}", e);
    }
}
