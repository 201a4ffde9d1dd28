//! Audio devices for the voice session
//!
//! This module provides:
//! - The device traits the session is built against
//! - Microphone capture and scheduled playback using PipeWire
//! - A WAV file microphone for headless runs via hound

mod capture;
mod device;
mod playback;
mod wav_input;

pub use capture::PipeWireMicrophone;
pub use device::{
    BufferSource, CaptureStream, EndedCallback, Microphone, OutputContext, OutputDevice,
    SampleSink,
};
pub use playback::PipeWireOutput;
pub use wav_input::WavMicrophone;
