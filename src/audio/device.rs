//! Device seams between the session and the audio backends
//!
//! The session never touches PipeWire directly; it is handed a [`Microphone`]
//! and an [`OutputDevice`] so that tests and headless runs can substitute
//! their own implementations.

use crate::codec::AudioBuffer;
use crate::error::Result;
use std::sync::Arc;

/// Receives mono float blocks from the capture thread.
///
/// Block sizes follow the device's callback cadence and are not guaranteed
/// to match the requested frame size.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;

/// Invoked once when a buffer source plays to its end.
pub type EndedCallback = Box<dyn FnOnce() + Send>;

/// Something that can open a live microphone stream
pub trait Microphone: Send + Sync {
    /// Open a mono capture stream at `sample_rate`.
    ///
    /// Errors with `DeviceUnavailable` when the device cannot be acquired.
    fn open(&self, sample_rate: u32, sink: SampleSink) -> Result<Box<dyn CaptureStream>>;
}

/// A running capture stream
pub trait CaptureStream: Send {
    /// Stop capturing and release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Something that can open an output device context
pub trait OutputDevice: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn OutputContext>>;
}

/// An open output device with its own monotonic clock
pub trait OutputContext: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Device time in seconds; monotonic, starts near zero when opened.
    fn current_time(&self) -> f64;

    fn create_buffer_source(&self, buffer: AudioBuffer) -> Box<dyn BufferSource>;

    /// Release the device. Any sources still playing are silenced.
    fn close(&self);
}

/// One playable buffer.
///
/// `on_ended` is delivered from the device's render thread after the last
/// frame plays. It is never invoked from inside `start` or `stop`, and never
/// for a source that was stopped.
pub trait BufferSource: Send {
    fn start(&mut self, when: f64, on_ended: EndedCallback);

    fn stop(&mut self);
}
