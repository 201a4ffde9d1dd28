//! Capture side of a session: level metering, framing and the outbound gate

use crate::audio::SampleSink;
use crate::codec::{encode_outbound, EncodedPayload};
use crate::models::SessionLevels;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Microphone levels shared between the capture thread and the UI
#[derive(Clone, Default)]
pub struct LevelMeter {
    inner: Arc<Mutex<SessionLevels>>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn levels(&self) -> SessionLevels {
        *self.inner.lock().unwrap()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = SessionLevels::default();
    }

    /// Fold a captured block into the smoothed levels
    pub fn process(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let rms = calculate_rms(samples);
        let max = calculate_peak(samples);

        let mut levels = self.inner.lock().unwrap();
        // Smooth volume level for display
        levels.volume = levels.volume * 0.7 + rms * 0.3;
        // Track peak with slow decay
        levels.peak = (levels.peak * 0.95).max(max);
    }
}

/// Calculate RMS volume from samples
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Calculate peak volume from samples
pub fn calculate_peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

enum GateState {
    /// Remote not open yet; holds at most `capacity` frames
    Pending(VecDeque<EncodedPayload>),
    Open(mpsc::UnboundedSender<EncodedPayload>),
    Closed,
}

/// Where encoded frames go before, during and after the remote is open.
///
/// Frames are forwarded in capture order. While connecting, the oldest
/// queued frame is dropped once the queue is full.
pub struct OutboundGate {
    state: Mutex<GateState>,
    capacity: usize,
}

impl OutboundGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState::Pending(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Hand a frame to the remote, queue it, or drop it.
    ///
    /// Returns whether the frame was kept.
    pub fn push(&self, payload: EncodedPayload) -> bool {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            GateState::Pending(queue) => {
                if self.capacity == 0 {
                    trace!("Remote not open, dropping frame");
                    return false;
                }
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    debug!("Pre-open queue full, dropped oldest frame");
                }
                queue.push_back(payload);
                true
            }
            GateState::Open(sender) => sender.send(payload).is_ok(),
            GateState::Closed => false,
        }
    }

    /// Flush queued frames to `sender` and forward everything after them
    pub fn open(&self, sender: mpsc::UnboundedSender<EncodedPayload>) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, GateState::Closed) {
            GateState::Pending(queue) => {
                if !queue.is_empty() {
                    debug!("Flushing {} queued frame(s)", queue.len());
                }
                for payload in queue {
                    if sender.send(payload).is_err() {
                        warn!("Outbound channel closed while flushing");
                        return;
                    }
                }
                *state = GateState::Open(sender);
            }
            GateState::Open(_) => {
                warn!("Outbound gate opened twice");
                *state = GateState::Open(sender);
            }
            GateState::Closed => {}
        }
    }

    /// Drop queued frames and refuse new ones; ends the forwarding channel
    pub fn close(&self) {
        *self.state.lock().unwrap() = GateState::Closed;
    }

    pub fn queued_len(&self) -> usize {
        match &*self.state.lock().unwrap() {
            GateState::Pending(queue) => queue.len(),
            _ => 0,
        }
    }
}

/// Re-blocks device callbacks into fixed frames and pushes them through the gate
pub struct CapturePipeline {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    gate: Arc<OutboundGate>,
    meter: LevelMeter,
}

impl CapturePipeline {
    pub fn new(frame_size: usize, sample_rate: u32, gate: Arc<OutboundGate>, meter: LevelMeter) -> Self {
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            gate,
            meter,
        }
    }

    /// Process one device callback
    pub fn push_samples(&mut self, samples: &[f32]) {
        self.meter.process(samples);
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let payload = encode_outbound(&frame, self.sample_rate);
            self.gate.push(payload);
        }
    }

    /// Wrap the pipeline as a microphone sink
    pub fn into_sink(mut self) -> SampleSink {
        Box::new(move |samples| self.push_samples(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_inbound;

    fn frame(value: f32, len: usize) -> EncodedPayload {
        encode_outbound(&vec![value; len], 16000)
    }

    fn first_sample(payload: &EncodedPayload) -> f32 {
        decode_inbound(payload, 16000, 1).unwrap().channel(0).unwrap()[0]
    }

    #[test]
    fn test_calculate_rms() {
        assert_eq!(calculate_rms(&[]), 0.0);
        assert!((calculate_rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_calculate_peak() {
        assert_eq!(calculate_peak(&[0.1, -0.8, 0.3]), 0.8);
        assert_eq!(calculate_peak(&[]), 0.0);
    }

    #[test]
    fn test_level_meter_smoothing() {
        let meter = LevelMeter::new();
        meter.process(&[1.0, -1.0]);
        let levels = meter.levels();
        assert!((levels.volume - 0.3).abs() < 1e-6);
        assert_eq!(levels.peak, 1.0);

        meter.process(&[0.0; 4]);
        let levels = meter.levels();
        assert!((levels.volume - 0.21).abs() < 1e-6);
        assert!((levels.peak - 0.95).abs() < 1e-6);

        meter.reset();
        assert_eq!(meter.levels(), SessionLevels::default());
    }

    #[test]
    fn test_gate_flushes_in_order_on_open() {
        let gate = OutboundGate::new(8);
        assert!(gate.push(frame(0.1, 4)));
        assert!(gate.push(frame(0.2, 4)));
        assert_eq!(gate.queued_len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.open(tx);
        assert!(gate.push(frame(0.3, 4)));

        let received: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|p| first_sample(&p))
            .collect();
        assert_eq!(received.len(), 3);
        assert!((received[0] - 0.1).abs() < 1e-3);
        assert!((received[1] - 0.2).abs() < 1e-3);
        assert!((received[2] - 0.3).abs() < 1e-3);
        assert_eq!(gate.queued_len(), 0);
    }

    #[test]
    fn test_gate_drops_oldest_when_full() {
        let gate = OutboundGate::new(2);
        gate.push(frame(0.1, 4));
        gate.push(frame(0.2, 4));
        gate.push(frame(0.3, 4));
        assert_eq!(gate.queued_len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.open(tx);
        let received: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|p| first_sample(&p))
            .collect();
        assert_eq!(received.len(), 2);
        assert!((received[0] - 0.2).abs() < 1e-3);
        assert!((received[1] - 0.3).abs() < 1e-3);
    }

    #[test]
    fn test_gate_without_queue_drops_until_open() {
        let gate = OutboundGate::new(0);
        assert!(!gate.push(frame(0.1, 4)));
        assert_eq!(gate.queued_len(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.open(tx);
        assert!(gate.push(frame(0.2, 4)));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gate_closed_refuses_and_ends_channel() {
        let gate = OutboundGate::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.open(tx);
        gate.close();
        assert!(!gate.push(frame(0.1, 4)));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // Opening after close is ignored
        let (tx, _rx) = mpsc::unbounded_channel();
        gate.open(tx);
        assert!(!gate.push(frame(0.1, 4)));
    }

    #[test]
    fn test_pipeline_reblocks_into_frames() {
        let gate = Arc::new(OutboundGate::new(16));
        let mut pipeline = CapturePipeline::new(4096, 16000, gate.clone(), LevelMeter::new());

        pipeline.push_samples(&vec![0.0; 1000]);
        assert_eq!(gate.queued_len(), 0);
        pipeline.push_samples(&vec![0.0; 4000]);
        assert_eq!(gate.queued_len(), 1);
        pipeline.push_samples(&vec![0.0; 4096 * 2]);
        assert_eq!(gate.queued_len(), 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        gate.open(tx);
        let payload = rx.try_recv().unwrap();
        assert_eq!(payload.mime_type, "audio/pcm;rate=16000");
        assert_eq!(payload.decode_bytes().unwrap().len(), 8192);
    }

    #[test]
    fn test_sink_updates_levels() {
        let gate = Arc::new(OutboundGate::new(0));
        let meter = LevelMeter::new();
        let mut sink = CapturePipeline::new(4096, 16000, gate, meter.clone()).into_sink();
        sink(&[0.5; 128]);
        assert!(meter.levels().volume > 0.0);
        assert_eq!(meter.levels().peak, 0.5);
    }
}
