//! Gapless playback scheduling against the output device clock
//!
//! Decoded buffers are queued back-to-back: each one starts where the
//! previous one ends, or immediately if the device clock has already passed
//! that point. An interruption stops everything in flight and forgets the
//! queued offset.

use crate::audio::{BufferSource, OutputContext};
use crate::codec::AudioBuffer;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Shared clock state and live sources.
///
/// Scheduling and interruption both go through this one lock so a buffer
/// can never be placed using a `next_start_time` from before a reset.
struct SchedulerInner {
    next_start_time: f64,
    live: HashMap<u64, Box<dyn BufferSource>>,
    next_id: u64,
    shut_down: bool,
}

/// Places decoded buffers on an output context in arrival order
pub struct PlaybackScheduler {
    context: Arc<dyn OutputContext>,
    inner: Arc<Mutex<SchedulerInner>>,
}

impl PlaybackScheduler {
    pub fn new(context: Arc<dyn OutputContext>) -> Self {
        Self {
            context,
            inner: Arc::new(Mutex::new(SchedulerInner {
                next_start_time: 0.0,
                live: HashMap::new(),
                next_id: 0,
                shut_down: false,
            })),
        }
    }

    /// Schedule a buffer right after everything already queued.
    ///
    /// Returns the start time in device seconds, or `None` once shut down.
    pub fn schedule(&self, buffer: AudioBuffer) -> Option<f64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shut_down {
            return None;
        }

        let start_at = inner.next_start_time.max(self.context.current_time());
        let duration = buffer.duration();

        let id = inner.next_id;
        inner.next_id += 1;

        let mut source = self.context.create_buffer_source(buffer);
        let live = Arc::downgrade(&self.inner);
        source.start(start_at, Box::new(move || remove_finished(&live, id)));

        inner.next_start_time = start_at + duration;
        inner.live.insert(id, source);

        trace!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} live)",
            id,
            start_at,
            duration,
            inner.live.len()
        );
        Some(start_at)
    }

    /// Barge-in: stop all live sources and reset the clock offset
    pub fn interrupt(&self) {
        let flushed = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_start_time = 0.0;
            std::mem::take(&mut inner.live)
        };
        if !flushed.is_empty() {
            debug!("Interrupted playback, stopping {} source(s)", flushed.len());
        }
        stop_all(flushed);
    }

    /// Flush like [`interrupt`](Self::interrupt) and refuse further scheduling
    pub fn shutdown(&self) {
        let flushed = {
            let mut inner = self.inner.lock().unwrap();
            inner.shut_down = true;
            inner.next_start_time = 0.0;
            std::mem::take(&mut inner.live)
        };
        stop_all(flushed);
    }

    /// Number of sources scheduled or playing
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

}

#[cfg(test)]
impl PlaybackScheduler {
    /// Earliest device time the next buffer may start at (0 when unset)
    pub fn next_start_time(&self) -> f64 {
        self.inner.lock().unwrap().next_start_time
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().unwrap().shut_down
    }
}

fn remove_finished(live: &Weak<Mutex<SchedulerInner>>, id: u64) {
    if let Some(inner) = live.upgrade() {
        if inner.lock().unwrap().live.remove(&id).is_some() {
            trace!("Source {} finished", id);
        }
    }
}

fn stop_all(sources: HashMap<u64, Box<dyn BufferSource>>) {
    for (_, mut source) in sources {
        source.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOutput;

    fn buffer(seconds: f64, rate: u32) -> AudioBuffer {
        AudioBuffer::mono(vec![0.0; (seconds * rate as f64) as usize], rate)
    }

    #[test]
    fn test_back_to_back_starts() {
        let output = FakeOutput::new(24000);
        output.set_time(100.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        let first = scheduler.schedule(buffer(0.5, 24000)).unwrap();
        output.set_time(100.01);
        let second = scheduler.schedule(buffer(0.5, 24000)).unwrap();

        assert_eq!(first, 100.0);
        assert_eq!(second, 100.5);
        assert_eq!(scheduler.live_count(), 2);
    }

    #[test]
    fn test_ordering_without_gaps() {
        let output = FakeOutput::new(24000);
        let scheduler = PlaybackScheduler::new(output.clone());
        let durations = [0.1, 0.25, 0.5, 0.05];

        let starts: Vec<f64> = durations
            .iter()
            .map(|d| scheduler.schedule(buffer(*d, 24000)).unwrap())
            .collect();

        for i in 0..durations.len() - 1 {
            assert!((starts[i + 1] - (starts[i] + durations[i])).abs() < 1e-9);
        }
    }

    #[test]
    fn test_late_buffer_starts_at_clock() {
        let output = FakeOutput::new(24000);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule(buffer(0.5, 24000));
        output.advance_to(3.0);
        let start = scheduler.schedule(buffer(0.5, 24000)).unwrap();

        assert_eq!(start, 3.0);
        assert_eq!(scheduler.next_start_time(), 3.5);
    }

    #[test]
    fn test_finished_sources_leave_live_set() {
        let output = FakeOutput::new(24000);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule(buffer(0.5, 24000));
        scheduler.schedule(buffer(0.5, 24000));
        output.advance_to(0.6);
        assert_eq!(scheduler.live_count(), 1);
        output.advance_to(1.0);
        assert_eq!(scheduler.live_count(), 0);
    }

    #[test]
    fn test_interrupt_resets_clock() {
        let output = FakeOutput::new(24000);
        output.set_time(10.0);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule(buffer(2.0, 24000));
        scheduler.schedule(buffer(2.0, 24000));
        scheduler.interrupt();

        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(output.stopped_count(), 2);

        output.set_time(10.5);
        let start = scheduler.schedule(buffer(0.5, 24000)).unwrap();
        assert_eq!(start, 10.5);
    }

    #[test]
    fn test_shutdown_refuses_new_buffers() {
        let output = FakeOutput::new(24000);
        let scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule(buffer(1.0, 24000));
        scheduler.shutdown();

        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.live_count(), 0);
        assert!(scheduler.schedule(buffer(1.0, 24000)).is_none());
        assert_eq!(output.started_count(), 1);
    }
}
