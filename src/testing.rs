//! In-memory devices and endpoint for headless tests

use crate::audio::{
    BufferSource, CaptureStream, EndedCallback, Microphone, OutputContext, OutputDevice,
    SampleSink,
};
use crate::codec::{AudioBuffer, EncodedPayload};
use crate::config::LiveConfig;
use crate::error::{Result, VoiceError};
use crate::models::RemoteEvent;
use crate::remote::{Connection, Endpoint, RemoteHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// Output

struct ScheduledRecord {
    start: f64,
    duration: f64,
    buffer: AudioBuffer,
    on_ended: Option<EndedCallback>,
    stopped: bool,
}

#[derive(Default)]
struct FakeOutputState {
    time: f64,
    records: Vec<ScheduledRecord>,
    stopped: usize,
    closed: bool,
}

/// Output context with a hand-driven clock
pub struct FakeOutput {
    sample_rate: u32,
    state: Arc<Mutex<FakeOutputState>>,
}

impl FakeOutput {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            state: Arc::new(Mutex::new(FakeOutputState::default())),
        })
    }

    /// Move the clock without finishing any source
    pub fn set_time(&self, time: f64) {
        self.state.lock().unwrap().time = time;
    }

    /// Move the clock and fire completion for every source that has played out
    pub fn advance_to(&self, time: f64) {
        let finished: Vec<EndedCallback> = {
            let mut state = self.state.lock().unwrap();
            state.time = time;
            state
                .records
                .iter_mut()
                .filter(|r| !r.stopped && r.start + r.duration <= time)
                .filter_map(|r| r.on_ended.take())
                .collect()
        };
        for on_ended in finished {
            on_ended();
        }
    }

    pub fn started_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn stopped_count(&self) -> usize {
        self.state.lock().unwrap().stopped
    }

    pub fn start_times(&self) -> Vec<f64> {
        self.state.lock().unwrap().records.iter().map(|r| r.start).collect()
    }

    pub fn buffers(&self) -> Vec<AudioBuffer> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|r| r.buffer.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl OutputContext for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    fn create_buffer_source(&self, buffer: AudioBuffer) -> Box<dyn BufferSource> {
        Box::new(FakeSource {
            state: self.state.clone(),
            buffer: Some(buffer),
            index: None,
        })
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

struct FakeSource {
    state: Arc<Mutex<FakeOutputState>>,
    buffer: Option<AudioBuffer>,
    index: Option<usize>,
}

impl BufferSource for FakeSource {
    fn start(&mut self, when: f64, on_ended: EndedCallback) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        self.index = Some(state.records.len());
        state.records.push(ScheduledRecord {
            start: when,
            duration: buffer.duration(),
            buffer,
            on_ended: Some(on_ended),
            stopped: false,
        });
    }

    fn stop(&mut self) {
        let Some(index) = self.index.take() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        state.stopped += 1;
        if let Some(record) = state.records.get_mut(index) {
            record.stopped = true;
            record.on_ended = None;
        }
    }
}

/// Output device that hands out one shared [`FakeOutput`] per open
pub struct FakeOutputDevice {
    fail: bool,
    start_time: f64,
    contexts: Mutex<Vec<Arc<FakeOutput>>>,
}

impl FakeOutputDevice {
    pub fn new() -> Arc<Self> {
        Self::starting_at(0.0)
    }

    pub fn starting_at(start_time: f64) -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            start_time,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            start_time: 0.0,
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Most recently opened context
    pub fn last(&self) -> Option<Arc<FakeOutput>> {
        self.contexts.lock().unwrap().last().cloned()
    }

    pub fn open_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn all_closed(&self) -> bool {
        self.contexts.lock().unwrap().iter().all(|c| c.is_closed())
    }
}

impl OutputDevice for FakeOutputDevice {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn OutputContext>> {
        if self.fail {
            return Err(VoiceError::device("no output device"));
        }
        let context = FakeOutput::new(sample_rate);
        context.set_time(self.start_time);
        self.contexts.lock().unwrap().push(context.clone());
        Ok(context)
    }
}

// Microphone

/// Microphone whose samples are pushed by the test
pub struct FakeMicrophone {
    fail: bool,
    sink: Arc<Mutex<Option<SampleSink>>>,
    opened: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            sink: Arc::new(Mutex::new(None)),
            opened: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            sink: Arc::new(Mutex::new(None)),
            opened: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Deliver a block as if from the device callback
    pub fn feed(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink(samples);
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

impl Microphone for FakeMicrophone {
    fn open(&self, _sample_rate: u32, sink: SampleSink) -> Result<Box<dyn CaptureStream>> {
        if self.fail {
            return Err(VoiceError::device("permission denied"));
        }
        *self.sink.lock().unwrap() = Some(sink);
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCaptureStream {
            sink: self.sink.clone(),
            open_streams: self.open_streams.clone(),
            closed: false,
        }))
    }
}

struct FakeCaptureStream {
    sink: Arc<Mutex<Option<SampleSink>>>,
    open_streams: Arc<AtomicUsize>,
    closed: bool,
}

impl CaptureStream for FakeCaptureStream {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            *self.sink.lock().unwrap() = None;
            self.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Endpoint

/// Outbound side recorded for assertions
#[derive(Default)]
pub struct FakeHandle {
    sent: Mutex<Vec<EncodedPayload>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl FakeHandle {
    pub fn sent(&self) -> Vec<EncodedPayload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteHandle for FakeHandle {
    async fn send(&self, payload: &EncodedPayload) -> Result<()> {
        if self.is_closed() {
            return Err(VoiceError::NotConnected);
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Endpoint that opens on demand and lets the test play the server
pub struct FakeEndpoint {
    fail: bool,
    open_signal: Option<Arc<Notify>>,
    connects: AtomicUsize,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    events: Mutex<Option<mpsc::UnboundedSender<RemoteEvent>>>,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false, None))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(true, None))
    }

    /// Connects only after `signal` is notified
    pub fn gated(signal: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self::build(false, Some(signal)))
    }

    fn build(fail: bool, open_signal: Option<Arc<Notify>>) -> Self {
        Self {
            fail,
            open_signal,
            connects: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Handle of the most recent connection
    pub fn handle(&self) -> Option<Arc<FakeHandle>> {
        self.handles.lock().unwrap().last().cloned()
    }

    /// Push a server event into the most recent connection
    pub fn emit(&self, event: RemoteEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    async fn connect(&self, _config: &LiveConfig) -> Result<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = &self.open_signal {
            signal.notified().await;
        }
        if self.fail {
            return Err(VoiceError::connection("connection refused"));
        }

        let handle = Arc::new(FakeHandle::default());
        let (tx, rx) = mpsc::unbounded_channel();
        self.handles.lock().unwrap().push(handle.clone());
        *self.events.lock().unwrap() = Some(tx);

        Ok(Connection {
            handle,
            events: rx,
        })
    }
}

/// Poll `condition` while letting spawned tasks run; panics after one second
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within 1s");
}
