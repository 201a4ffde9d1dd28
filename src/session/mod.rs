//! Streaming voice session
//!
//! A [`VoiceSession`] runs one activation at a time: it opens the output
//! device, the microphone and the remote connection, then pumps captured
//! frames out and schedules received audio until it is stopped or the remote
//! side ends the session.
//!
//! State transitions and the activation slot share one lock. Background
//! tasks carry the epoch of the activation that spawned them and do nothing
//! once a newer activation (or none) occupies the slot.

mod pipeline;

use pipeline::{CapturePipeline, LevelMeter, OutboundGate};

use crate::audio::{CaptureStream, Microphone, OutputContext, OutputDevice};
use crate::codec::{decode_inbound, EncodedPayload};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::models::{ActivationInfo, InboundMessage, RemoteEvent, SessionLevels, SessionState};
use crate::remote::{Connection, Endpoint, RemoteHandle};
use crate::scheduler::PlaybackScheduler;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Resources owned by one `start()`
struct Activation {
    epoch: u64,
    info: ActivationInfo,
    gate: Arc<OutboundGate>,
    capture: Option<Box<dyn CaptureStream>>,
    output: Option<Arc<dyn OutputContext>>,
    scheduler: Option<Arc<PlaybackScheduler>>,
    handle: Option<Arc<dyn RemoteHandle>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Activation {
    fn new(epoch: u64, preopen_queue_frames: usize) -> Self {
        Self {
            epoch,
            info: ActivationInfo::new(),
            gate: Arc::new(OutboundGate::new(preopen_queue_frames)),
            capture: None,
            output: None,
            scheduler: None,
            handle: None,
            writer: None,
            reader: None,
        }
    }

    /// Stop moving audio in either direction
    fn stop_tasks(&mut self) {
        self.gate.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Close local devices. Blocks while device threads wind down.
    fn release_devices(&mut self) {
        self.stop_tasks();
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(output) = self.output.take() {
            output.close();
        }
        self.handle = None;
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.release_devices();
    }
}

#[derive(Default)]
struct Slot {
    last_epoch: u64,
    activation: Option<Activation>,
}

struct Shared {
    config: SessionConfig,
    microphone: Arc<dyn Microphone>,
    output: Arc<dyn OutputDevice>,
    endpoint: Arc<dyn Endpoint>,
    state: watch::Sender<SessionState>,
    meter: LevelMeter,
    slot: Mutex<Slot>,
}

impl Shared {
    /// Callers hold the slot lock
    fn set_state(&self, state: SessionState) {
        debug!("Session state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Store `value` in the activation for `epoch`, or hand it back if that
    /// activation is gone
    fn install<T>(
        &self,
        epoch: u64,
        value: T,
        place: impl FnOnce(&mut Activation, T),
    ) -> std::result::Result<(), T> {
        let mut slot = self.slot.lock().unwrap();
        match slot.activation.as_mut() {
            Some(activation) if activation.epoch == epoch => {
                place(activation, value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Detach the activation for `epoch` and move to `state`
    fn end_activation(&self, epoch: u64, state: SessionState) -> Option<Activation> {
        let mut slot = self.slot.lock().unwrap();
        if slot.activation.as_ref().map(|a| a.epoch) != Some(epoch) {
            return None;
        }
        self.set_state(state);
        slot.activation.take()
    }
}

/// One voice assistant session
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    pub fn new(
        config: SessionConfig,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn OutputDevice>,
        endpoint: Arc<dyn Endpoint>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                microphone,
                output,
                endpoint,
                state,
                meter: LevelMeter::new(),
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    /// Whether the voice overlay should be visible
    pub fn is_active(&self) -> bool {
        self.shared.state.borrow().is_active()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Current microphone levels
    pub fn levels(&self) -> SessionLevels {
        self.shared.meter.levels()
    }

    pub fn activation(&self) -> Option<ActivationInfo> {
        let slot = self.shared.slot.lock().unwrap();
        slot.activation.as_ref().map(|a| a.info.clone())
    }

    /// Playback sources scheduled or playing
    pub fn live_sources(&self) -> usize {
        let slot = self.shared.slot.lock().unwrap();
        slot.activation
            .as_ref()
            .and_then(|a| a.scheduler.as_ref())
            .map_or(0, |s| s.live_count())
    }

    /// Captured frames waiting for the remote to open
    pub fn queued_frames(&self) -> usize {
        let slot = self.shared.slot.lock().unwrap();
        slot.activation.as_ref().map_or(0, |a| a.gate.queued_len())
    }

    /// Open devices and connect.
    ///
    /// Resolves once the remote side is open. Fails with `AlreadyActive`
    /// while connecting or open, and with `Cancelled` if `stop()` ran first.
    /// Any other failure releases everything acquired so far and leaves the
    /// session in `Error`.
    pub async fn start(&self) -> Result<()> {
        self.shared.config.validate()?;

        let (epoch, gate) = {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.activation.is_some() || !self.shared.state.borrow().can_start() {
                return Err(VoiceError::AlreadyActive);
            }
            slot.last_epoch += 1;
            let activation = Activation::new(slot.last_epoch, self.shared.config.preopen_queue_frames);
            info!("Starting voice session {}", activation.info.id);
            let started = (activation.epoch, activation.gate.clone());
            slot.activation = Some(activation);
            self.shared.meter.reset();
            self.shared.set_state(SessionState::Connecting);
            started
        };

        match self.activate(epoch, gate).await {
            Ok(()) => Ok(()),
            Err(VoiceError::Cancelled) => {
                info!("Voice session start cancelled");
                Err(VoiceError::Cancelled)
            }
            Err(e) => {
                error!("Voice session failed to start: {}", e);
                match self
                    .shared
                    .end_activation(epoch, SessionState::Error(e.to_string()))
                {
                    Some(activation) => {
                        release(activation).await;
                        Err(e)
                    }
                    None => Err(VoiceError::Cancelled),
                }
            }
        }
    }

    async fn activate(&self, epoch: u64, gate: Arc<OutboundGate>) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;

        let device = shared.output.clone();
        let playback_rate = config.playback_sample_rate;
        let context = run_blocking(move || device.open(playback_rate)).await?;
        let scheduler = Arc::new(PlaybackScheduler::new(context.clone()));
        if let Err((context, _)) = shared.install(
            epoch,
            (context.clone(), scheduler.clone()),
            |a, (context, scheduler)| {
                a.output = Some(context);
                a.scheduler = Some(scheduler);
            },
        ) {
            let _ = run_blocking(move || {
                context.close();
                Ok(())
            })
            .await;
            return Err(VoiceError::Cancelled);
        }

        let sink = CapturePipeline::new(
            config.frame_size,
            config.capture_sample_rate,
            gate.clone(),
            shared.meter.clone(),
        )
        .into_sink();
        let microphone = shared.microphone.clone();
        let capture_rate = config.capture_sample_rate;
        let capture = run_blocking(move || microphone.open(capture_rate, sink)).await?;
        if let Err(mut capture) = shared.install(epoch, capture, |a, c| a.capture = Some(c)) {
            let _ = run_blocking(move || {
                capture.close();
                Ok(())
            })
            .await;
            return Err(VoiceError::Cancelled);
        }

        let Connection { handle, events } = shared.endpoint.connect(&config.live).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(outbound_rx, handle.clone()));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(shared),
            epoch,
            events,
            scheduler,
            context.sample_rate(),
            config.playback_channels,
        ));

        let opened = {
            let mut slot = shared.slot.lock().unwrap();
            match slot.activation.as_mut() {
                Some(activation) if activation.epoch == epoch => {
                    activation.handle = Some(handle.clone());
                    activation.writer = Some(writer);
                    activation.reader = Some(reader);
                    gate.open(outbound_tx);
                    shared.set_state(SessionState::Open);
                    true
                }
                _ => {
                    writer.abort();
                    reader.abort();
                    false
                }
            }
        };

        if !opened {
            debug!("Stopped while connecting, closing late connection");
            if let Err(e) = handle.close().await {
                debug!("Closing late connection: {}", e);
            }
            return Err(VoiceError::Cancelled);
        }

        info!("Voice session open");
        Ok(())
    }

    /// Tear down the current activation and move to `Closed`.
    ///
    /// Safe to call from any state and any number of times.
    pub async fn stop(&self) {
        let activation = {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.activation.is_none() && *self.shared.state.borrow() == SessionState::Closed {
                return;
            }
            info!("Stopping voice session");
            self.shared.set_state(SessionState::Closed);
            slot.activation.take()
        };

        if let Some(activation) = activation {
            release(activation).await;
        }
    }
}

/// Close the remote handle, then the devices off the async runtime
async fn release(mut activation: Activation) {
    activation.stop_tasks();
    if let Some(handle) = activation.handle.take() {
        if let Err(e) = handle.close().await {
            debug!("Closing remote connection: {}", e);
        }
    }
    let _ = tokio::task::spawn_blocking(move || drop(activation)).await;
}

/// Device opens and closes block on PipeWire threads
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VoiceError::device(format!("device task failed: {}", e)))?
}

/// Send captured frames in order; failures are not reported back to capture
async fn write_loop(
    mut outbound: mpsc::UnboundedReceiver<EncodedPayload>,
    handle: Arc<dyn RemoteHandle>,
) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = handle.send(&payload).await {
            debug!("Dropping outbound frame: {}", e);
        }
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    scheduler: Arc<PlaybackScheduler>,
    sample_rate: u32,
    channels: usize,
) {
    let ending = loop {
        match events.recv().await {
            Some(RemoteEvent::Message(message)) => {
                play_message(&scheduler, &message, sample_rate, channels)
            }
            Some(RemoteEvent::Closed(reason)) => {
                info!("Remote closed the session: {}", reason);
                break SessionState::Closed;
            }
            Some(RemoteEvent::Error(reason)) => {
                error!("Remote session error: {}", reason);
                break SessionState::Error(reason);
            }
            None => {
                debug!("Remote event stream ended");
                break SessionState::Closed;
            }
        }
    };
    drop(scheduler);

    let Some(shared) = shared.upgrade() else {
        return;
    };
    if let Some(mut activation) = shared.end_activation(epoch, ending) {
        // Detach rather than abort the task we are running on
        drop(activation.reader.take());
        release(activation).await;
    }
}

fn play_message(
    scheduler: &PlaybackScheduler,
    message: &InboundMessage,
    sample_rate: u32,
    channels: usize,
) {
    if let Some(payload) = &message.audio {
        if let Some(rate) = payload.sample_rate().filter(|&rate| rate != sample_rate) {
            warn!(
                "Inbound audio tagged {} Hz, playing at the output rate of {} Hz",
                rate, sample_rate
            );
        }
        match decode_inbound(payload, sample_rate, channels) {
            Ok(buffer) => {
                scheduler.schedule(buffer);
            }
            Err(e) => warn!("Dropping inbound audio: {}", e),
        }
    }
    if message.interrupted {
        info!("Interrupted, flushing playback");
        scheduler.interrupt();
    }
    if message.turn_complete {
        debug!("Turn complete");
    }
}
