//! Audio output using PipeWire
//!
//! An open [`PipeWireOutput`] context renders every scheduled source through
//! a small mixer at its frame-accurate start offset. The context clock is the
//! number of frames rendered so far divided by the sample rate.

use super::capture::{format_pod_bytes, update_format, PipeWireCommand};
use super::device::{BufferSource, EndedCallback, OutputContext, OutputDevice};
use crate::codec::AudioBuffer;
use crate::error::{Result, VoiceError};
use log::{debug, trace};
use pipewire as pw;
use pw::spa;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

struct Voice {
    id: u64,
    samples: Vec<f32>,
    start_frame: u64,
    position: usize,
    on_ended: Option<EndedCallback>,
}

/// Shared mixer state - thread-safe
#[derive(Clone)]
pub(crate) struct SharedMixer {
    inner: Arc<Mutex<MixerInner>>,
    sample_rate: u32,
}

struct MixerInner {
    /// Frames rendered since the context opened
    rendered_frames: u64,
    voices: Vec<Voice>,
    closed: bool,
}

impl SharedMixer {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MixerInner {
                rendered_frames: 0,
                voices: Vec::new(),
                closed: false,
            })),
            sample_rate,
        }
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.inner.lock().unwrap().rendered_frames as f64 / self.sample_rate as f64
    }

    fn add_voice(&self, voice: Voice) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.voices.push(voice);
        }
    }

    fn remove_voice(&self, id: u64) {
        self.inner.lock().unwrap().voices.retain(|v| v.id != id);
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.voices.clear();
    }

    /// Mix the next `out.len()` mono frames.
    ///
    /// Returns the completion callbacks of voices that finished; the caller
    /// runs them after the mixer lock is released.
    pub(crate) fn render(&self, out: &mut [f32]) -> Vec<EndedCallback> {
        out.fill(0.0);
        let mut finished = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let base = inner.rendered_frames;
        let end = base + out.len() as u64;

        inner.voices.retain_mut(|voice| {
            if voice.start_frame >= end {
                return true;
            }
            // A voice placed in the past starts at the top of this block
            let offset = voice.start_frame.saturating_sub(base) as usize;
            let remaining = &voice.samples[voice.position..];
            let count = remaining.len().min(out.len() - offset);
            for (dst, src) in out[offset..offset + count].iter_mut().zip(remaining) {
                *dst += *src;
            }
            voice.position += count;

            if voice.position >= voice.samples.len() {
                if let Some(on_ended) = voice.on_ended.take() {
                    finished.push(on_ended);
                }
                return false;
            }
            true
        });

        inner.rendered_frames = end;
        finished
    }
}

/// PipeWire output device
#[derive(Clone, Debug, Default)]
pub struct PipeWireOutput;

impl PipeWireOutput {
    pub fn new() -> Self {
        Self
    }
}

impl OutputDevice for PipeWireOutput {
    fn open(&self, sample_rate: u32) -> Result<Arc<dyn OutputContext>> {
        let mixer = SharedMixer::new(sample_rate);
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let loop_mixer = mixer.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = run_playback_loop(sample_rate, loop_mixer, receiver, &ready_tx) {
                let _ = ready_tx.send(Err(e));
            }
        });

        let context = PipeWireOutputContext {
            mixer,
            sample_rate,
            next_source_id: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(Some((sender, handle))),
        };

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                debug!("Output open at {} Hz", sample_rate);
                Ok(Arc::new(context))
            }
            Ok(Err(e)) => {
                context.close();
                Err(VoiceError::device(e))
            }
            Err(_) => {
                context.close();
                Err(VoiceError::device("timed out opening audio output"))
            }
        }
    }
}

/// An open PipeWire playback stream
struct PipeWireOutputContext {
    mixer: SharedMixer,
    sample_rate: u32,
    next_source_id: Arc<AtomicU64>,
    thread: Mutex<Option<(pw::channel::Sender<PipeWireCommand>, JoinHandle<()>)>>,
}

impl OutputContext for PipeWireOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn create_buffer_source(&self, buffer: AudioBuffer) -> Box<dyn BufferSource> {
        Box::new(PipeWireSource {
            id: self.next_source_id.fetch_add(1, Ordering::SeqCst),
            mixer: self.mixer.clone(),
            samples: Some(buffer.to_mono()),
        })
    }

    fn close(&self) {
        self.mixer.close();

        let thread = self.thread.lock().unwrap().take();
        if let Some((sender, handle)) = thread {
            let _ = sender.send(PipeWireCommand::Stop);
            let _ = handle.join();
        }
    }
}

impl Drop for PipeWireOutputContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// One buffer handed to the mixer
struct PipeWireSource {
    id: u64,
    mixer: SharedMixer,
    samples: Option<Vec<f32>>,
}

impl BufferSource for PipeWireSource {
    fn start(&mut self, when: f64, on_ended: EndedCallback) {
        let Some(samples) = self.samples.take() else {
            return;
        };
        let start_frame = (when.max(0.0) * self.mixer.sample_rate as f64).round() as u64;
        trace!("Source {} starts at frame {}", self.id, start_frame);
        self.mixer.add_voice(Voice {
            id: self.id,
            samples,
            start_frame,
            position: 0,
            on_ended: Some(on_ended),
        });
    }

    fn stop(&mut self) {
        self.samples = None;
        self.mixer.remove_voice(self.id);
    }
}

/// Run the PipeWire playback loop in a background thread
fn run_playback_loop(
    sample_rate: u32,
    mixer: SharedMixer,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: &mpsc::Sender<std::result::Result<(), String>>,
) -> std::result::Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    // Set up channel receiver to stop the loop
    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        mixer: SharedMixer,
        mono: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        mixer,
        mono: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Raitha Voice Assistant",
    };

    let stream = pw::stream::StreamBox::new(&core, "raitha-voice-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            update_format(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;
            user_data.mono.resize(n_frames, 0.0);
            let finished = user_data.mixer.render(&mut user_data.mono);

            // Write the mono mix to every channel
            for (i, &sample) in user_data.mono.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for channel in 0..n_channels {
                    let offset = i * stride + channel * 4;
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;

            for on_ended in finished {
                on_ended();
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod_bytes(sample_rate, 1)?;
    let mut params = [Pod::from_bytes(&values).ok_or("Invalid audio format pod")?];

    // Connect the stream (Output direction for playback)
    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until stopped
    mainloop.run();

    Ok(())
}
