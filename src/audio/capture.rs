//! Microphone capture using PipeWire
//!
//! Each open stream runs its own PipeWire main loop on a background thread
//! and hands mono f32 blocks to the session's sink.

use super::device::{CaptureStream, Microphone, SampleSink};
use crate::error::{Result, VoiceError};
use log::{debug, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long `open` waits for the stream to connect
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) enum PipeWireCommand {
    Stop,
}

/// PipeWire microphone
#[derive(Clone, Debug, Default)]
pub struct PipeWireMicrophone;

impl PipeWireMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl Microphone for PipeWireMicrophone {
    fn open(&self, sample_rate: u32, sink: SampleSink) -> Result<Box<dyn CaptureStream>> {
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let handle = thread::spawn(move || {
            if let Err(e) = run_capture_loop(sample_rate, sink, receiver, &ready_tx) {
                let _ = ready_tx.send(Err(e));
            }
        });

        let mut stream = PipeWireCaptureStream {
            sender: Some(sender),
            thread_handle: Some(handle),
        };

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                debug!("Microphone open at {} Hz", sample_rate);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => {
                stream.close();
                Err(VoiceError::device(e))
            }
            Err(_) => {
                stream.close();
                Err(VoiceError::device("timed out opening microphone"))
            }
        }
    }
}

/// A running PipeWire capture thread
struct PipeWireCaptureStream {
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CaptureStream for PipeWireCaptureStream {
    fn close(&mut self) {
        // Send stop command
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }

        // Wait for thread to finish
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeWireCaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serialized EnumFormat pod requesting F32LE at a fixed rate and channel count
pub(super) fn format_pod_bytes(sample_rate: u32, channels: u32) -> std::result::Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(channels);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

/// Parse a negotiated format into `format`, ignoring anything that is not raw audio
pub(super) fn update_format(
    format: &mut spa::param::audio::AudioInfoRaw,
    id: u32,
    param: Option<&Pod>,
) {
    let Some(param) = param else { return };
    if id != spa::param::ParamType::Format.as_raw() {
        return;
    }

    let (media_type, media_subtype) = match format_utils::parse_format(param) {
        Ok(v) => v,
        Err(_) => return,
    };

    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }

    if let Err(e) = format.parse(param) {
        warn!("Failed to parse negotiated audio format: {:?}", e);
        return;
    }
    debug!(
        "Negotiated {} Hz, {} channel(s)",
        format.rate(),
        format.channels()
    );
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    sample_rate: u32,
    sink: SampleSink,
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
        sink: SampleSink,
        mono: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        sink,
        mono: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Raitha Voice Assistant",
    };

    let stream = pw::stream::StreamBox::new(&core, "raitha-voice-capture", props)
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
            let frame_bytes = std::mem::size_of::<f32>() * n_channels;
            let n_bytes = data.chunk().size() as usize;

            let Some(raw) = data.data() else {
                return;
            };
            let raw = &raw[..n_bytes.min(raw.len())];

            // Average interleaved channels down to mono
            user_data.mono.clear();
            for frame in raw.chunks_exact(frame_bytes) {
                let sum: f32 = frame
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .sum();
                user_data.mono.push(sum / n_channels as f32);
            }

            if !user_data.mono.is_empty() {
                (user_data.sink)(&user_data.mono);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_pod_bytes(sample_rate, 1)?;
    let mut params = [Pod::from_bytes(&values).ok_or("Invalid audio format pod")?];

    stream
        .connect(
            spa::utils::Direction::Input,
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
