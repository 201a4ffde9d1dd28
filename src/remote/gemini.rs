//! Gemini Live endpoint over WebSocket
//!
//! 1. Connect to the BidiGenerateContent socket
//! 2. Send `setup` and wait for `setupComplete` (the session is open)
//! 3. Stream microphone audio as `realtimeInput` and translate each
//!    `serverContent` frame into an [`InboundMessage`]
//!
//! Gemini may deliver JSON in binary frames, so both frame types are parsed.

use super::{Connection, Endpoint, RemoteHandle};
use crate::codec::EncodedPayload;
use crate::config::LiveConfig;
use crate::error::{Result, VoiceError};
use crate::models::{InboundMessage, RemoteEvent};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

// Client messages

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: Vec<&'a EncodedPayload>,
}

// Server messages

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    inline_data: Option<InlineData>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

/// A parsed server frame
#[derive(Debug, PartialEq)]
enum ServerFrame {
    SetupComplete,
    Content(InboundMessage),
    GoAway,
    Other,
}

fn parse_server_frame(raw: &str) -> Result<ServerFrame> {
    let message: ServerMessage = serde_json::from_str(raw)?;

    if message.setup_complete.is_some() {
        return Ok(ServerFrame::SetupComplete);
    }
    if message.go_away.is_some() {
        return Ok(ServerFrame::GoAway);
    }

    let Some(content) = message.server_content else {
        return Ok(ServerFrame::Other);
    };

    let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
    for text in parts.iter().filter_map(|p| p.text.as_deref()) {
        debug!("Assistant text: {}", text);
    }
    let audio = parts
        .into_iter()
        .find_map(|p| p.inline_data)
        .map(|inline| EncodedPayload::new(inline.mime_type, inline.data));

    Ok(ServerFrame::Content(InboundMessage {
        audio,
        interrupted: content.interrupted,
        turn_complete: content.turn_complete,
    }))
}

/// Text of a frame that may carry JSON, or `None` for control frames
fn frame_text(message: &Message) -> Option<std::borrow::Cow<'_, str>> {
    match message {
        Message::Text(text) => Some(std::borrow::Cow::Borrowed(text.as_str())),
        Message::Binary(bytes) => Some(String::from_utf8_lossy(bytes)),
        _ => None,
    }
}

fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

fn setup_message(config: &LiveConfig) -> ClientMessage<'static> {
    ClientMessage {
        setup: Some(Setup {
            model: normalize_model(&config.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: config.voice.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: config.instruction.as_ref().map(|text| Content {
                parts: vec![TextPart { text: text.clone() }],
            }),
        }),
        realtime_input: None,
    }
}

// Endpoint

/// Gemini Live BidiGenerateContent endpoint
#[derive(Debug, Default, Clone)]
pub struct GeminiLive;

impl GeminiLive {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Endpoint for GeminiLive {
    async fn connect(&self, config: &LiveConfig) -> Result<Connection> {
        if config.api_key.is_empty() {
            return Err(VoiceError::config("missing API key"));
        }

        let url = format!("{}?key={}", config.endpoint_url, config.api_key);
        let request = url
            .into_client_request()
            .map_err(|e| VoiceError::connection(format!("Failed to create client request: {}", e)))?;

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| VoiceError::connection(format!("WebSocket connect error: {}", e)))?;
        let (mut sink, mut source) = ws.split();

        let setup = serde_json::to_string(&setup_message(config))?;
        info!("Sending setup for model {}", config.model);
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| VoiceError::connection(format!("Send error: {}", e)))?;

        tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup(&mut source))
            .await
            .map_err(|_| VoiceError::connection("timed out waiting for setupComplete"))??;

        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(source, events_tx, connected.clone()));

        let handle = GeminiHandle {
            sink: Mutex::new(sink),
            connected,
        };

        Ok(Connection {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

async fn wait_for_setup(source: &mut WsSource) -> Result<()> {
    while let Some(frame) = source.next().await {
        let frame = frame.map_err(|e| VoiceError::connection(format!("Receive error: {}", e)))?;
        if let Message::Close(close) = &frame {
            let reason = close.as_ref().map(|c| c.reason.to_string()).unwrap_or_default();
            return Err(VoiceError::connection(format!("closed during setup: {}", reason)));
        }
        let Some(text) = frame_text(&frame) else {
            continue;
        };
        match parse_server_frame(&text) {
            Ok(ServerFrame::SetupComplete) => {
                debug!("Setup complete");
                return Ok(());
            }
            Ok(other) => trace!("Ignoring frame before setup: {:?}", other),
            Err(e) => warn!("Unparseable frame during setup: {}", e),
        }
    }
    Err(VoiceError::connection("connection ended during setup"))
}

async fn read_loop(
    mut source: WsSource,
    events: mpsc::UnboundedSender<RemoteEvent>,
    connected: Arc<AtomicBool>,
) {
    let terminal = loop {
        let Some(frame) = source.next().await else {
            break RemoteEvent::Closed("connection ended".to_string());
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => break RemoteEvent::Error(format!("Receive error: {}", e)),
        };
        if let Message::Close(close) = &frame {
            let reason = close.as_ref().map(|c| c.reason.to_string()).unwrap_or_default();
            break RemoteEvent::Closed(reason);
        }
        let Some(text) = frame_text(&frame) else {
            continue;
        };
        match parse_server_frame(&text) {
            Ok(ServerFrame::Content(message)) if !message.is_empty() => {
                if events.send(RemoteEvent::Message(message)).is_err() {
                    // session dropped its receiver
                    break RemoteEvent::Closed("receiver dropped".to_string());
                }
            }
            Ok(ServerFrame::GoAway) => info!("Server announced it will close the session soon"),
            Ok(_) => {}
            Err(e) => warn!("Unparseable server frame: {}", e),
        }
    };

    connected.store(false, Ordering::SeqCst);
    debug!("Read loop finished: {:?}", terminal);
    let _ = events.send(terminal);
}

/// Outbound half of a Gemini Live connection
struct GeminiHandle {
    sink: Mutex<WsSink>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteHandle for GeminiHandle {
    async fn send(&self, payload: &EncodedPayload) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(VoiceError::NotConnected);
        }
        let message = ClientMessage {
            setup: None,
            realtime_input: Some(RealtimeInput {
                media_chunks: vec![payload],
            }),
        };
        let text = serde_json::to_string(&message)?;

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| VoiceError::connection(format!("Send error: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(None))
            .await
            .map_err(|e| VoiceError::connection(format!("Close error: {}", e)))
    }
}
