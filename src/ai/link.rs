//! Upstream realtime link.
//!
//! One WebSocket to the provider per session, living exactly as long as the
//! session. The write side (setup + audio uploads) sits behind a mutex and
//! is shared by the upload pump; the read side is owned by the demux task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::events::{parse_server_message, UpstreamEvent};
use crate::config::AiConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
const SETUP_ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AiLinkSender {
    sink: Mutex<SplitSink<WsStream, Message>>,
    closed: AtomicBool,
}

pub struct AiLinkReader {
    stream: SplitStream<WsStream>,
}

/// Dial the provider, send the setup record, and wait for its
/// acknowledgement. Returns the shared write half and the owned read half.
pub async fn connect(
    cfg: &AiConfig,
    system_prompt: &str,
    tools: Value,
) -> anyhow::Result<(Arc<AiLinkSender>, AiLinkReader)> {
    let url = format!("{}?key={}", LIVE_ENDPOINT, cfg.api_key);
    info!(model = %cfg.model_id, "Connecting upstream live session");

    let (ws, _response) = connect_async(url.as_str()).await?;
    let (sink, stream) = ws.split();

    let sender = Arc::new(AiLinkSender {
        sink: Mutex::new(sink),
        closed: AtomicBool::new(false),
    });
    let mut reader = AiLinkReader { stream };

    let setup = build_setup_message(cfg, system_prompt, tools);
    sender.send_json(&setup).await?;

    // The provider answers the setup with a single ack before any media.
    let ack = tokio::time::timeout(SETUP_ACK_TIMEOUT, async {
        loop {
            match reader.next_events().await? {
                Some(events) => {
                    if events.contains(&UpstreamEvent::SetupComplete) {
                        return Ok::<_, anyhow::Error>(true);
                    }
                    // Pre-ack noise is legal; keep waiting.
                }
                None => return Ok(false),
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("upstream setup ack timed out"))??;

    if !ack {
        anyhow::bail!("upstream closed before setup ack");
    }

    info!("Upstream session ready");
    Ok((sender, reader))
}

impl AiLinkSender {
    async fn send_json(&self, value: &Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Upload one flushed window of raw PCM.
    pub async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            anyhow::bail!("upstream link is closed");
        }
        let message = build_audio_message(pcm);
        self.send_json(&message).await
    }

    /// Close the upstream transport. Idempotent; later sends fail fast.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("Upstream close frame failed: {}", e);
        }
        info!("Upstream link closed");
    }
}

impl AiLinkReader {
    /// Read one provider message and demux it. `Ok(None)` means the stream
    /// ended; transport errors bubble up to the session teardown.
    pub async fn next_events(&mut self) -> anyhow::Result<Option<Vec<UpstreamEvent>>> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            match message? {
                Message::Text(text) => return Ok(Some(parse_server_message(&text))),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => return Ok(Some(parse_server_message(text))),
                    Err(_) => {
                        warn!("Ignoring non-UTF8 binary frame from provider");
                        continue;
                    }
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => continue,
            }
        }
    }
}

/// The one setup record sent on open: model, audio-only responses, voice and
/// language selector, the rendered per-subject system prompt, and the tool
/// schema. Proactive audio and affective dialog stay on so the assistant
/// opens the conversation and tracks emotional tone.
pub fn build_setup_message(cfg: &AiConfig, system_prompt: &str, tools: Value) -> Value {
    json!({
        "setup": {
            "model": format!("models/{}", cfg.model_id),
            "generation_config": {
                "response_modalities": ["AUDIO"],
                "speech_config": {
                    "voice_config": {
                        "prebuilt_voice_config": { "voice_name": cfg.voice_name }
                    },
                    "language_code": cfg.language_code,
                },
                "proactivity": { "proactive_audio": true },
                "output_audio_transcription": {},
                "enable_affective_dialog": true,
            },
            "system_instruction": {
                "parts": [ { "text": system_prompt } ]
            },
            "tools": tools,
        }
    })
}

/// One realtime media upload, with input transcription enabled so the
/// subject's side of the conversation lands in the transcript too.
pub fn build_audio_message(pcm: &[u8]) -> Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(pcm);
    json!({
        "realtime_input": {
            "media_chunks": [
                { "mime_type": "audio/pcm", "data": encoded }
            ],
            "input_audio_transcription": { "enabled": true },
        }
    })
}
