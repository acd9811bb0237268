//! Downstream WebSocket handler.
//!
//! One connection carries JSON control frames and binary PCM media. Per
//! session, five tasks cooperate under a single cancellation token:
//!
//! - R reads device frames (this function's loop), 60 s read deadline
//! - U drains the upload buffer toward the provider
//! - D demultiplexes provider responses
//! - W writes media/control frames back to the device
//! - T is the idle watchdog (30 s tick, terminates after 5 min of silence)
//!
//! Tripping the token from any of them winds down the other four; the
//! transports are closed once, on the owning side.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ai::analysis::{run_post_call_hook, Analyzer};
use crate::ai::events::UpstreamEvent;
use crate::ai::link::{self, AiLinkSender};
use crate::ai::tools::{default_tools, ToolExecutor};
use crate::ai::upload::{spawn_upload_pump, Flight, UploadConfig, UploadHandle};
use crate::config::AiConfig;
use crate::prompt::render_subject_prompt;
use crate::session::frames::{parse_control_frame, ControlFrame, ServerFrame};
use crate::session::{SessionHandle, SessionRegistry};
use crate::store::calls::format_transcript_segment;
use crate::store::Store;
use crate::types::Subject;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const IDLE_LIMIT: Duration = Duration::from_secs(300);
const IDLE_TICK: Duration = Duration::from_secs(30);
const KEEPALIVE_TICK: Duration = Duration::from_secs(30);
/// Media frames queued toward the device before new ones are dropped.
const EGRESS_CAPACITY: usize = 256;

/// Everything a session needs, wired once in the composition root.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub tools: Arc<ToolExecutor>,
    pub analyzer: Arc<Analyzer>,
    pub ai: AiConfig,
}

enum Outbound {
    Control(ServerFrame),
    Media(Vec<u8>),
}

pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(deps): State<SessionDeps>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, deps))
}

struct SessionState {
    session_id: String,
    subject: Option<Subject>,
    active: bool,
    upstream: Option<Arc<AiLinkSender>>,
    upload: Option<UploadHandle>,
}

async fn handle_socket(socket: WebSocket, deps: SessionDeps) {
    let (sink, mut stream) = socket.split();
    let cancel = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(EGRESS_CAPACITY);
    let last_activity = Arc::new(Mutex::new(Instant::now()));

    // W: single owner of the device write side; also emits keepalive pings.
    let writer = tokio::spawn(write_loop(sink, out_rx, cancel.clone()));

    // T: idle watchdog.
    let watchdog = tokio::spawn(idle_watchdog(last_activity.clone(), cancel.clone()));

    let mut state = SessionState {
        session_id: uuid::Uuid::new_v4().to_string(),
        subject: None,
        active: false,
        upstream: None,
        upload: None,
    };

    // R: device frame reader.
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(READ_DEADLINE, stream.next()) => match read {
                Err(_) => {
                    info!(session = %state.session_id, "Read deadline expired, closing session");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(session = %state.session_id, "Device read error: {}", e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        *last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

        match frame {
            Message::Text(text) => {
                let control = match parse_control_frame(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        // Bad frame: ignore it and keep reading.
                        debug!(session = %state.session_id, "Ignoring unparseable control frame: {}", e);
                        continue;
                    }
                };
                if !handle_control(control, &mut state, &deps, &out_tx, &cancel).await {
                    break;
                }
            }
            Message::Binary(media) => {
                // Media only flows while a call is active; otherwise drop
                // silently.
                if state.active {
                    if let Some(upload) = &state.upload {
                        upload.offer(media.to_vec());
                    }
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    // Teardown: wind down the task tree, close the upstream once, then run
    // the post-call hook (the device is already gone; this is off its path).
    cancel.cancel();
    if let Some(upstream) = &state.upstream {
        upstream.close().await;
    }
    watchdog.abort();
    let _ = writer.await;

    if let Some(subject) = &state.subject {
        deps.registry.remove_if(subject.id, &state.session_id).await;
        if state.active {
            run_post_call_hook(
                deps.store.clone(),
                deps.analyzer.clone(),
                deps.tools.clone(),
                subject.id,
            )
            .await;
        }
    }
    info!(session = %state.session_id, "Session finished");
}

/// Returns false when the session must end.
async fn handle_control(
    frame: ControlFrame,
    state: &mut SessionState,
    deps: &SessionDeps,
    out_tx: &mpsc::Sender<Outbound>,
    cancel: &CancellationToken,
) -> bool {
    match frame {
        ControlFrame::Ping => {
            let _ = out_tx.send(Outbound::Control(ServerFrame::Pong)).await;
            true
        }
        ControlFrame::Hangup => {
            info!(session = %state.session_id, "Device hung up");
            false
        }
        ControlFrame::Register { cpf } => {
            let subject = match deps.store.find_subject_by_auth_key(&cpf).await {
                Ok(Some(subject)) => subject,
                Ok(None) => {
                    // Same answer whether the key is unknown or inactive.
                    warn!(session = %state.session_id, "Registration with unknown subject key");
                    let _ = out_tx
                        .send(Outbound::Control(ServerFrame::error("not registered")))
                        .await;
                    return false;
                }
                Err(e) => {
                    error!(session = %state.session_id, "Subject lookup failed: {}", e);
                    let _ = out_tx
                        .send(Outbound::Control(ServerFrame::error("internal error")))
                        .await;
                    return false;
                }
            };

            deps.registry
                .register(
                    subject.id,
                    SessionHandle {
                        session_id: state.session_id.clone(),
                        cancel: cancel.clone(),
                    },
                )
                .await;
            info!(session = %state.session_id, subject = %subject.name, "Device registered");
            state.subject = Some(subject);
            let _ = out_tx.send(Outbound::Control(ServerFrame::Registered)).await;
            true
        }
        ControlFrame::StartCall => {
            let Some(subject) = state.subject.clone() else {
                let _ = out_tx
                    .send(Outbound::Control(ServerFrame::error("register first")))
                    .await;
                return true;
            };
            if state.active {
                debug!(session = %state.session_id, "start_call on an already-active session");
                return true;
            }

            let template = match deps.store.load_prompt_template("eva_base").await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Prompt template load failed, using fallback: {}", e);
                    None
                }
            };
            let system_prompt = render_subject_prompt(template.as_deref(), &subject);

            let (sender, reader) =
                match link::connect(&deps.ai, &system_prompt, default_tools()).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(session = %state.session_id, "Upstream connect failed: {}", e);
                        let _ = out_tx
                            .send(Outbound::Control(ServerFrame::error("voice engine unavailable")))
                            .await;
                        return true;
                    }
                };

            let flight = Arc::new(Flight::default());

            // U: upload pump.
            let upload = spawn_upload_pump(
                sender.clone(),
                flight.clone(),
                cancel.clone(),
                UploadConfig::default(),
            );

            // D: provider demux.
            tokio::spawn(demux_loop(
                reader,
                flight,
                deps.clone(),
                subject.id,
                out_tx.clone(),
                cancel.clone(),
            ));

            state.upstream = Some(sender);
            state.upload = Some(upload);
            state.active = true;

            info!(session = %state.session_id, subject = %subject.name, "Call session created");
            let _ = out_tx
                .send(Outbound::Control(ServerFrame::session_created(
                    &state.session_id,
                )))
                .await;
            true
        }
    }
}

/// W task: the only writer on the device socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_TICK);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush already-queued frames (e.g. a final error) before
                // closing the transport.
                while let Ok(outbound) = out_rx.try_recv() {
                    let message = match outbound {
                        Outbound::Control(frame) => Message::Text(frame.to_json().into()),
                        Outbound::Media(audio) => Message::Binary(audio.into()),
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                break;
            }
            maybe = out_rx.recv() => {
                let Some(outbound) = maybe else { break };
                let message = match outbound {
                    Outbound::Control(frame) => Message::Text(frame.to_json().into()),
                    Outbound::Media(audio) => Message::Binary(audio.into()),
                };
                if sink.send(message).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// T task: terminate sessions that go quiet.
async fn idle_watchdog(last_activity: Arc<Mutex<Instant>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(IDLE_TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let idle = last_activity
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle >= IDLE_LIMIT {
                    info!("Session idle for {:?}, terminating", idle);
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// D task: read provider responses, clear the in-flight flag, and fan the
/// payloads out: audio to the device writer, transcripts to the store,
/// function calls to the tool executor.
async fn demux_loop(
    mut reader: crate::ai::link::AiLinkReader,
    flight: Arc<Flight>,
    deps: SessionDeps,
    subject_id: i64,
    out_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) {
    let mut egress_dropped: u64 = 0;
    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next_events() => match next {
                Ok(Some(events)) => events,
                Ok(None) => {
                    info!(subject_id, "Upstream closed the session");
                    flight.clear();
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    warn!(subject_id, "Upstream read error: {}", e);
                    flight.clear();
                    cancel.cancel();
                    break;
                }
            },
        };

        // Any upstream response releases the outstanding send.
        flight.clear();

        for event in events {
            match event {
                UpstreamEvent::SetupComplete => {}
                UpstreamEvent::Audio(pcm) => {
                    if out_tx.try_send(Outbound::Media(pcm)).is_err() {
                        egress_dropped += 1;
                        warn!(
                            subject_id,
                            dropped = egress_dropped,
                            "Device egress saturated, dropping audio frame"
                        );
                    }
                }
                UpstreamEvent::UserTranscript(text) => {
                    append_transcript(&deps.store, subject_id, "IDOSO", &text).await;
                }
                UpstreamEvent::AssistantTranscript(text) => {
                    append_transcript(&deps.store, subject_id, "EVA", &text).await;
                }
                UpstreamEvent::TurnComplete => {
                    debug!(subject_id, "Turn complete");
                }
                UpstreamEvent::Interrupted => {
                    debug!(subject_id, "Assistant interrupted by the subject");
                }
                UpstreamEvent::ToolCall { name, args } => {
                    deps.tools.execute(subject_id, &name, &args).await;
                }
            }
        }
    }
}

async fn append_transcript(store: &Store, subject_id: i64, role: &str, text: &str) {
    let segment = format_transcript_segment(role, text);
    if let Err(e) = store.append_transcript(subject_id, &segment).await {
        warn!(subject_id, "Transcript append failed: {}", e);
    }
}
