//! # Live Coach WebSocket Bridge
//!
//! Lets a browser hold a real-time voice conversation with the coach through
//! the server. Clients connect to `/ws/live`; each connection owns one
//! [`LiveSession`], and the browser itself acts as that session's microphone
//! and speaker.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client opens `/ws/live` and immediately receives `status`
//! 2. **Connect**: `{"type": "connect", "microphone": true}` starts the live session;
//!    `microphone: false` reports that the user refused microphone access
//! 3. **Audio Streaming**: binary messages carry little-endian f32 mono samples at 16kHz,
//!    in packets of any size
//! 4. **Playback**: the server sends `playback` messages with base64 PCM16 and the
//!    delay at which to start each buffer, and `stop` when the user interrupts
//! 5. **Disconnect**: `{"type": "disconnect"}` or closing the socket
//!
//! ## Message Format:
//! - **Client → Server**: `connect`, `disconnect`, `ping` (JSON), audio (binary)
//! - **Server → Client**: `status`, `playback`, `stop`, `error`, `pong` (JSON)

use crate::audio::capture::FrameAssembler;
use crate::audio::codec::encode_binary_to_text;
use crate::audio::device::{
    AudioDeviceProvider, ClockedOutput, CompletionSender, DeviceAccessError, FrameCallback, InputDevice, InputSpec,
    OutputSpec, PlaybackCommand, PlaybackSink,
};
use crate::audio::playback::{BufferId, OutputDevice};
use crate::live::{ConnectError, LiveSession, LiveSessionConfig, SessionStatus, SubscriptionId};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON messages sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start the live session. `microphone` is whether the user granted access.
    Connect {
        #[serde(default = "default_true")]
        microphone: bool,
    },
    Disconnect,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

fn default_true() -> bool {
    true
}

/// JSON messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        status: SessionStatus,
    },
    /// Play `data` (base64 PCM16, interleaved) `delay` seconds from now.
    Playback {
        id: BufferId,
        start_at: f64,
        delay: f64,
        duration: f64,
        sample_rate: u32,
        channels: usize,
        data: String,
    },
    Stop {
        id: BufferId,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        timestamp: u64,
    },
}

impl ServerMessage {
    fn from_playback(command: PlaybackCommand) -> Self {
        match command {
            PlaybackCommand::Play {
                id,
                start_at,
                now,
                buffer,
            } => ServerMessage::Playback {
                id,
                start_at,
                delay: (start_at - now).max(0.0),
                duration: buffer.duration(),
                sample_rate: buffer.sample_rate,
                channels: buffer.channel_count(),
                data: encode_binary_to_text(&buffer.to_interleaved_pcm16()),
            },
            PlaybackCommand::Stop { id } => ServerMessage::Stop { id },
        }
    }

    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Decode a binary audio packet of little-endian f32 samples.
pub fn parse_sample_packet(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "audio packet length {} is not a multiple of 4 bytes",
            bytes.len()
        ));
    }
    let mut samples = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut samples);
    Ok(samples)
}

/// The browser's microphone, fed by binary socket messages.
///
/// Packets are regrouped into fixed-size frames before reaching the capture
/// callback. Samples arriving while no input is open are discarded.
#[derive(Default)]
pub struct BrowserMicrophone {
    inner: Mutex<MicrophoneState>,
}

#[derive(Default)]
struct MicrophoneState {
    assembler: Option<FrameAssembler>,
    callback: Option<FrameCallback>,
}

impl BrowserMicrophone {
    /// Returns how many full frames were delivered.
    pub fn feed(&self, samples: &[f32]) -> usize {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let MicrophoneState { assembler, callback } = &mut *state;
        let (Some(assembler), Some(callback)) = (assembler.as_mut(), callback.as_mut()) else {
            trace!(samples = samples.len(), "Discarding audio with no open input");
            return 0;
        };

        let frames = assembler.push(samples);
        let delivered = frames.len();
        for frame in frames {
            callback(frame);
        }
        delivered
    }

    fn attach(&self, spec: InputSpec, callback: FrameCallback) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.assembler = Some(FrameAssembler::new(spec.block_size, spec.sample_rate));
        state.callback = Some(callback);
    }

    fn detach(&self) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(assembler) = state.assembler.take() {
            debug!(discarded = assembler.pending(), "Browser microphone detached");
        }
        state.callback = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callback
            .is_some()
    }
}

struct BrowserInput {
    microphone: Arc<BrowserMicrophone>,
}

impl InputDevice for BrowserInput {
    fn close(&mut self) {
        self.microphone.detach();
    }
}

/// Audio device provider backed by the connected browser.
pub struct BrowserDevices {
    microphone: Arc<BrowserMicrophone>,
    permission: AtomicBool,
    sink: PlaybackSink,
}

impl BrowserDevices {
    pub fn new(sink: PlaybackSink) -> Self {
        Self {
            microphone: Arc::new(BrowserMicrophone::default()),
            permission: AtomicBool::new(false),
            sink,
        }
    }

    pub fn microphone(&self) -> Arc<BrowserMicrophone> {
        Arc::clone(&self.microphone)
    }

    /// Record the user's answer to the browser's microphone prompt.
    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioDeviceProvider for BrowserDevices {
    async fn request_microphone(&self) -> Result<(), DeviceAccessError> {
        if self.permission.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceAccessError::PermissionDenied)
        }
    }

    async fn open_input(
        &self,
        spec: InputSpec,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputDevice>, DeviceAccessError> {
        self.microphone.attach(spec, on_frame);
        Ok(Box::new(BrowserInput {
            microphone: Arc::clone(&self.microphone),
        }))
    }

    async fn open_output(
        &self,
        _spec: OutputSpec,
        completions: CompletionSender,
    ) -> Result<Box<dyn OutputDevice>, DeviceAccessError> {
        Ok(Box::new(ClockedOutput::new(Arc::clone(&self.sink), completions)))
    }
}

/// Queue a server message on the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ServerMessage);

/// WebSocket actor owning one live session.
///
/// ## Actor Model:
/// Each connection is an independent actor. The session, its event pump and
/// the output device's timers run as tokio tasks and talk back to the actor
/// through its address, so all socket writes happen on the actor.
pub struct LiveCoachSocket {
    state: web::Data<AppState>,
    config: LiveSessionConfig,
    session: Option<Arc<LiveSession>>,
    status_subscription: Option<SubscriptionId>,
    devices: Option<Arc<BrowserDevices>>,
    last_heartbeat: Instant,
}

impl LiveCoachSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let config = LiveSessionConfig::from_app_config(&state.get_config());
        Self {
            state,
            config,
            session: None,
            status_subscription: None,
            devices: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize socket message: {}", e),
        }
    }

    fn handle_connect(&mut self, microphone: bool, ctx: &mut ws::WebsocketContext<Self>) {
        let (Some(session), Some(devices)) = (self.session.clone(), self.devices.as_ref()) else {
            return;
        };

        devices.set_permission(microphone);
        let connecting = session.connect();
        let addr = ctx.address();

        tokio::spawn(async move {
            match connecting.await {
                Ok(()) => debug!(session_id = %session.id(), "Live session transport ready"),
                Err(ConnectError::Cancelled) => {
                    debug!(session_id = %session.id(), "Live connect cancelled");
                }
                Err(e) => {
                    warn!(session_id = %session.id(), "Live connect failed: {}", e);
                    addr.do_send(Outbound(ServerMessage::error(e.code(), e.to_string())));
                }
            }
        });
    }

    /// Tear the session down before the actor handles any further message, so
    /// a `connect` right behind a `disconnect` finds the session inactive.
    fn handle_disconnect(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(session) = self.session.clone() {
            ctx.wait(async move { session.disconnect().await }.into_actor(self));
        }
    }

    fn handle_audio(&mut self, bytes: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let samples = match parse_sample_packet(bytes) {
            Ok(samples) => samples,
            Err(e) => {
                Self::send(ctx, &ServerMessage::error("invalid_audio", e));
                return;
            }
        };

        if let Some(devices) = &self.devices {
            devices.microphone().feed(&samples);
        }
    }
}

impl Actor for LiveCoachSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let weak = ctx.address().downgrade();
        let sink: PlaybackSink = Arc::new(move |command| {
            if let Some(addr) = weak.upgrade() {
                addr.do_send(Outbound(ServerMessage::from_playback(command)));
            }
        });
        let devices = Arc::new(BrowserDevices::new(sink));

        let session = Arc::new(LiveSession::new(
            Arc::clone(&self.state.live_transport),
            devices.clone(),
            self.config.clone(),
        ));

        let weak = ctx.address().downgrade();
        let subscription = session.subscribe(move |status| {
            if let Some(addr) = weak.upgrade() {
                addr.do_send(Outbound(ServerMessage::Status { status }));
            }
        });
        self.status_subscription = Some(subscription);

        info!(session_id = %session.id(), "Live socket opened");
        Self::send(ctx, &ServerMessage::Status {
            status: session.status(),
        });

        self.session = Some(session);
        self.devices = Some(devices);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Live socket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.take() {
            if let Some(subscription) = self.status_subscription.take() {
                session.unsubscribe(subscription);
            }

            let stats = session.capture_stats();
            info!(
                session_id = %session.id(),
                frames_sent = stats.frames_sent(),
                frames_dropped = stats.frames_dropped(),
                replies_in_flight = session.in_flight(),
                timeline_cursor = session.timeline_cursor(),
                "Live socket closed"
            );
            self.state.record_capture(&stats);

            if session.is_active() {
                tokio::spawn(async move { session.disconnect().await });
            }
        }
        self.state.release_session();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveCoachSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Connect { microphone }) => self.handle_connect(microphone, ctx),
                Ok(ClientMessage::Disconnect) => self.handle_disconnect(ctx),
                Ok(ClientMessage::Ping { timestamp }) => Self::send(ctx, &ServerMessage::Pong { timestamp }),
                Err(err) => Self::send(ctx, &ServerMessage::error("invalid_json", format!("Invalid JSON: {}", err))),
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio(&data, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("Live socket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => warn!("Received unexpected continuation frame"),
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Live socket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for LiveCoachSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        Self::send(ctx, &msg.0);
    }
}

/// `GET /ws/live`: upgrade to a live coaching socket.
///
/// Refused with `503` once `performance.max_concurrent_sessions` sockets are open.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let limit = state.get_config().performance.max_concurrent_sessions;
    if !state.try_acquire_session(limit) {
        warn!(limit, "Refusing live socket: session limit reached");
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "session_limit",
                "message": format!("Maximum of {} concurrent live sessions reached", limit),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    }

    info!("New live socket from: {:?}", req.connection_info().peer_addr());
    ws::start(LiveCoachSocket::new(state.clone()), &req, stream).map_err(|e| {
        state.release_session();
        e
    })
}
