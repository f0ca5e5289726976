//! # Live Session State Machine
//!
//! Owns one real-time voice conversation with the remote coach: microphone →
//! capture pipeline → transport → remote model → transport → playback
//! scheduler → speaker.
//!
//! ## Session Lifecycle:
//! 1. **Disconnected**: initial and terminal state
//! 2. **Connecting**: devices and transport being acquired
//! 3. **Connected**: the remote accepted the setup; listening
//! 4. **Speaking**: reply audio is queued or playing
//!
//! `connected ⇄ speaking` flips as reply audio arrives and drains. Any state
//! goes back to `disconnected` on `disconnect()`, a transport error, or the
//! remote closing the connection.
//!
//! ## Concurrency Model:
//! Three independent sources touch a session: the capture callback (device
//! thread), the event pump task (transport events and playback completions),
//! and callers of `connect`/`disconnect`. The capture path only reads the
//! `active` flag and the transport slot. The playback scheduler is only
//! mutated from the pump and from teardown, under the resources lock.
//! Status observers are always invoked with no lock held.

use crate::audio::capture::{CapturePipeline, CaptureStats};
use crate::audio::codec::{decode_chunk, parse_pcm_rate};
use crate::audio::device::{AudioDeviceProvider, InputDevice, InputSpec, OutputSpec};
use crate::audio::playback::{BufferId, PlaybackScheduler};
use crate::config::AppConfig;
use crate::live::error::ConnectError;
use crate::live::protocol::{InboundAudio, ServerEvent};
use crate::live::status::{SessionStatus, StatusHub, SubscriptionId};
use crate::live::transport::{LiveSetup, LiveTransport, SharedLink, TransportConnection, TransportEvent};
use futures_util::future::{self, BoxFuture, FutureExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a session needs to know up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionConfig {
    pub setup: LiveSetup,
    pub input: InputSpec,
    pub output: OutputSpec,
}

impl LiveSessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            setup: LiveSetup {
                model: config.live.model.clone(),
                voice_name: config.live.voice_name.clone(),
                system_instruction: config.live.system_instruction.clone(),
            },
            input: InputSpec {
                sample_rate: config.audio.input_sample_rate,
                block_size: config.audio.capture_block_size,
            },
            output: OutputSpec {
                sample_rate: config.audio.output_sample_rate,
                channels: config.audio.output_channels,
            },
        }
    }
}

/// Devices and tasks owned by a connected session.
#[derive(Default)]
struct Resources {
    input: Option<Box<dyn InputDevice>>,
    playback: Option<PlaybackScheduler>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Resources opened by a connect attempt that hasn't committed yet.
#[derive(Default)]
struct Acquired {
    input: Option<Box<dyn InputDevice>>,
    playback: Option<PlaybackScheduler>,
}

impl Acquired {
    fn release(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Shared {
    id: String,
    transport: Arc<dyn LiveTransport>,
    devices: Arc<dyn AudioDeviceProvider>,
    config: LiveSessionConfig,
    status: StatusHub,
    active: Arc<AtomicBool>,
    epoch: AtomicU64,
    link: SharedLink,
    stats: Arc<CaptureStats>,
    resources: Mutex<Resources>,
}

/// One real-time voice conversation.
///
/// ## Usage:
/// ```rust,ignore
/// let session = LiveSession::new(transport, devices, config);
/// session.subscribe(|status| println!("coach is {}", status));
/// session.connect().await?;
/// // ... talk ...
/// session.disconnect().await;
/// ```
pub struct LiveSession {
    shared: Arc<Shared>,
}

impl LiveSession {
    /// Create a disconnected session. The remote client is injected so
    /// several sessions (and tests) can each use their own.
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        devices: Arc<dyn AudioDeviceProvider>,
        config: LiveSessionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4().to_string(),
                transport,
                devices,
                config,
                status: StatusHub::new(),
                active: Arc::new(AtomicBool::new(false)),
                epoch: AtomicU64::new(0),
                link: Arc::new(RwLock::new(None)),
                stats: Arc::new(CaptureStats::default()),
                resources: Mutex::new(Resources::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        self.shared.status.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.status.unsubscribe(id)
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.current()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Next free slot on the playback timeline (0 when nothing is scheduled).
    pub fn timeline_cursor(&self) -> f64 {
        self.shared
            .lock_resources()
            .playback
            .as_ref()
            .map(PlaybackScheduler::timeline_cursor)
            .unwrap_or(0.0)
    }

    /// Reply buffers currently playing or queued.
    pub fn in_flight(&self) -> usize {
        self.shared
            .lock_resources()
            .playback
            .as_ref()
            .map(PlaybackScheduler::in_flight)
            .unwrap_or(0)
    }

    pub fn capture_stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Open devices and the transport.
    ///
    /// `connecting` is emitted before this returns, i.e. before the returned
    /// future is ever polled. The future resolves once the transport
    /// handshake is done; `connected` follows when the remote reports the
    /// session open.
    ///
    /// ## Errors:
    /// - **AlreadyActive**: a connection is already open or opening (nothing is emitted)
    /// - **Device**: microphone/speaker unavailable or permission denied
    /// - **Handshake / Setup**: the transport could not be opened
    /// - **Cancelled**: `disconnect()` was called before the connection was ready
    ///
    /// Every error except `AlreadyActive` leaves the session `disconnected`.
    pub fn connect(&self) -> BoxFuture<'static, Result<(), ConnectError>> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.shared.id, "Ignoring connect on an active live session");
            return future::ready(Err(ConnectError::AlreadyActive)).boxed();
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session_id = %self.shared.id, "Connecting live session");
        self.shared.status.emit(SessionStatus::Connecting);

        let shared = Arc::clone(&self.shared);
        async move { shared.establish(epoch).await }.boxed()
    }

    /// Tear everything down. Safe from any state; always emits `disconnected`.
    pub async fn disconnect(&self) {
        info!(session_id = %self.shared.id, "Disconnecting live session");
        self.shared.teardown().await;
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shared.release_now();
    }
}

impl Shared {
    fn lock_resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<(), ConnectError> {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut acquired = Acquired::default();

        let connection = match self.acquire(&mut acquired, completion_tx).await {
            Ok(connection) => connection,
            Err(err) => {
                acquired.release();
                return Err(self.fail_connect(epoch, err).await);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let committed = {
            let mut resources = self.lock_resources();
            if self.is_current(epoch) {
                resources.input = acquired.input.take();
                resources.playback = acquired.playback.take();
                resources.shutdown = Some(shutdown_tx);
                *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&connection.handle));
                true
            } else {
                false
            }
        };

        if !committed {
            info!(session_id = %self.id, "Connect superseded by disconnect, releasing resources");
            acquired.release();
            connection.handle.close().await;
            return Err(ConnectError::Cancelled);
        }

        debug!(session_id = %self.id, "Live transport linked, starting event pump");
        tokio::spawn(Arc::clone(&self).pump(epoch, connection, completion_rx, shutdown_rx));
        Ok(())
    }

    /// Output first, then microphone permission and input, then the transport.
    async fn acquire(
        &self,
        acquired: &mut Acquired,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<TransportConnection, ConnectError> {
        let output = self.devices.open_output(self.config.output, completions).await?;
        acquired.playback = Some(PlaybackScheduler::new(output));

        self.devices.request_microphone().await?;

        let capture = CapturePipeline::new(Arc::clone(&self.active), Arc::clone(&self.link), Arc::clone(&self.stats));
        let input = self.devices.open_input(self.config.input, capture.into_callback()).await?;
        acquired.input = Some(input);

        self.transport.open(&self.config.setup).await
    }

    async fn fail_connect(&self, epoch: u64, err: ConnectError) -> ConnectError {
        if !self.is_current(epoch) {
            info!(session_id = %self.id, "Connect attempt abandoned: {}", err);
            return ConnectError::Cancelled;
        }

        error!(session_id = %self.id, code = err.code(), "Live session connect failed: {}", err);
        self.teardown().await;
        err
    }

    async fn pump(
        self: Arc<Self>,
        epoch: u64,
        connection: TransportConnection,
        mut completions: mpsc::UnboundedReceiver<BufferId>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut events = connection.events;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(id) = completions.recv() => self.on_playback_complete(epoch, id),
                event = events.recv() => {
                    let event = event.unwrap_or(TransportEvent::Closed { reason: None });
                    if self.on_transport_event(epoch, event).await == Flow::Stop {
                        break;
                    }
                }
            }
        }
        debug!(session_id = %self.id, "Event pump stopped");
    }

    async fn on_transport_event(&self, epoch: u64, event: TransportEvent) -> Flow {
        if !self.is_current(epoch) {
            return Flow::Stop;
        }

        match event {
            TransportEvent::Open | TransportEvent::Message(ServerEvent::SetupComplete) => {
                info!(session_id = %self.id, "Live session open");
                self.status.emit(SessionStatus::Connected);
            }
            TransportEvent::Message(ServerEvent::Audio(audio)) => self.on_audio(audio),
            TransportEvent::Message(ServerEvent::Interrupted) => self.on_interrupted(),
            TransportEvent::Message(ServerEvent::TurnComplete) => {
                debug!(session_id = %self.id, "Model turn complete");
            }
            TransportEvent::Message(ServerEvent::GoAway { time_left }) => {
                warn!(session_id = %self.id, time_left = ?time_left, "Remote announced shutdown");
            }
            TransportEvent::Error(err) => {
                error!(session_id = %self.id, "Live transport error: {}", err);
                self.teardown().await;
                return Flow::Stop;
            }
            TransportEvent::Closed { reason } => {
                info!(session_id = %self.id, reason = ?reason, "Live transport closed");
                self.teardown().await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_audio(&self, audio: InboundAudio) {
        let rate = parse_pcm_rate(&audio.mime_type).unwrap_or(self.config.output.sample_rate);
        let buffer = match decode_chunk(&audio.data, rate, self.config.output.channels) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(session_id = %self.id, "Dropping undecodable reply audio: {}", err);
                return;
            }
        };

        let enqueued = {
            let mut resources = self.lock_resources();
            match resources.playback.as_mut() {
                Some(playback) => Some(playback.enqueue(buffer)),
                None => None,
            }
        };

        match enqueued {
            Some(Ok(_)) => self.status.emit(SessionStatus::Speaking),
            Some(Err(err)) => warn!(session_id = %self.id, "Output device refused reply audio: {}", err),
            None => debug!(session_id = %self.id, "Reply audio arrived with no output device"),
        }
    }

    fn on_interrupted(&self) {
        let stopped = self
            .lock_resources()
            .playback
            .as_mut()
            .map(PlaybackScheduler::flush)
            .unwrap_or(0);
        info!(session_id = %self.id, stopped, "Reply interrupted");
        self.status.emit(SessionStatus::Connected);
    }

    fn on_playback_complete(&self, epoch: u64, id: BufferId) {
        if !self.is_current(epoch) {
            return;
        }

        let drained = self
            .lock_resources()
            .playback
            .as_mut()
            .map(|playback| playback.complete(id))
            .unwrap_or(false);

        if drained && self.status.current() == SessionStatus::Speaking {
            self.status.emit(SessionStatus::Connected);
        }
    }

    /// Full teardown: inactive, transport closed, devices released, playback flushed.
    async fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);

        let (handle, input, playback, shutdown) = {
            let mut resources = self.lock_resources();
            let handle = self.link.write().unwrap_or_else(PoisonError::into_inner).take();
            (
                handle,
                resources.input.take(),
                resources.playback.take(),
                resources.shutdown.take(),
            )
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(handle) = handle {
            handle.close().await;
        }
        if let Some(mut input) = input {
            input.close();
        }
        if let Some(mut playback) = playback {
            playback.close();
        }

        self.status.emit(SessionStatus::Disconnected);
    }

    /// Synchronous release used when the session is dropped without `disconnect()`.
    fn release_now(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut resources = self.lock_resources();
        self.link.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(shutdown) = resources.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut input) = resources.input.take() {
            input.close();
        }
        if let Some(mut playback) = resources.playback.take() {
            playback.close();
        }
        debug!(session_id = %self.id, "Live session dropped while active");
    }
}
