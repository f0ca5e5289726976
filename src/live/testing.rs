//! Scripted transport and devices for exercising the live session in tests.

use crate::audio::codec::{AudioFrame, EncodedChunk};
use crate::audio::device::{
    AudioDeviceProvider, CompletionSender, DeviceAccessError, DeviceKind, FrameCallback, InputDevice, InputSpec,
    OutputSpec,
};
use crate::audio::playback::{BufferId, OutputDevice, PlaybackBuffer};
use crate::live::error::{ConnectError, TransportError};
use crate::live::transport::{LiveSetup, LiveTransport, TransportConnection, TransportEvent, TransportHandle};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// Transport handle that records everything sent through it.
#[derive(Default)]
pub struct RecordingHandle {
    sent: Mutex<Vec<EncodedChunk>>,
    closed: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingHandle {
    pub fn sent(&self) -> Vec<EncodedChunk> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportHandle for RecordingHandle {
    fn send_audio(&self, chunk: EncodedChunk) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport whose connections are driven by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    handle: Arc<RecordingHandle>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    refuse: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    opened: AtomicUsize,
    setups: Mutex<Vec<LiveSetup>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handle(&self) -> Arc<RecordingHandle> {
        self.handle.clone()
    }

    /// Make the next `open` fail the handshake.
    pub fn refuse(&self, reason: &str) {
        *self.refuse.lock().unwrap() = Some(reason.to_string());
    }

    /// Make `open` wait until the returned notifier is signalled.
    pub fn hold_open(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn setups(&self) -> Vec<LiveSetup> {
        self.setups.lock().unwrap().clone()
    }

    /// Deliver an event on the most recent connection.
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl LiveTransport for ScriptedTransport {
    async fn open(&self, setup: &LiveSetup) -> Result<TransportConnection, ConnectError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.setups.lock().unwrap().push(setup.clone());
        if let Some(reason) = self.refuse.lock().unwrap().take() {
            return Err(ConnectError::Handshake(reason));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(TransportConnection {
            handle: self.handle.clone(),
            events: rx,
        })
    }
}

#[derive(Default)]
pub struct OutputLog {
    pub clock: f64,
    pub started: Vec<(BufferId, f64, f64)>,
    pub stopped: Vec<BufferId>,
    pub closed: bool,
}

struct FakeOutput {
    log: Arc<Mutex<OutputLog>>,
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().clock
    }

    fn start(&mut self, id: BufferId, buffer: &PlaybackBuffer, at: f64) -> Result<(), DeviceAccessError> {
        let mut log = self.log.lock().unwrap();
        if log.closed {
            return Err(DeviceAccessError::Closed);
        }
        log.started.push((id, at, buffer.duration()));
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

struct FakeInput {
    open: Arc<AtomicBool>,
}

impl InputDevice for FakeInput {
    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Device provider whose microphone is fed by the test and whose speaker only keeps a log.
#[derive(Default)]
pub struct FakeDevices {
    deny_microphone: AtomicBool,
    missing_output: AtomicBool,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    input_open: Arc<AtomicBool>,
    output: Arc<Mutex<OutputLog>>,
    completions: Mutex<Option<CompletionSender>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn remove_speaker(&self) {
        self.missing_output.store(true, Ordering::SeqCst);
    }

    /// Simulate one capture callback. Returns `false` if no input device is open.
    ///
    /// The callback stays registered after the device is closed so tests can
    /// check that late callbacks are ignored by the pipeline itself.
    pub fn capture(&self, frame: AudioFrame) -> bool {
        let mut callback = self.callback.lock().unwrap();
        match callback.as_mut() {
            Some(on_frame) => {
                on_frame(frame);
                true
            }
            None => false,
        }
    }

    pub fn input_open(&self) -> bool {
        self.input_open.load(Ordering::SeqCst)
    }

    pub fn output(&self) -> Arc<Mutex<OutputLog>> {
        self.output.clone()
    }

    pub fn set_clock(&self, seconds: f64) {
        self.output.lock().unwrap().clock = seconds;
    }

    /// Report that the speaker finished a buffer.
    pub fn finish(&self, id: BufferId) {
        if let Some(tx) = self.completions.lock().unwrap().as_ref() {
            let _ = tx.send(id);
        }
    }
}

#[async_trait]
impl AudioDeviceProvider for FakeDevices {
    async fn request_microphone(&self) -> Result<(), DeviceAccessError> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(DeviceAccessError::PermissionDenied);
        }
        Ok(())
    }

    async fn open_input(
        &self,
        _spec: InputSpec,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputDevice>, DeviceAccessError> {
        *self.callback.lock().unwrap() = Some(on_frame);
        self.input_open.store(true, Ordering::SeqCst);
        Ok(Box::new(FakeInput {
            open: self.input_open.clone(),
        }))
    }

    async fn open_output(
        &self,
        _spec: OutputSpec,
        completions: CompletionSender,
    ) -> Result<Box<dyn OutputDevice>, DeviceAccessError> {
        if self.missing_output.load(Ordering::SeqCst) {
            return Err(DeviceAccessError::Unavailable {
                kind: DeviceKind::Output,
                reason: "no speaker".to_string(),
            });
        }
        *self.completions.lock().unwrap() = Some(completions);
        self.output.lock().unwrap().closed = false;
        Ok(Box::new(FakeOutput {
            log: self.output.clone(),
        }))
    }
}
