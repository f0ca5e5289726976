//! # Audio Device Provider
//!
//! Abstraction over "a microphone and a speaker" for the live session. The
//! session never talks to hardware directly; it asks an [`AudioDeviceProvider`]
//! for an input device that calls back with fixed-size frames and an output
//! device that plays [`PlaybackBuffer`]s and reports when they finish.
//!
//! ## Implementations:
//! - **Browser bridge** (`websocket.rs`): the browser's microphone and speakers
//!   proxied over the `/ws/live` socket
//! - **ClockedOutput** (this file): an output device driven by the tokio clock
//!   that forwards playback commands to any sink
//! - **Test fakes** (`live::testing`): fully scripted devices

use crate::audio::codec::AudioFrame;
use crate::audio::playback::{BufferId, OutputDevice, PlaybackBuffer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Which side of the audio path a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Input => write!(f, "input"),
            DeviceKind::Output => write!(f, "output"),
        }
    }
}

/// Failure to obtain or use an audio device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceAccessError {
    /// The user (or browser) refused microphone access.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// The device does not exist or could not be opened.
    #[error("{kind} audio device unavailable: {reason}")]
    Unavailable { kind: DeviceKind, reason: String },

    /// The device was already released.
    #[error("audio device closed")]
    Closed,
}

/// Capture parameters requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    /// Capture sample rate (16kHz)
    pub sample_rate: u32,

    /// Samples per frame callback (4096)
    pub block_size: usize,
}

/// Playback parameters requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Called once per captured block, possibly from a device thread.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

/// Channel an output device reports finished buffer ids on.
pub type CompletionSender = mpsc::UnboundedSender<BufferId>;

/// Handle to an open capture device. Dropping frames stops once `close` returns.
pub trait InputDevice: Send {
    fn close(&mut self);
}

/// Source of microphone and speaker devices for one session.
#[async_trait]
pub trait AudioDeviceProvider: Send + Sync {
    /// Ask for microphone permission. Must succeed before `open_input`.
    async fn request_microphone(&self) -> Result<(), DeviceAccessError>;

    /// Start capturing; `on_frame` receives every `spec.block_size` block.
    async fn open_input(
        &self,
        spec: InputSpec,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn InputDevice>, DeviceAccessError>;

    /// Open a playback device that reports finished buffers on `completions`.
    async fn open_output(
        &self,
        spec: OutputSpec,
        completions: CompletionSender,
    ) -> Result<Box<dyn OutputDevice>, DeviceAccessError>;
}

/// What a [`ClockedOutput`] asks its sink to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    /// Play `buffer` at output-clock time `start_at`; `now` is the clock when the command was issued.
    Play {
        id: BufferId,
        start_at: f64,
        now: f64,
        buffer: PlaybackBuffer,
    },
    /// Silence a buffer that was previously sent with `Play`.
    Stop { id: BufferId },
}

/// Destination for playback commands (a socket, a mixer, a test log, ...).
pub type PlaybackSink = Arc<dyn Fn(PlaybackCommand) + Send + Sync>;

/// Output device whose clock is the tokio clock.
///
/// ## How completion works:
/// `start` forwards the buffer to the sink and arms a timer for
/// `start_at + duration`. When the timer fires the buffer id is sent on the
/// completion channel. `stop` and `close` disarm the timers, so stopped
/// buffers never report completion.
///
/// ## Rust Concepts:
/// - **tokio::time::Instant**: follows paused/advanced time in tests
/// - **JoinHandle::abort**: cancels a spawned timer task
pub struct ClockedOutput {
    origin: Instant,
    sink: PlaybackSink,
    completions: CompletionSender,
    timers: HashMap<BufferId, JoinHandle<()>>,
    closed: bool,
}

impl ClockedOutput {
    /// Must be called from inside a tokio runtime.
    pub fn new(sink: PlaybackSink, completions: CompletionSender) -> Self {
        Self {
            origin: Instant::now(),
            sink,
            completions,
            timers: HashMap::new(),
            closed: false,
        }
    }

    fn deadline(&self, seconds: f64) -> Instant {
        self.origin + Duration::from_secs_f64(seconds.max(0.0))
    }
}

impl OutputDevice for ClockedOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: BufferId, buffer: &PlaybackBuffer, at: f64) -> Result<(), DeviceAccessError> {
        if self.closed {
            return Err(DeviceAccessError::Closed);
        }
        self.timers.retain(|_, timer| !timer.is_finished());

        let now = self.current_time();
        (self.sink)(PlaybackCommand::Play {
            id,
            start_at: at,
            now,
            buffer: buffer.clone(),
        });

        let deadline = self.deadline(at + buffer.duration());
        let completions = self.completions.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = completions.send(id);
        });
        self.timers.insert(id, timer);
        Ok(())
    }

    fn stop(&mut self, id: BufferId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
        if !self.closed {
            (self.sink)(PlaybackCommand::Stop { id });
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.closed = true;
        debug!("Clocked output device closed");
    }
}

impl Drop for ClockedOutput {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_sink() -> (PlaybackSink, Arc<Mutex<Vec<PlaybackCommand>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        let sink: PlaybackSink = Arc::new(move |command| sink_log.lock().unwrap().push(command));
        (sink, log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clocked_output_reports_completion_at_end_time() {
        let (sink, log) = recording_sink();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = ClockedOutput::new(sink, tx);

        output.start(7, &PlaybackBuffer::silence(24000, 0.5), 0.25).unwrap();
        assert!(matches!(log.lock().unwrap()[0], PlaybackCommand::Play { id: 7, .. }));

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_buffer_never_completes() {
        let (sink, log) = recording_sink();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = ClockedOutput::new(sink, tx);

        output.start(1, &PlaybackBuffer::silence(24000, 0.1), 0.0).unwrap();
        output.stop(1);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(log.lock().unwrap().last(), Some(&PlaybackCommand::Stop { id: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_output_rejects_buffers() {
        let (sink, _log) = recording_sink();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut output = ClockedOutput::new(sink, tx);
        output.close();
        assert_eq!(
            output.start(1, &PlaybackBuffer::silence(24000, 0.1), 0.0),
            Err(DeviceAccessError::Closed)
        );
    }

    #[test]
    fn test_device_error_messages() {
        let err = DeviceAccessError::Unavailable {
            kind: DeviceKind::Input,
            reason: "no microphone".to_string(),
        };
        assert_eq!(err.to_string(), "input audio device unavailable: no microphone");
        assert_eq!(DeviceAccessError::PermissionDenied.to_string(), "microphone permission denied");
    }
}
