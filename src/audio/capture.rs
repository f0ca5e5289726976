//! # Capture Pipeline
//!
//! Takes microphone frames, encodes them and hands them to the live transport.
//!
//! ## Real-time Rules:
//! - Frames are never buffered: if the session is inactive or the transport
//!   isn't up yet, the frame is dropped on the floor
//! - Sending never blocks the capture callback. `TransportHandle::send_audio`
//!   only queues the chunk; the transport's writer task does the network I/O
//!
//! ## Frame Assembly:
//! Devices that deliver arbitrary-length packets (the browser bridge) go
//! through [`FrameAssembler`] first, which regroups samples into the fixed
//! block size the pipeline expects.

use crate::audio::codec::{encode_frame, AudioFrame};
use crate::live::transport::SharedLink;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tracing::{trace, warn};

/// What happened to one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Session inactive or transport not connected yet
    Dropped,
    /// Queued on the transport
    Sent,
    /// The transport refused the chunk
    Failed,
}

/// Counters for frames seen by the pipeline.
#[derive(Debug, Default)]
pub struct CaptureStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl CaptureStats {
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn frames_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: FrameOutcome) {
        let counter = match outcome {
            FrameOutcome::Dropped => &self.dropped,
            FrameOutcome::Sent => &self.sent,
            FrameOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Microphone → transport forwarding for one session.
///
/// ## Shared State:
/// - **active**: owned by the session; cleared first thing on disconnect
/// - **link**: the session's transport slot; the pipeline only reads it
#[derive(Clone)]
pub struct CapturePipeline {
    active: Arc<AtomicBool>,
    link: SharedLink,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    pub fn new(active: Arc<AtomicBool>, link: SharedLink, stats: Arc<CaptureStats>) -> Self {
        Self { active, link, stats }
    }

    /// Handle one captured block.
    pub fn on_frame(&self, frame: AudioFrame) -> FrameOutcome {
        let outcome = self.forward(frame);
        self.stats.record(outcome);
        outcome
    }

    fn forward(&self, frame: AudioFrame) -> FrameOutcome {
        // Held through the send. Teardown clears `active` before it takes the
        // handle under the write lock, so nothing is sent after the take.
        let link = self.link.read().unwrap_or_else(PoisonError::into_inner);
        if !self.active.load(Ordering::SeqCst) {
            return FrameOutcome::Dropped;
        }
        let Some(handle) = link.as_ref() else {
            return FrameOutcome::Dropped;
        };

        let chunk = encode_frame(&frame);
        match handle.send_audio(chunk) {
            Ok(()) => {
                trace!(samples = frame.len(), "Forwarded capture frame");
                FrameOutcome::Sent
            }
            Err(err) => {
                warn!("Failed to queue capture frame: {}", err);
                FrameOutcome::Failed
            }
        }
    }

    /// Turn the pipeline into the callback an input device expects.
    pub fn into_callback(self) -> Box<dyn FnMut(AudioFrame) + Send> {
        Box::new(move |frame| {
            self.on_frame(frame);
        })
    }
}

/// Regroups arbitrary-length sample runs into fixed-size frames.
///
/// ## Example:
/// With `block_size = 4`, pushing `[a, b, c]` yields nothing, then pushing
/// `[d, e]` yields one frame `[a, b, c, d]` and keeps `[e]` for next time.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: VecDeque<f32>,
    block_size: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        Self {
            pending: VecDeque::with_capacity(block_size * 2),
            block_size: block_size.max(1),
            sample_rate,
        }
    }

    /// Append samples and return every complete frame now available.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend(samples.iter().copied());

        let mut frames = Vec::new();
        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            frames.push(AudioFrame::new(block, self.sample_rate));
        }
        frames
    }

    /// Samples waiting for the next full frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
