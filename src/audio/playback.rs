//! # Playback Scheduling
//!
//! Plays decoded reply audio back-to-back without gaps even though the remote
//! model delivers it in small chunks that arrive whenever the network hands
//! them over.
//!
//! ## Timeline Model:
//! The scheduler keeps a **timeline cursor**: the output-clock time (seconds)
//! at which the next buffer should start. Each enqueued buffer starts at
//! `max(cursor, device clock)` and pushes the cursor forward by its duration,
//! so buffers queue up behind each other and a late chunk starts "now"
//! instead of in the past.
//!
//! ## Ownership:
//! The scheduler exclusively owns its output device and its in-flight set.
//! Nothing else starts or stops buffers; the session only calls
//! `enqueue`, `complete` and `flush`.

use crate::audio::codec::float_frame_to_pcm16;
use crate::audio::device::DeviceAccessError;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Identifier handed out for every scheduled buffer.
pub type BufferId = u64;

/// Decoded audio ready for the output device.
///
/// ## Layout:
/// `channels[c][i]` is sample `i` of channel `c`. Every channel has the same
/// number of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self { sample_rate, channels }
    }

    /// Mono buffer of `seconds` of silence.
    #[cfg(test)]
    pub fn silence(sample_rate: u32, seconds: f64) -> Self {
        let frames = (seconds * sample_rate as f64).round() as usize;
        Self::new(sample_rate, vec![vec![0.0; frames]])
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Re-interleave the channels and encode them as PCM16 little-endian.
    pub fn to_interleaved_pcm16(&self) -> Vec<u8> {
        let frames = self.frame_count();
        let mut interleaved = Vec::with_capacity(frames * self.channel_count());
        for i in 0..frames {
            for channel in &self.channels {
                interleaved.push(channel.get(i).copied().unwrap_or(0.0));
            }
        }
        float_frame_to_pcm16(&interleaved)
    }
}

/// Output side of the audio device provider.
///
/// ## Contract:
/// - `current_time` is a monotonic clock in seconds, starting near zero when the device opens
/// - `start` schedules `buffer` to begin at `at` and must eventually report `id`
///   on the completion channel the device was opened with, unless `stop`ped first
/// - `stop` silences a buffer immediately; no completion is required afterwards
/// - `close` releases the device; later `start` calls fail
pub trait OutputDevice: Send {
    fn current_time(&self) -> f64;
    fn start(&mut self, id: BufferId, buffer: &PlaybackBuffer, at: f64) -> Result<(), DeviceAccessError>;
    fn stop(&mut self, id: BufferId);
    fn close(&mut self);
}

/// Bookkeeping for one buffer that has been handed to the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub end: f64,
}

/// Gapless sequential playback over an [`OutputDevice`].
pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    cursor: f64,
    in_flight: BTreeMap<BufferId, ScheduledBuffer>,
    next_id: BufferId,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputDevice>) -> Self {
        Self {
            output,
            cursor: 0.0,
            in_flight: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Schedule a buffer right after everything already queued.
    ///
    /// ## Returns:
    /// - **Ok(id)**: the buffer is playing or queued; `id` comes back through `complete`
    /// - **Err(...)**: the device refused it; cursor and in-flight set are untouched
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> Result<BufferId, DeviceAccessError> {
        let start = self.cursor.max(self.output.current_time());
        let duration = buffer.duration();
        let id = self.next_id;

        self.output.start(id, &buffer, start)?;

        self.next_id += 1;
        self.cursor = start + duration;
        self.in_flight.insert(
            id,
            ScheduledBuffer {
                start,
                end: self.cursor,
            },
        );

        debug!(buffer_id = id, start, duration, cursor = self.cursor, "Scheduled playback buffer");
        Ok(id)
    }

    /// Record that the device finished playing `id`.
    ///
    /// Returns `true` only when this completion emptied the in-flight set.
    /// Completions for unknown ids (for example ones that raced a flush) are ignored.
    pub fn complete(&mut self, id: BufferId) -> bool {
        if self.in_flight.remove(&id).is_none() {
            debug!(buffer_id = id, "Ignoring completion for unknown buffer");
            return false;
        }
        self.is_idle()
    }

    /// Stop everything immediately and rewind the timeline.
    ///
    /// Safe to call with nothing in flight. Returns how many buffers were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in std::mem::take(&mut self.in_flight).into_keys() {
            self.output.stop(id);
        }
        self.cursor = 0.0;

        if stopped > 0 {
            debug!(stopped, "Flushed playback queue");
        }
        stopped
    }

    /// Flush and release the output device.
    pub fn close(&mut self) {
        let stopped = self.flush();
        if stopped > 0 {
            warn!(stopped, "Closing output device with buffers still playing");
        }
        self.output.close();
    }

    pub fn timeline_cursor(&self) -> f64 {
        self.cursor
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    #[cfg(test)]
    pub fn scheduled(&self, id: BufferId) -> Option<ScheduledBuffer> {
        self.in_flight.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct DeviceLog {
        clock: f64,
        started: Vec<(BufferId, f64)>,
        stopped: Vec<BufferId>,
        closed: bool,
    }

    struct ManualOutput(Arc<Mutex<DeviceLog>>);

    impl OutputDevice for ManualOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().clock
        }

        fn start(&mut self, id: BufferId, _buffer: &PlaybackBuffer, at: f64) -> Result<(), DeviceAccessError> {
            let mut log = self.0.lock().unwrap();
            if log.closed {
                return Err(DeviceAccessError::Closed);
            }
            log.started.push((id, at));
            Ok(())
        }

        fn stop(&mut self, id: BufferId) {
            self.0.lock().unwrap().stopped.push(id);
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<DeviceLog>>) {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        (PlaybackScheduler::new(Box::new(ManualOutput(log.clone()))), log)
    }

    #[test]
    fn test_buffers_queue_back_to_back() {
        let (mut scheduler, log) = scheduler();
        let a = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.5)).unwrap();
        let b = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.25)).unwrap();

        let started = log.lock().unwrap().started.clone();
        assert_eq!(started, vec![(a, 0.0), (b, 0.5)]);
        assert!((scheduler.timeline_cursor() - 0.75).abs() < 1e-9);
        assert_eq!(scheduler.in_flight(), 2);
    }

    #[test]
    fn test_late_buffer_starts_at_device_clock() {
        let (mut scheduler, log) = scheduler();
        scheduler.enqueue(PlaybackBuffer::silence(24000, 0.5)).unwrap();
        log.lock().unwrap().clock = 2.0;

        let id = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.5)).unwrap();
        assert_eq!(scheduler.scheduled(id).unwrap().start, 2.0);
        assert!((scheduler.timeline_cursor() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_cursor_covers_every_scheduled_buffer() {
        let (mut scheduler, log) = scheduler();
        let mut ids = Vec::new();
        for (i, seconds) in [0.1, 0.3, 0.2, 0.05].iter().enumerate() {
            log.lock().unwrap().clock = i as f64 * 0.07;
            ids.push(scheduler.enqueue(PlaybackBuffer::silence(24000, *seconds)).unwrap());
        }
        for id in ids {
            assert!(scheduler.timeline_cursor() >= scheduler.scheduled(id).unwrap().end - 1e-12);
        }
    }

    #[test]
    fn test_completion_reports_idle_only_when_last_buffer_ends() {
        let (mut scheduler, _log) = scheduler();
        let a = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.1)).unwrap();
        let b = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.1)).unwrap();

        assert!(!scheduler.complete(a));
        assert!(scheduler.complete(b));
        assert!(scheduler.is_idle());
        // Stale or repeated completions never report idle again
        assert!(!scheduler.complete(b));
    }

    #[test]
    fn test_flush_stops_everything_and_rewinds() {
        let (mut scheduler, log) = scheduler();
        let a = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.4)).unwrap();
        let b = scheduler.enqueue(PlaybackBuffer::silence(24000, 0.6)).unwrap();
        log.lock().unwrap().clock = 0.3;

        assert_eq!(scheduler.flush(), 2);
        assert_eq!(scheduler.timeline_cursor(), 0.0);
        assert_eq!(scheduler.in_flight(), 0);
        assert_eq!(log.lock().unwrap().stopped, vec![a, b]);
        assert!(!scheduler.complete(a));
    }

    #[test]
    fn test_flush_when_idle_is_harmless() {
        let (mut scheduler, log) = scheduler();
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(scheduler.timeline_cursor(), 0.0);
        assert!(log.lock().unwrap().stopped.is_empty());
    }

    #[test]
    fn test_enqueue_after_close_fails_without_moving_cursor() {
        let (mut scheduler, _log) = scheduler();
        scheduler.close();
        assert!(scheduler.enqueue(PlaybackBuffer::silence(24000, 0.5)).is_err());
        assert_eq!(scheduler.timeline_cursor(), 0.0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn test_buffer_duration_and_interleave() {
        let buffer = PlaybackBuffer::new(24000, vec![vec![0.5; 12000], vec![-0.5; 12000]]);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
        let pcm = buffer.to_interleaved_pcm16();
        assert_eq!(pcm.len(), 12000 * 2 * 2);
        assert_eq!(&pcm[0..2], &16384i16.to_le_bytes());
        assert_eq!(&pcm[2..4], &(-16384i16).to_le_bytes());
    }
}
