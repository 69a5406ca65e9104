//! Fixed-capacity lookback buffer between the capture callback and the pipeline
//!
//! One writer (the frame source) appends whole frames; any number of readers
//! either take a snapshot of the most recent audio (`read_last`) or follow the
//! stream frame by frame through a [`FrameReader`]. Capacity is a whole number
//! of frames, so a frame never wraps around the end of the storage and a
//! reader can never see half of one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use super::frame::{Frame, FrameSpec};
use crate::{Error, Result};

/// Circular store of the most recent PCM frames
pub struct RingBuffer {
    spec: FrameSpec,
    capacity_frames: u64,
    inner: Mutex<Inner>,
    written: watch::Sender<u64>,
}

struct Inner {
    samples: Box<[i16]>,
    /// Total frames ever written; the next frame gets this index
    frames_written: u64,
    /// Frames below this index were forgotten by `clear`
    floor: u64,
}

impl RingBuffer {
    /// Create a buffer holding at least `lookback` of audio
    ///
    /// # Errors
    ///
    /// Returns error if `lookback` is shorter than one frame
    pub fn new(spec: FrameSpec, lookback: Duration) -> Result<Self> {
        let capacity_frames = spec.frames_ceil(lookback);
        if capacity_frames == 0 {
            return Err(Error::Config(format!(
                "ring buffer lookback {lookback:?} is shorter than one frame"
            )));
        }
        Ok(Self::with_frames(spec, capacity_frames))
    }

    /// Create a buffer holding exactly `capacity_frames` frames
    ///
    /// # Panics
    ///
    /// Panics if `capacity_frames` is zero
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_frames(spec: FrameSpec, capacity_frames: u64) -> Self {
        assert!(capacity_frames > 0, "ring buffer needs at least one frame");
        let capacity = capacity_frames as usize * spec.frame_len();
        let (written, _) = watch::channel(0);

        Self {
            spec,
            capacity_frames,
            inner: Mutex::new(Inner {
                samples: vec![0; capacity].into_boxed_slice(),
                frames_written: 0,
                floor: 0,
            }),
            written,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> FrameSpec {
        self.spec
    }

    /// Capacity in frames
    #[must_use]
    pub const fn capacity_frames(&self) -> u64 {
        self.capacity_frames
    }

    /// Capacity in samples
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn capacity(&self) -> usize {
        self.capacity_frames as usize * self.spec.frame_len()
    }

    /// Total frames written so far
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        *self.written.borrow()
    }

    /// Append one frame, overwriting the oldest frame when full
    ///
    /// Returns the stream index assigned to the frame. The lock is held only
    /// for the copy of one frame.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFrameSize` if `samples` is not exactly one frame long
    pub fn write(&self, samples: &[i16]) -> Result<u64> {
        let frame_len = self.spec.frame_len();
        if samples.len() != frame_len {
            return Err(Error::InvalidFrameSize {
                expected: frame_len,
                actual: samples.len(),
            });
        }

        let index = {
            let mut inner = self.lock();
            let index = inner.frames_written;
            let offset = self.slot(index);
            inner.samples[offset..offset + frame_len].copy_from_slice(samples);
            inner.frames_written = index + 1;
            index
        };

        self.written.send_replace(index + 1);
        Ok(index)
    }

    /// Snapshot of the most recent `duration` of audio
    ///
    /// Returns exactly `floor(duration * sample_rate)` samples once that many
    /// have been written (capped at capacity), fewer before the buffer fills.
    /// Samples are in chronological order.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_last(&self, duration: Duration) -> Vec<i16> {
        let wanted = self.spec.samples_in(duration).min(self.capacity());

        let inner = self.lock();
        let retained = (inner.frames_written - inner.floor).min(self.capacity_frames);
        let available = retained as usize * self.spec.frame_len();
        let count = wanted.min(available);
        if count == 0 {
            return Vec::new();
        }

        let capacity = self.capacity();
        let end = self.slot(inner.frames_written);
        let end = if end == 0 { capacity } else { end };
        let mut out = Vec::with_capacity(count);
        if count <= end {
            out.extend_from_slice(&inner.samples[end - count..end]);
        } else {
            let wrapped = count - end;
            out.extend_from_slice(&inner.samples[capacity - wrapped..]);
            out.extend_from_slice(&inner.samples[..end]);
        }
        out
    }

    /// Copy out the frame with the given stream index
    pub fn read_frame(&self, index: u64) -> FrameRead {
        let inner = self.lock();
        if index >= inner.frames_written {
            return FrameRead::Pending;
        }
        let oldest = inner
            .frames_written
            .saturating_sub(self.capacity_frames)
            .max(inner.floor);
        if index < oldest {
            return FrameRead::Overwritten { oldest };
        }

        let offset = self.slot(index);
        let samples = &inner.samples[offset..offset + self.spec.frame_len()];
        FrameRead::Ready(Frame::new(index, samples))
    }

    /// Create a reader positioned at the next frame to be written
    #[must_use]
    pub fn reader(self: &Arc<Self>) -> FrameReader {
        let receiver = self.written.subscribe();
        let next = *receiver.borrow();
        FrameReader {
            buffer: Arc::clone(self),
            receiver,
            next,
            dropped: 0,
        }
    }

    /// Forget all buffered audio (explicit session reset)
    ///
    /// Frame indices keep increasing so existing readers stay ordered; a
    /// reader still behind the reset skips ahead as after an overrun.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.samples.fill(0);
        inner.floor = inner.frames_written;
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn slot(&self, index: u64) -> usize {
        (index % self.capacity_frames) as usize * self.spec.frame_len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Samples stay valid even if a writer panicked mid-copy
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of reading a single frame by index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// The frame is available
    Ready(Frame),
    /// The frame has not been written yet
    Pending,
    /// The frame was overwritten; `oldest` is the oldest retained index
    Overwritten { oldest: u64 },
}

/// Ordered cursor over the frames of a [`RingBuffer`]
///
/// Frames come out strictly in write order. A reader that falls further
/// behind than the buffer's capacity skips to the oldest retained frame and
/// records how many frames it lost.
pub struct FrameReader {
    buffer: Arc<RingBuffer>,
    receiver: watch::Receiver<u64>,
    next: u64,
    dropped: u64,
}

impl FrameReader {
    /// Take the next frame if one is available, without waiting
    pub fn try_next(&mut self) -> Option<Frame> {
        loop {
            match self.buffer.read_frame(self.next) {
                FrameRead::Ready(frame) => {
                    self.next += 1;
                    return Some(frame);
                }
                FrameRead::Pending => return None,
                FrameRead::Overwritten { oldest } => {
                    let lost = oldest - self.next;
                    self.dropped += lost;
                    tracing::warn!(lost, next = oldest, "frame reader overrun, skipping ahead");
                    self.next = oldest;
                }
            }
        }
    }

    /// Wait for the next frame
    pub async fn next(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.try_next() {
                return frame;
            }
            // Mark the current value seen, then re-check so a write between
            // the check above and here is not missed
            self.receiver.borrow_and_update();
            if let Some(frame) = self.try_next() {
                return frame;
            }
            // The sender lives in the buffer this reader keeps alive
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Skip every buffered frame; the next frame returned is the next one written
    pub fn skip_to_latest(&mut self) -> u64 {
        let latest = self.buffer.frames_written();
        let skipped = latest.saturating_sub(self.next);
        self.next = latest;
        skipped
    }

    /// Index of the next frame this reader will return
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.next
    }

    /// Frames lost to overruns so far
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> FrameSpec {
        FrameSpec::new(16_000, 10).unwrap()
    }

    fn frame_of(value: i16) -> Vec<i16> {
        vec![value; spec().frame_len()]
    }

    #[test]
    fn write_rejects_wrong_length() {
        let buffer = RingBuffer::with_frames(spec(), 4);
        let err = buffer.write(&[0; 100]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFrameSize {
                expected: 160,
                actual: 100
            }
        ));
        assert_eq!(buffer.frames_written(), 0);
    }

    #[test]
    fn write_assigns_increasing_indices() {
        let buffer = RingBuffer::with_frames(spec(), 2);
        for expected in 0..5 {
            assert_eq!(buffer.write(&frame_of(1)).unwrap(), expected);
        }
        assert_eq!(buffer.frames_written(), 5);
    }

    #[test]
    fn read_last_before_fill_returns_what_was_written() {
        let buffer = RingBuffer::with_frames(spec(), 10);
        assert!(buffer.read_last(Duration::from_millis(50)).is_empty());

        buffer.write(&frame_of(1)).unwrap();
        buffer.write(&frame_of(2)).unwrap();
        let samples = buffer.read_last(Duration::from_millis(50));
        assert_eq!(samples.len(), 320);
        assert_eq!(samples[0], 1);
        assert_eq!(samples[319], 2);
    }

    #[test]
    fn read_last_returns_exact_sample_count_after_fill() {
        let buffer = RingBuffer::with_frames(spec(), 10);
        for i in 0..25 {
            buffer.write(&frame_of(i)).unwrap();
        }

        // 25 ms is not a whole number of frames
        let samples = buffer.read_last(Duration::from_millis(25));
        assert_eq!(samples.len(), 400);
        assert_eq!(*samples.last().unwrap(), 24);
        assert_eq!(samples[0], 22);

        // Longer than capacity is capped at capacity
        let all = buffer.read_last(Duration::from_secs(1));
        assert_eq!(all.len(), buffer.capacity());
        assert_eq!(all[0], 15);
        assert_eq!(*all.last().unwrap(), 24);
    }

    #[test]
    fn read_last_is_chronological_across_wrap() {
        let buffer = RingBuffer::with_frames(spec(), 3);
        for i in 0..4 {
            buffer.write(&frame_of(i)).unwrap();
        }
        let samples = buffer.read_last(Duration::from_millis(30));
        let firsts: Vec<i16> = samples.chunks(160).map(|c| c[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3]);
    }

    #[test]
    fn read_frame_reports_pending_and_overwritten() {
        let buffer = RingBuffer::with_frames(spec(), 2);
        assert_eq!(buffer.read_frame(0), FrameRead::Pending);
        for i in 0..3 {
            buffer.write(&frame_of(i)).unwrap();
        }
        assert_eq!(buffer.read_frame(0), FrameRead::Overwritten { oldest: 1 });
        match buffer.read_frame(2) {
            FrameRead::Ready(frame) => {
                assert_eq!(frame.index(), 2);
                assert!(frame.samples().iter().all(|&s| s == 2));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn clear_forgets_buffered_audio() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 8));
        let mut reader = buffer.reader();
        for i in 0..5 {
            buffer.write(&frame_of(i)).unwrap();
        }

        buffer.clear();
        assert!(buffer.read_last(Duration::from_millis(50)).is_empty());
        assert_eq!(buffer.frames_written(), 5);

        buffer.write(&frame_of(9)).unwrap();
        assert_eq!(buffer.read_last(Duration::from_millis(50)), frame_of(9));

        // The stale reader lands on the first frame after the reset
        let next = reader.try_next().unwrap();
        assert_eq!(next.index(), 5);
        assert_eq!(reader.dropped(), 5);
    }

    #[test]
    fn reader_returns_frames_in_order() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 8));
        let mut reader = buffer.reader();
        for i in 0..5 {
            buffer.write(&frame_of(i)).unwrap();
        }
        let indices: Vec<u64> = std::iter::from_fn(|| reader.try_next())
            .map(|f| f.index())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(reader.try_next().is_none());
        assert_eq!(reader.dropped(), 0);
    }

    #[test]
    fn reader_skips_ahead_after_overrun() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 4));
        let mut reader = buffer.reader();
        for i in 0..10 {
            buffer.write(&frame_of(i)).unwrap();
        }
        let first = reader.try_next().unwrap();
        assert_eq!(first.index(), 6);
        assert_eq!(reader.dropped(), 6);
    }

    #[test]
    fn readers_are_independent() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 8));
        let mut a = buffer.reader();
        let mut b = buffer.reader();
        buffer.write(&frame_of(7)).unwrap();

        assert_eq!(a.try_next().unwrap().index(), 0);
        assert_eq!(b.try_next().unwrap().index(), 0);
        assert!(a.try_next().is_none());
    }

    #[test]
    fn skip_to_latest_discards_backlog() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 8));
        let mut reader = buffer.reader();
        for i in 0..3 {
            buffer.write(&frame_of(i)).unwrap();
        }
        assert_eq!(reader.skip_to_latest(), 3);
        assert!(reader.try_next().is_none());
        buffer.write(&frame_of(3)).unwrap();
        assert_eq!(reader.try_next().unwrap().index(), 3);
    }

    #[tokio::test]
    async fn reader_wakes_on_write_from_another_thread() {
        let buffer = Arc::new(RingBuffer::with_frames(spec(), 8));
        let mut reader = buffer.reader();

        let writer = Arc::clone(&buffer);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.write(&frame_of(9)).unwrap();
        });

        let frame = tokio::time::timeout(Duration::from_secs(2), reader.next())
            .await
            .expect("reader should wake");
        assert_eq!(frame.index(), 0);
        handle.join().unwrap();
    }
}
