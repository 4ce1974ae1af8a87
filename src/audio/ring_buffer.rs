//! Live sample ring buffer: fixed pre-allocated circular store of PCM samples
//! plus an absolute "last position" cursor.
//! Capacity: `max_seconds × sample_rate × channels`. One producer, many readers.

use parking_lot::{Mutex, RwLock};

use super::clock::SampleClock;

/// Fixed-size ring of PCM i16 samples. Pre-allocated, never grows on write.
pub struct RingBuffer {
    buffer: Box<[i16]>,
    write_pos: usize,
    capacity: usize,
    /// Samples currently retained (≤ capacity).
    stored: usize,
    /// Absolute position one past the newest retained sample.
    last_position: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0i16; capacity].into_boxed_slice(),
            write_pos: 0,
            capacity,
            stored: 0,
            last_position: 0,
        }
    }

    /// Reallocate storage. Prior content is discarded.
    pub fn set_capacity(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }

    /// Append samples at the cursor, overwriting the oldest data once full.
    pub fn write(&mut self, samples: &[i16]) {
        self.push_samples(samples);
        self.last_position += samples.len() as u64;
    }

    /// Write a playback batch whose last sample ends at `last_byte_position`
    /// (byte offset into the file's sample data). A batch that does not continue
    /// the previous one drops the retained window first.
    pub fn write_at(&mut self, samples: &[i16], last_byte_position: u64) {
        let end = SampleClock::sample_count(last_byte_position);
        let start = end.saturating_sub(samples.len() as u64);
        if self.stored > 0 && start != self.last_position {
            self.discard();
        }
        self.push_samples(samples);
        self.last_position = end;
    }

    /// Samples in the absolute window `[start, end)`, clipped to retained data.
    /// Empty when the window lies entirely before the oldest retained sample.
    pub fn read(&self, start: u64, end: u64) -> Vec<i16> {
        let oldest = self.oldest_position();
        let start = start.max(oldest);
        let end = end.min(self.last_position);
        if end <= start {
            return Vec::new();
        }
        let count = (end - start) as usize;
        let back = (self.last_position - start) as usize;
        let first_idx = (self.write_pos + self.capacity - back) % self.capacity;

        let mut out = Vec::with_capacity(count);
        let first_len = (self.capacity - first_idx).min(count);
        out.extend_from_slice(&self.buffer[first_idx..first_idx + first_len]);
        out.extend_from_slice(&self.buffer[..count - first_len]);
        out
    }

    /// The most recent `n` retained samples, oldest first.
    pub fn peek_last(&self, n: usize) -> Vec<i16> {
        let n = n.min(self.stored) as u64;
        self.read(self.last_position - n, self.last_position)
    }

    /// Reset the cursor without reallocating.
    pub fn clear(&mut self) {
        self.discard();
        self.last_position = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.stored
    }

    pub fn is_empty(&self) -> bool {
        self.stored == 0
    }

    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    pub fn oldest_position(&self) -> u64 {
        self.last_position - self.stored as u64
    }

    fn discard(&mut self) {
        self.write_pos = 0;
        self.stored = 0;
    }

    fn push_samples(&mut self, samples: &[i16]) {
        if self.capacity == 0 || samples.is_empty() {
            return;
        }
        let samples = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let first = (self.capacity - self.write_pos).min(samples.len());
        self.buffer[self.write_pos..self.write_pos + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        self.buffer[..rest].copy_from_slice(&samples[first..]);
        self.write_pos = (self.write_pos + samples.len()) % self.capacity;
        self.stored = (self.stored + samples.len()).min(self.capacity);
    }
}

/// Session-owned ring buffer shared between the active producer and readers.
/// Every write happens under one write lock, so readers never observe half a batch.
pub struct ProcessingBuffer {
    ring: RwLock<RingBuffer>,
    max_seconds: Mutex<f64>,
}

impl ProcessingBuffer {
    pub fn new(max_seconds: f64, sample_rate: u32, channels: u16) -> Self {
        let buffer = Self {
            ring: RwLock::new(RingBuffer::new(0)),
            max_seconds: Mutex::new(max_seconds),
        };
        buffer.resize(sample_rate, channels);
        buffer
    }

    /// Change the retained duration. Non-positive values are ignored.
    pub fn set_max_seconds(&self, max_seconds: f64, sample_rate: u32, channels: u16) {
        if max_seconds <= 0.0 {
            return;
        }
        *self.max_seconds.lock() = max_seconds;
        self.resize(sample_rate, channels);
    }

    /// Reallocate for a new format; existing content is discarded.
    pub fn resize(&self, sample_rate: u32, channels: u16) {
        let seconds = *self.max_seconds.lock();
        let capacity = (seconds * f64::from(sample_rate) * f64::from(channels.max(1))) as usize;
        self.ring.write().set_capacity(capacity);
    }

    pub fn write(&self, samples: &[i16]) {
        self.ring.write().write(samples);
    }

    pub fn write_at(&self, samples: &[i16], last_byte_position: u64) {
        self.ring.write().write_at(samples, last_byte_position);
    }

    pub fn read(&self, start: u64, end: u64) -> Vec<i16> {
        self.ring.read().read(start, end)
    }

    /// Window `[last_position − window, last_position]`.
    pub fn read_latest(&self, window: usize) -> Vec<i16> {
        self.ring.read().peek_last(window)
    }

    pub fn clear(&self) {
        self.ring.write().clear();
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    pub fn last_position(&self) -> u64 {
        self.ring.read().last_position()
    }

    pub fn last_byte_position(&self) -> u64 {
        SampleClock::byte_count(self.last_position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: i16, count: usize) -> Vec<i16> {
        (0..count).map(|i| from + i as i16).collect()
    }

    #[test]
    fn round_trip_within_capacity() {
        let mut ring = RingBuffer::new(10);
        let data = ramp(1, 7);
        ring.write(&data);
        assert_eq!(ring.read(0, ring.last_position()), data);
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn overflow_keeps_most_recent_capacity() {
        let mut ring = RingBuffer::new(10);
        ring.write(&ramp(0, 6));
        ring.write(&ramp(6, 7));
        assert_eq!(ring.last_position(), 13);
        assert_eq!(ring.read(0, 13), ramp(3, 10));
    }

    #[test]
    fn oversized_batch_keeps_tail() {
        let mut ring = RingBuffer::new(4);
        ring.write(&ramp(0, 9));
        assert_eq!(ring.peek_last(100), ramp(5, 4));
        assert_eq!(ring.last_position(), 9);
    }

    #[test]
    fn window_before_oldest_is_empty_and_partial_is_clipped() {
        let mut ring = RingBuffer::new(5);
        ring.write(&ramp(0, 12));
        assert!(ring.read(0, 7).is_empty());
        assert_eq!(ring.read(5, 9), ramp(7, 2));
        assert_eq!(ring.read(10, 50), ramp(10, 2));
    }

    #[test]
    fn clear_resets_cursor_without_reallocating() {
        let mut ring = RingBuffer::new(8);
        ring.write(&ramp(0, 5));
        ring.clear();
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.last_position(), 0);
        assert!(ring.read(0, u64::MAX).is_empty());
    }

    #[test]
    fn contiguous_playback_writes_follow_file_offsets() {
        let mut ring = RingBuffer::new(16);
        ring.write_at(&ramp(0, 4), 8);
        ring.write_at(&ramp(4, 4), 16);
        assert_eq!(ring.last_position(), 8);
        assert_eq!(ring.read(0, 8), ramp(0, 8));
    }

    #[test]
    fn playback_seek_drops_stale_window() {
        let mut ring = RingBuffer::new(16);
        ring.write_at(&ramp(0, 4), 8);
        ring.write_at(&ramp(100, 4), 208);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.read(0, 104), ramp(100, 4));
    }

    #[test]
    fn zero_capacity_ignores_writes() {
        let mut ring = RingBuffer::new(0);
        ring.write(&ramp(0, 3));
        assert!(ring.is_empty());
        assert!(ring.peek_last(3).is_empty());
    }

    #[test]
    fn processing_buffer_resize_discards_content() {
        let buffer = ProcessingBuffer::new(0.5, 100, 1);
        assert_eq!(buffer.capacity(), 50);
        buffer.write(&ramp(0, 20));
        buffer.resize(200, 2);
        assert_eq!(buffer.capacity(), 200);
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_byte_position(), 0);
    }

    #[test]
    fn concurrent_reader_never_sees_partial_batch() {
        use std::sync::Arc;

        let buffer = Arc::new(ProcessingBuffer::new(1.0, 1_000, 1));
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..500i16 {
                    buffer.write(&[i; 10]);
                }
            })
        };
        for _ in 0..500 {
            let window = buffer.read_latest(10);
            if let Some(&first) = window.first() {
                assert!(window.iter().all(|&s| s == first));
            }
        }
        writer.join().unwrap();
    }
}
