//! Current sample rate and channel count, with byte/sample/time conversions.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: u64 = 2;

pub struct SampleClock {
    sample_rate: AtomicU32,
    channels: AtomicU16,
}

impl SampleClock {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            channels: AtomicU16::new(channels.max(1)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn channels(&self) -> u16 {
        self.channels.load(Ordering::Acquire)
    }

    /// Returns false (and changes nothing) for a zero rate.
    pub fn set_format(&self, sample_rate: u32, channels: u16) -> bool {
        if sample_rate == 0 {
            return false;
        }
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.channels.store(channels.max(1), Ordering::Release);
        true
    }

    #[inline]
    pub fn byte_count(samples: u64) -> u64 {
        samples * BYTES_PER_SAMPLE
    }

    #[inline]
    pub fn sample_count(bytes: u64) -> u64 {
        bytes / BYTES_PER_SAMPLE
    }

    /// Interleaved samples to frames (one sample per channel).
    pub fn frames(&self, samples: u64) -> u64 {
        samples / u64::from(self.channels())
    }

    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / f64::from(self.sample_rate().max(1))
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * f64::from(self.sample_rate())) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        let clock = SampleClock::new(10_000, 2);
        assert_eq!(SampleClock::byte_count(300), 600);
        assert_eq!(SampleClock::sample_count(601), 300);
        assert_eq!(clock.frames(300), 150);
        assert_eq!(clock.frames_to_seconds(5_000), 0.5);
        assert_eq!(clock.seconds_to_frames(1.5), 15_000);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let clock = SampleClock::new(44_100, 1);
        assert!(!clock.set_format(0, 1));
        assert_eq!(clock.sample_rate(), 44_100);
        assert!(clock.set_format(10_000, 0));
        assert_eq!(clock.channels(), 1);
    }
}
