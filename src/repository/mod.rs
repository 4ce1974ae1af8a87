//! Spike analysis persistence: spikes found per file and the user-defined
//! threshold trains that group them.

pub mod sqlite;

use std::path::Path;

use serde::Serialize;

use crate::error::RepositoryError;

pub use sqlite::SqliteRepository;

/// One detected spike. `time` is `index / sample_rate` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spike {
    pub channel: u16,
    /// Frame index in the file.
    pub index: u64,
    pub value: i16,
    pub time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpikeIndexValue {
    pub index: u64,
    pub value: i16,
}

/// A threshold band on one channel. Trains sharing an `order` across channels
/// are one logical train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Train {
    pub order: u32,
    pub channel: u16,
    pub lower_threshold: i32,
    pub upper_threshold: i32,
    pub is_lower_left: bool,
}

impl Train {
    pub fn left_threshold(&self) -> i32 {
        if self.is_lower_left {
            self.lower_threshold
        } else {
            self.upper_threshold
        }
    }

    pub fn right_threshold(&self) -> i32 {
        if self.is_lower_left {
            self.upper_threshold
        } else {
            self.lower_threshold
        }
    }

    pub fn threshold(&self) -> Threshold {
        Threshold {
            left: self.left_threshold(),
            right: self.right_threshold(),
        }
    }

    /// Same channel and `lower ≤ value ≤ upper`.
    pub fn contains(&self, spike: &Spike) -> bool {
        spike.channel == self.channel
            && (self.lower_threshold..=self.upper_threshold).contains(&i32::from(spike.value))
    }

    /// Move one threshold handle. Lower/upper are re-derived so `lower ≤ upper` always holds.
    pub fn with_threshold(mut self, orientation: ThresholdOrientation, value: i32) -> Self {
        let (mut left, mut right) = (self.left_threshold(), self.right_threshold());
        match orientation {
            ThresholdOrientation::Left => left = value,
            ThresholdOrientation::Right => right = value,
        }
        self.lower_threshold = left.min(right);
        self.upper_threshold = left.max(right);
        self.is_lower_left = left <= right;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThresholdOrientation {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Threshold {
    pub left: i32,
    pub right: i32,
}

/// Spike times (seconds, ascending) of one train on one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainTimes {
    pub order: u32,
    pub channel: u16,
    pub times: Vec<f64>,
}

/// Spike frame indices (ascending) of one train on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainIndices {
    pub order: u32,
    pub channel: u16,
    pub indices: Vec<u64>,
}

/// Spikes of one train on one channel inside a frame range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainSpikes {
    pub order: u32,
    pub channel: u16,
    pub spikes: Vec<SpikeIndexValue>,
}

/// Storage for spike analyses, keyed by file path. Train orders are 0-based
/// and contiguous.
pub trait AnalysisRepository: Send + Sync {
    fn spike_analysis_exists(&self, path: &Path) -> Result<bool, RepositoryError>;

    /// Store the spikes found in `path`, replacing earlier spikes but keeping trains.
    fn save_spike_analysis(&self, path: &Path, sample_rate: u32, spikes: &[Spike]) -> Result<(), RepositoryError>;

    /// Spikes on `channel` with `start ≤ index < end`, ascending.
    fn spikes_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<SpikeIndexValue>, RepositoryError>;

    /// One entry per train on `channel`, by order: its spikes with
    /// `start ≤ index < end`, ascending.
    fn spikes_by_trains_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<TrainSpikes>, RepositoryError>;

    fn spike_analysis_trains(&self, path: &Path) -> Result<Vec<Train>, RepositoryError>;

    fn spike_analysis_trains_by_channel(&self, path: &Path, channel: u16) -> Result<Vec<Train>, RepositoryError>;

    /// Append a train with zero thresholds on every channel. Returns its order.
    fn add_spike_analysis_train(&self, path: &Path, channel_count: u16) -> Result<u32, RepositoryError>;

    /// Remove the train with `order` on all channels; later trains shift down by one.
    fn remove_spike_analysis_train(&self, path: &Path, order: u32) -> Result<(), RepositoryError>;

    fn save_spike_analysis_train(
        &self,
        path: &Path,
        channel: u16,
        order: u32,
        orientation: ThresholdOrientation,
        value: i32,
    ) -> Result<Train, RepositoryError>;

    fn spike_times_by_trains(&self, path: &Path) -> Result<Vec<TrainTimes>, RepositoryError>;

    fn spike_indices_by_trains(&self, path: &Path) -> Result<Vec<TrainIndices>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train() -> Train {
        Train {
            order: 0,
            channel: 0,
            lower_threshold: 0,
            upper_threshold: 0,
            is_lower_left: true,
        }
    }

    #[test]
    fn left_right_follow_orientation() {
        let t = Train {
            lower_threshold: -10,
            upper_threshold: 40,
            is_lower_left: false,
            ..train()
        };
        assert_eq!(t.threshold(), Threshold { left: 40, right: -10 });
    }

    #[test]
    fn crossing_handles_flips_orientation() {
        let t = train()
            .with_threshold(ThresholdOrientation::Right, 100)
            .with_threshold(ThresholdOrientation::Left, 300);
        assert_eq!(t.lower_threshold, 100);
        assert_eq!(t.upper_threshold, 300);
        assert!(!t.is_lower_left);
        assert_eq!(t.left_threshold(), 300);
        assert_eq!(t.right_threshold(), 100);
    }

    #[test]
    fn membership_is_inclusive_and_per_channel() {
        let t = train().with_threshold(ThresholdOrientation::Right, 50);
        let spike = |channel, value| Spike {
            channel,
            index: 0,
            value,
            time: 0.0,
        };
        assert!(t.contains(&spike(0, 0)));
        assert!(t.contains(&spike(0, 50)));
        assert!(!t.contains(&spike(0, 51)));
        assert!(!t.contains(&spike(1, 10)));
    }
}
