//! Auto- and cross-correlation of spike trains.
//! Lags within `±max_lag` land in `2·⌈max_lag / bin_size⌉` bins centred on
//! zero. The bin is chosen from the magnitude of the lag, so a lag and its
//! negation always fall in mirrored bins.

use serde::{Deserialize, Serialize};

use super::{Analysis, AnalysisType, TrainHistogram, TrainId};
use crate::error::AnalysisError;
use crate::repository::TrainTimes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub max_lag_seconds: f64,
    pub bin_size_seconds: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_lag_seconds: 0.1,
            bin_size_seconds: 0.001,
        }
    }
}

impl CorrelationConfig {
    fn validate(&self) -> Result<(), AnalysisError> {
        if self.bin_size_seconds > 0.0 && self.max_lag_seconds > 0.0 {
            Ok(())
        } else {
            Err(AnalysisError::InvalidInput(format!(
                "lag {} s / bin {} s",
                self.max_lag_seconds, self.bin_size_seconds
            )))
        }
    }
}

/// Lag histogram accumulator.
struct LagBins {
    half: usize,
    bin_size: f64,
    counts: Vec<u32>,
}

impl LagBins {
    fn new(config: &CorrelationConfig) -> Self {
        let half = (config.max_lag_seconds / config.bin_size_seconds).ceil() as usize;
        Self {
            half,
            bin_size: config.bin_size_seconds,
            counts: vec![0; 2 * half],
        }
    }

    fn add(&mut self, lag: f64) {
        let magnitude = (lag.abs() / self.bin_size).floor() as usize;
        if magnitude >= self.half {
            return;
        }
        let bin = if lag >= 0.0 {
            self.half + magnitude
        } else {
            self.half - 1 - magnitude
        };
        self.counts[bin] += 1;
    }
}

fn autocorrelate(times: &[f64], config: &CorrelationConfig) -> Vec<u32> {
    let mut bins = LagBins::new(config);
    for (i, &ti) in times.iter().enumerate() {
        for (j, &tj) in times.iter().enumerate() {
            if i != j {
                bins.add(tj - ti);
            }
        }
    }
    bins.counts
}

fn cross_correlate(first: &[f64], second: &[f64], config: &CorrelationConfig) -> Vec<u32> {
    let mut bins = LagBins::new(config);
    for &ta in first {
        for &tb in second {
            bins.add(tb - ta);
        }
    }
    bins.counts
}

fn train_id(train: &TrainTimes) -> TrainId {
    TrainId {
        order: train.order,
        channel: train.channel,
    }
}

pub struct AutocorrelationAnalysis {
    trains: Vec<TrainTimes>,
    config: CorrelationConfig,
}

impl AutocorrelationAnalysis {
    pub fn new(trains: Vec<TrainTimes>, config: CorrelationConfig) -> Self {
        Self { trains, config }
    }
}

impl Analysis for AutocorrelationAnalysis {
    type Output = TrainHistogram;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::Autocorrelation
    }

    fn process(&mut self) -> Result<Vec<TrainHistogram>, AnalysisError> {
        self.config.validate()?;
        Ok(self
            .trains
            .iter()
            .map(|train| TrainHistogram {
                train: train_id(train),
                counts: autocorrelate(&train.times, &self.config),
            })
            .collect())
    }
}

/// Lag histogram of `second − first` spike times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrossCorrelation {
    pub first: TrainId,
    pub second: TrainId,
    pub counts: Vec<u32>,
}

pub struct CrossCorrelationAnalysis {
    trains: Vec<TrainTimes>,
    config: CorrelationConfig,
}

impl CrossCorrelationAnalysis {
    pub fn new(trains: Vec<TrainTimes>, config: CorrelationConfig) -> Self {
        Self { trains, config }
    }
}

impl Analysis for CrossCorrelationAnalysis {
    type Output = CrossCorrelation;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::CrossCorrelation
    }

    /// Every unordered pair `a < b` of distinct trains.
    fn process(&mut self) -> Result<Vec<CrossCorrelation>, AnalysisError> {
        self.config.validate()?;
        let mut out = Vec::new();
        for (a, first) in self.trains.iter().enumerate() {
            for second in &self.trains[a + 1..] {
                out.push(CrossCorrelation {
                    first: train_id(first),
                    second: train_id(second),
                    counts: cross_correlate(&first.times, &second.times, &self.config),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_bins(max_lag: f64) -> CorrelationConfig {
        CorrelationConfig {
            max_lag_seconds: max_lag,
            bin_size_seconds: 1.0,
        }
    }

    fn train(order: u32, times: &[f64]) -> TrainTimes {
        TrainTimes {
            order,
            channel: 0,
            times: times.to_vec(),
        }
    }

    #[test]
    fn autocorrelation_is_symmetric() {
        let counts = autocorrelate(&[1.0, 2.0, 5.0], &unit_bins(5.0));
        assert_eq!(counts, vec![1, 1, 0, 1, 0, 0, 1, 0, 1, 1]);
        let mirrored: Vec<u32> = counts.iter().rev().copied().collect();
        assert_eq!(counts, mirrored);
    }

    #[test]
    fn mirrored_bins_hold_for_fractional_bins() {
        let config = CorrelationConfig::default();
        let counts = autocorrelate(&[0.0103, 0.0131, 0.0457, 0.0461], &config);
        assert_eq!(counts.len(), 200);
        let mirrored: Vec<u32> = counts.iter().rev().copied().collect();
        assert_eq!(counts, mirrored);
        assert_eq!(counts.iter().sum::<u32>(), 12);
    }

    #[test]
    fn lags_beyond_window_are_ignored() {
        let counts = autocorrelate(&[0.0, 10.0], &unit_bins(5.0));
        assert!(counts.iter().all(|&c| c == 0));
    }

    #[test]
    fn cross_correlation_covers_each_pair_once() {
        let trains = vec![train(0, &[1.0]), train(1, &[2.0]), train(2, &[0.5])];
        let results = CrossCorrelationAnalysis::new(trains, unit_bins(3.0)).process().unwrap();
        let pairs: Vec<(u32, u32)> = results.iter().map(|r| (r.first.order, r.second.order)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2)]);
        // 2.0 - 1.0 = +1 s
        assert_eq!(results[0].counts, vec![0, 0, 0, 0, 1, 0]);
        // 0.5 - 1.0 = -0.5 s
        assert_eq!(results[1].counts, vec![0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn zero_bin_size_is_invalid() {
        let config = CorrelationConfig {
            bin_size_seconds: 0.0,
            ..Default::default()
        };
        let err = AutocorrelationAnalysis::new(vec![], config).process().unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidInput(_)));
    }
}
