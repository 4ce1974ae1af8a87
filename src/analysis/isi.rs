//! Inter-spike interval histograms on logarithmic bins.

use serde::{Deserialize, Serialize};

use super::{Analysis, AnalysisType, TrainHistogram, TrainId};
use crate::error::AnalysisError;
use crate::repository::TrainTimes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsiConfig {
    pub min_interval_seconds: f64,
    pub max_interval_seconds: f64,
    pub bins: usize,
}

impl Default for IsiConfig {
    fn default() -> Self {
        Self {
            min_interval_seconds: 1e-3,
            max_interval_seconds: 10.0,
            bins: 100,
        }
    }
}

impl IsiConfig {
    /// `bins + 1` logarithmically spaced edges from min to max.
    pub fn bin_edges(&self) -> Vec<f64> {
        let (lo, step) = self.log_range();
        (0..=self.bins).map(|i| 10f64.powf(lo + step * i as f64)).collect()
    }

    fn log_range(&self) -> (f64, f64) {
        let lo = self.min_interval_seconds.log10();
        let hi = self.max_interval_seconds.log10();
        (lo, (hi - lo) / self.bins.max(1) as f64)
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        if self.bins > 0 && self.min_interval_seconds > 0.0 && self.max_interval_seconds > self.min_interval_seconds {
            Ok(())
        } else {
            Err(AnalysisError::InvalidInput(format!(
                "{} bins over [{}, {}] s",
                self.bins, self.min_interval_seconds, self.max_interval_seconds
            )))
        }
    }
}

/// Histogram of successive intervals. Intervals outside `[min, max)` are not counted.
pub fn interval_histogram(times: &[f64], config: &IsiConfig) -> Vec<u32> {
    let mut counts = vec![0u32; config.bins];
    if config.bins == 0 {
        return counts;
    }
    let (lo, step) = config.log_range();
    for pair in times.windows(2) {
        let interval = pair[1] - pair[0];
        if interval < config.min_interval_seconds || interval >= config.max_interval_seconds {
            continue;
        }
        let bin = ((interval.log10() - lo) / step).floor() as usize;
        counts[bin.min(config.bins - 1)] += 1;
    }
    counts
}

pub struct IsiAnalysis {
    trains: Vec<TrainTimes>,
    config: IsiConfig,
}

impl IsiAnalysis {
    pub fn new(trains: Vec<TrainTimes>, config: IsiConfig) -> Self {
        Self { trains, config }
    }
}

impl Analysis for IsiAnalysis {
    type Output = TrainHistogram;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::Isi
    }

    fn process(&mut self) -> Result<Vec<TrainHistogram>, AnalysisError> {
        self.config.validate()?;
        Ok(self
            .trains
            .iter()
            .map(|train| TrainHistogram {
                train: TrainId {
                    order: train.order,
                    channel: train.channel,
                },
                counts: interval_histogram(&train.times, &self.config),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_singleton_trains_give_zero_histograms() {
        let config = IsiConfig::default();
        for times in [vec![], vec![1.5]] {
            let counts = interval_histogram(&times, &config);
            assert_eq!(counts.len(), 100);
            assert!(counts.iter().all(|&c| c == 0));
        }
    }

    #[test]
    fn intervals_land_in_log_bins() {
        // 4 decades over 100 bins: 25 bins per decade
        let config = IsiConfig::default();
        let counts = interval_histogram(&[0.0, 0.0015, 0.1215, 20.0], &config);
        assert_eq!(counts.iter().sum::<u32>(), 2);
        assert_eq!(counts[4], 1);
        assert_eq!(counts[51], 1);
    }

    #[test]
    fn edges_span_the_configured_range() {
        let edges = IsiConfig::default().bin_edges();
        assert_eq!(edges.len(), 101);
        assert!((edges[0] - 1e-3).abs() < 1e-12);
        assert!((edges[100] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn analysis_labels_each_train() {
        let trains = vec![TrainTimes {
            order: 3,
            channel: 1,
            times: vec![0.0, 0.5],
        }];
        let results = IsiAnalysis::new(trains, IsiConfig::default()).process().unwrap();
        assert_eq!(results[0].train, TrainId { order: 3, channel: 1 });
        assert_eq!(results[0].counts.iter().sum::<u32>(), 1);
    }
}
