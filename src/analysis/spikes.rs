//! Spike detection.
//! Noise level: standard deviation of short chunks, taken at a low percentile
//! so bursts of activity do not inflate it. Peaks beyond `±k·σ` are captured
//! with a Schmitt trigger that re-arms at the zero crossing, then spikes closer
//! than the kill interval are merged keeping the larger magnitude.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Analysis, AnalysisType};
use crate::audio::wav::AudioFile;
use crate::error::AnalysisError;
use crate::repository::Spike;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeFindingConfig {
    /// Length of the chunks whose standard deviations estimate the noise.
    pub chunk_ms: f64,
    /// Percentile (0-100) of the chunk deviations used as σ.
    pub noise_percentile: f64,
    /// Threshold multiplier `k`.
    pub threshold_sigmas: f64,
    /// Minimum distance between two spikes.
    pub kill_interval_ms: f64,
}

impl Default for SpikeFindingConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 10.0,
            noise_percentile: 40.0,
            threshold_sigmas: 2.0,
            kill_interval_ms: 5.0,
        }
    }
}

pub struct SpikeFindingAnalysis {
    file: Arc<AudioFile>,
    config: SpikeFindingConfig,
}

impl SpikeFindingAnalysis {
    pub fn new(file: Arc<AudioFile>, config: SpikeFindingConfig) -> Self {
        Self { file, config }
    }
}

impl Analysis for SpikeFindingAnalysis {
    type Output = Spike;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::FindSpikes
    }

    fn process(&mut self) -> Result<Vec<Spike>, AnalysisError> {
        let rate = self.file.sample_rate();
        let mut spikes = Vec::new();
        for channel in 0..self.file.channels() {
            let samples = self.file.read_channel(channel)?;
            spikes.extend(find_spikes(&samples, channel, rate, &self.config));
        }
        Ok(spikes)
    }
}

/// Spikes of one channel, ascending by index.
pub fn find_spikes(samples: &[i16], channel: u16, sample_rate: u32, config: &SpikeFindingConfig) -> Vec<Spike> {
    let rate = f64::from(sample_rate.max(1));
    let chunk_len = ((rate * config.chunk_ms / 1_000.0) as usize).max(1);
    let sigma = noise_sigma(samples, chunk_len, config.noise_percentile);
    if sigma <= 0.0 {
        return Vec::new();
    }
    let threshold = config.threshold_sigmas * sigma;

    let mut peaks = schmitt_peaks(samples, threshold, Polarity::Positive);
    peaks.extend(schmitt_peaks(samples, threshold, Polarity::Negative));
    peaks.sort_unstable_by_key(|&(index, _)| index);

    let kill = (rate * config.kill_interval_ms / 1_000.0) as usize;
    suppress_close(peaks, kill)
        .into_iter()
        .map(|(index, value)| Spike {
            channel,
            index: index as u64,
            value,
            time: index as f64 / rate,
        })
        .collect()
}

fn noise_sigma(samples: &[i16], chunk_len: usize, percentile: f64) -> f64 {
    let mut deviations: Vec<f64> = samples.chunks(chunk_len).map(std_dev).collect();
    if deviations.is_empty() {
        return 0.0;
    }
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((percentile.clamp(0.0, 100.0) / 100.0) * (deviations.len() - 1) as f64).round() as usize;
    deviations[idx]
}

fn std_dev(chunk: &[i16]) -> f64 {
    let n = chunk.len() as f64;
    let mean = chunk.iter().map(|&s| f64::from(s)).sum::<f64>() / n;
    let var = chunk
        .iter()
        .map(|&s| {
            let d = f64::from(s) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt()
}

#[derive(Clone, Copy)]
enum Polarity {
    Positive,
    Negative,
}

/// Extremum of every excursion beyond the threshold. An excursion ends when
/// the signal crosses zero; one still open at the end is dropped.
fn schmitt_peaks(samples: &[i16], threshold: f64, polarity: Polarity) -> Vec<(usize, i16)> {
    let sign = match polarity {
        Polarity::Positive => 1.0,
        Polarity::Negative => -1.0,
    };
    let mut peaks = Vec::new();
    let mut current: Option<(usize, i16)> = None;
    for (i, &s) in samples.iter().enumerate() {
        let v = sign * f64::from(s);
        current = match current {
            None if v > threshold => Some((i, s)),
            None => None,
            Some(peak) if v < 0.0 => {
                peaks.push(peak);
                None
            }
            Some((_, peak)) if v > sign * f64::from(peak) => Some((i, s)),
            open => open,
        };
    }
    peaks
}

/// Keep the larger-magnitude spike of any two closer than `kill` samples.
fn suppress_close(peaks: Vec<(usize, i16)>, kill: usize) -> Vec<(usize, i16)> {
    let mut kept: Vec<(usize, i16)> = Vec::with_capacity(peaks.len());
    for peak in peaks {
        match kept.last_mut() {
            Some(last) if peak.0 - last.0 < kill => {
                if peak.1.unsigned_abs() > last.1.unsigned_abs() {
                    *last = peak;
                }
            }
            _ => kept.push(peak),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Low-level deterministic noise with spikes injected at `at`.
    fn signal(len: usize, at: &[(usize, i16)]) -> Vec<i16> {
        let mut out: Vec<i16> = (0..len).map(|i| if i % 2 == 0 { 10 } else { -10 }).collect();
        for &(i, v) in at {
            out[i] = v;
        }
        out
    }

    #[test]
    fn finds_positive_and_negative_spikes() {
        let samples = signal(10_000, &[(1_000, 2_000), (5_001, -1_500)]);
        let spikes = find_spikes(&samples, 0, 10_000, &SpikeFindingConfig::default());
        let found: Vec<(u64, i16)> = spikes.iter().map(|s| (s.index, s.value)).collect();
        assert_eq!(found, vec![(1_000, 2_000), (5_001, -1_500)]);
        assert_eq!(spikes[0].time, 0.1);
    }

    #[test]
    fn kill_interval_keeps_larger_spike() {
        // 5 ms at 10 kHz is 50 samples
        let samples = signal(10_000, &[(2_000, 900), (2_020, 1_800), (2_100, 700)]);
        let spikes = find_spikes(&samples, 1, 10_000, &SpikeFindingConfig::default());
        let found: Vec<(u64, i16)> = spikes.iter().map(|s| (s.index, s.value)).collect();
        assert_eq!(found, vec![(2_020, 1_800), (2_100, 700)]);
        assert!(spikes.iter().all(|s| s.channel == 1));
    }

    #[test]
    fn flat_signal_has_no_spikes() {
        assert!(find_spikes(&[0; 5_000], 0, 10_000, &SpikeFindingConfig::default()).is_empty());
        assert!(find_spikes(&[], 0, 10_000, &SpikeFindingConfig::default()).is_empty());
    }

    #[test]
    fn open_excursion_at_end_is_dropped() {
        let peaks = schmitt_peaks(&[0, 50, 80, 60], 40.0, Polarity::Positive);
        assert!(peaks.is_empty());
        let peaks = schmitt_peaks(&[0, 50, 80, 60, -1], 40.0, Polarity::Positive);
        assert_eq!(peaks, vec![(2, 80)]);
    }
}
