//! Average spike waveform per train, with a ±1 standard deviation envelope.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Analysis, AnalysisType, TrainId};
use crate::audio::wav::AudioFile;
use crate::error::AnalysisError;
use crate::repository::TrainIndices;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageSpikeConfig {
    /// Window on each side of the spike peak.
    pub half_window_ms: f64,
}

impl Default for AverageSpikeConfig {
    fn default() -> Self {
        Self { half_window_ms: 2.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AverageSpike {
    pub train: TrainId,
    /// Spikes whose window fitted inside the file.
    pub spike_count: usize,
    pub average: Vec<f32>,
    pub std_dev: Vec<f32>,
    pub top_std_line: Vec<f32>,
    pub bottom_std_line: Vec<f32>,
}

pub struct AverageSpikeAnalysis {
    file: Arc<AudioFile>,
    trains: Vec<TrainIndices>,
    config: AverageSpikeConfig,
}

impl AverageSpikeAnalysis {
    pub fn new(file: Arc<AudioFile>, trains: Vec<TrainIndices>, config: AverageSpikeConfig) -> Self {
        Self { file, trains, config }
    }
}

impl Analysis for AverageSpikeAnalysis {
    type Output = AverageSpike;

    fn analysis_type(&self) -> AnalysisType {
        AnalysisType::AverageSpike
    }

    fn process(&mut self) -> Result<Vec<AverageSpike>, AnalysisError> {
        let half = (f64::from(self.file.sample_rate()) * self.config.half_window_ms / 1_000.0) as usize;
        let mut channels: HashMap<u16, Vec<i16>> = HashMap::new();
        let mut out = Vec::with_capacity(self.trains.len());
        for train in &self.trains {
            if !channels.contains_key(&train.channel) {
                let samples = self.file.read_channel(train.channel)?;
                channels.insert(train.channel, samples);
            }
            let samples = channels.get(&train.channel).map(Vec::as_slice).unwrap_or_default();
            let id = TrainId {
                order: train.order,
                channel: train.channel,
            };
            out.push(average_spike(id, samples, &train.indices, half));
        }
        Ok(out)
    }
}

/// Mean and standard deviation over windows `[index − half, index + half]`.
/// Windows crossing either end of `samples` are skipped.
pub fn average_spike(train: TrainId, samples: &[i16], indices: &[u64], half: usize) -> AverageSpike {
    let width = 2 * half + 1;
    let mut sum = vec![0f64; width];
    let mut sum_sq = vec![0f64; width];
    let mut count = 0usize;

    for &index in indices {
        let Ok(index) = usize::try_from(index) else {
            continue;
        };
        if index < half || index + half >= samples.len() {
            continue;
        }
        for (k, &s) in samples[index - half..=index + half].iter().enumerate() {
            let v = f64::from(s);
            sum[k] += v;
            sum_sq[k] += v * v;
        }
        count += 1;
    }

    let n = count.max(1) as f64;
    let average: Vec<f32> = sum.iter().map(|s| (s / n) as f32).collect();
    let std_dev: Vec<f32> = sum
        .iter()
        .zip(&sum_sq)
        .map(|(s, sq)| {
            let mean = s / n;
            (sq / n - mean * mean).max(0.0).sqrt() as f32
        })
        .collect();
    let top_std_line = average.iter().zip(&std_dev).map(|(m, s)| m + s).collect();
    let bottom_std_line = average.iter().zip(&std_dev).map(|(m, s)| m - s).collect();

    AverageSpike {
        train,
        spike_count: count,
        average,
        std_dev,
        top_std_line,
        bottom_std_line,
    }
}
