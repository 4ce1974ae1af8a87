//! AM modulation detector and demodulator.
//! Some SpikerBox models transmit the signal amplitude-modulated on a 5 kHz
//! carrier through the microphone jack. Detection compares the energy of the
//! band-limited input with the energy left after notching the carrier; a large
//! ratio means the carrier dominates. Hysteresis keeps the decision stable.

use serde::{Deserialize, Serialize};

use super::filters::{clamp_i16, Biquad};

/// Detector and demodulator constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmDetectionConfig {
    pub carrier_hz: f64,
    /// Low-pass applied before the energy comparison.
    pub detection_cutoff_hz: f64,
    /// Low-pass applied three times to the rectified signal.
    pub demod_cutoff_hz: f64,
    /// Energy ratio above which modulation is declared.
    pub on_ratio: f64,
    /// Energy ratio below which modulation is released.
    pub off_ratio: f64,
    /// Per-sample weight of the exponential energy average.
    pub smoothing: f64,
}

impl Default for AmDetectionConfig {
    fn default() -> Self {
        Self {
            carrier_hz: 5_000.0,
            detection_cutoff_hz: 6_000.0,
            demod_cutoff_hz: 500.0,
            on_ratio: 5.0,
            off_ratio: 3.0,
            smoothing: 1e-4,
        }
    }
}

const CARRIER_NOTCH_Q: f64 = 1.0;
const DC_BLOCK_POLE: f64 = 0.995;
const ENERGY_FLOOR: f64 = 1e-9;

/// One-pole DC blocker: `y[n] = x[n] - x[n-1] + r * y[n-1]`.
#[derive(Debug, Clone)]
struct DcBlocker {
    r: f64,
    x1: f64,
    y1: f64,
}

impl DcBlocker {
    fn new(r: f64) -> Self {
        Self { r, x1: 0.0, y1: 0.0 }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = x - self.x1 + self.r * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// Filter state for one sample rate. `None` when the rate is too low to
/// represent the detection band.
#[derive(Debug, Clone)]
struct Stages {
    detect_lowpass: Biquad,
    carrier_notch: Biquad,
    demod_lowpass: [Biquad; 3],
    dc_blocker: DcBlocker,
}

impl Stages {
    fn build(config: &AmDetectionConfig, sample_rate: u32) -> Option<Self> {
        let rate = f64::from(sample_rate);
        if rate <= 2.0 * config.detection_cutoff_hz || config.carrier_hz >= rate / 2.0 {
            return None;
        }
        let demod = || Biquad::lowpass(rate, config.demod_cutoff_hz);
        Some(Self {
            detect_lowpass: Biquad::lowpass(rate, config.detection_cutoff_hz),
            carrier_notch: Biquad::notch(rate, config.carrier_hz, CARRIER_NOTCH_Q),
            demod_lowpass: [demod(), demod(), demod()],
            dc_blocker: DcBlocker::new(DC_BLOCK_POLE),
        })
    }
}

pub struct AmDemodulator {
    config: AmDetectionConfig,
    stages: Option<Stages>,
    signal_energy: f64,
    notched_energy: f64,
    detected: bool,
}

impl AmDemodulator {
    pub fn new(config: AmDetectionConfig, sample_rate: u32) -> Self {
        let stages = Stages::build(&config, sample_rate);
        Self {
            config,
            stages,
            signal_energy: 0.0,
            notched_energy: 0.0,
            detected: false,
        }
    }

    /// Rebuild for a new rate. Detection state starts over.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        *self = Self::new(self.config.clone(), sample_rate);
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    /// False when the current rate cannot carry the modulated signal.
    pub fn is_enabled(&self) -> bool {
        self.stages.is_some()
    }

    /// Run detection over the batch and demodulate it in place while
    /// modulation is detected. Returns every detection change, in order.
    pub fn process(&mut self, samples: &mut [i16]) -> Vec<bool> {
        let mut transitions = Vec::new();
        let Some(stages) = self.stages.as_mut() else {
            return transitions;
        };
        let alpha = self.config.smoothing;

        for sample in samples.iter_mut() {
            let x = f64::from(*sample);
            let band = stages.detect_lowpass.filter(x);
            let notched = stages.carrier_notch.filter(band);
            self.signal_energy += alpha * (band * band - self.signal_energy);
            self.notched_energy += alpha * (notched * notched - self.notched_energy);

            let ratio = if self.signal_energy < ENERGY_FLOOR {
                0.0
            } else {
                self.signal_energy / self.notched_energy.max(ENERGY_FLOOR)
            };
            if !self.detected && ratio > self.config.on_ratio {
                self.detected = true;
                transitions.push(true);
            } else if self.detected && ratio < self.config.off_ratio {
                self.detected = false;
                transitions.push(false);
            }

            if self.detected {
                let mut y = x.abs();
                for lp in &mut stages.demod_lowpass {
                    y = lp.filter(y);
                }
                *sample = clamp_i16(stages.dc_blocker.process(y));
            }
        }
        transitions
    }
}
