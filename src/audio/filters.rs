//! Digital filters applied inline to incoming batches.
//!
//! Second-order IIR sections (Butterworth low/high-pass, notch) and a cascade
//! rebuilt whenever the sample rate or the settings change.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::am::{AmDemodulator, AmDetectionConfig};
use crate::events::{Event, EventBus};

/// Second-order section coefficients, `a[0]` normalised to 1.
#[derive(Clone, Debug, PartialEq)]
pub struct BiquadCoeffs {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

/// Second-order biquad filter section (direct form I).
#[derive(Clone, Debug)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    /// [x1, x2, y1, y2]
    state: [f64; 4],
}

impl Biquad {
    #[must_use]
    pub fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: [0.0; 4],
        }
    }

    /// Second-order Butterworth low-pass.
    #[must_use]
    pub fn lowpass(sample_rate: f64, cutoff: f64) -> Self {
        let k = (std::f64::consts::PI * cutoff / sample_rate).tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;
        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        Self::new(BiquadCoeffs {
            b: [k2 * norm, 2.0 * k2 * norm, k2 * norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        })
    }

    /// Second-order Butterworth high-pass.
    #[must_use]
    pub fn highpass(sample_rate: f64, cutoff: f64) -> Self {
        let k = (std::f64::consts::PI * cutoff / sample_rate).tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;
        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        Self::new(BiquadCoeffs {
            b: [norm, -2.0 * norm, norm],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - sqrt2 * k + k2) * norm],
        })
    }

    /// Notch centred on `notch_freq` with quality factor `q`.
    #[must_use]
    pub fn notch(sample_rate: f64, notch_freq: f64, q: f64) -> Self {
        let omega = 2.0 * std::f64::consts::PI * notch_freq / sample_rate;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);
        let norm = 1.0 / (1.0 + alpha);

        Self::new(BiquadCoeffs {
            b: [norm, -2.0 * cos_omega * norm, norm],
            a: [1.0, -2.0 * cos_omega * norm, (1.0 - alpha) * norm],
        })
    }

    #[inline]
    pub fn filter(&mut self, input: f64) -> f64 {
        let [x1, x2, y1, y2] = self.state;
        let c = &self.coeffs;
        let output = c.b[0] * input + c.b[1] * x1 + c.b[2] * x2 - c.a[1] * y1 - c.a[2] * y2;
        self.state = [input, x1, output, y1];
        output
    }

    pub fn reset(&mut self) {
        self.state = [0.0; 4];
    }
}

/// User-selectable inline filters. `None` disables a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilterSettings {
    /// High-pass corner (removes content below it).
    pub low_cutoff_hz: Option<f64>,
    /// Low-pass corner (removes content above it).
    pub high_cutoff_hz: Option<f64>,
    /// Mains notch, typically 50 or 60 Hz.
    pub notch_hz: Option<f64>,
    pub notch_q: Option<f64>,
}

const DEFAULT_NOTCH_Q: f64 = 30.0;

/// Cascade built from [`FilterSettings`] for one sample rate.
/// Stages whose frequency the rate cannot represent are left out.
#[derive(Clone, Debug)]
pub struct FilterCascade {
    settings: FilterSettings,
    sample_rate: u32,
    stages: Vec<Biquad>,
}

impl FilterCascade {
    pub fn new(settings: FilterSettings, sample_rate: u32) -> Self {
        let mut cascade = Self {
            settings,
            sample_rate,
            stages: Vec::new(),
        };
        cascade.rebuild();
        cascade
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.rebuild();
    }

    pub fn set_settings(&mut self, settings: FilterSettings) {
        self.settings = settings;
        self.rebuild();
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Filter a batch in place.
    pub fn process(&mut self, samples: &mut [i16]) {
        if self.stages.is_empty() {
            return;
        }
        for sample in samples.iter_mut() {
            let mut value = f64::from(*sample);
            for stage in &mut self.stages {
                value = stage.filter(value);
            }
            *sample = clamp_i16(value);
        }
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }

    fn rebuild(&mut self) {
        let rate = f64::from(self.sample_rate);
        let nyquist = rate / 2.0;
        let usable = |f: f64| f > 0.0 && f < nyquist;
        let mut stages = Vec::new();
        if let Some(f) = self.settings.low_cutoff_hz.filter(|&f| usable(f)) {
            stages.push(Biquad::highpass(rate, f));
        }
        if let Some(f) = self.settings.high_cutoff_hz.filter(|&f| usable(f)) {
            stages.push(Biquad::lowpass(rate, f));
        }
        if let Some(f) = self.settings.notch_hz.filter(|&f| usable(f)) {
            let q = self.settings.notch_q.unwrap_or(DEFAULT_NOTCH_Q);
            stages.push(Biquad::notch(rate, f, q));
        }
        self.stages = stages;
    }
}

/// Per-batch processing applied to every streamed batch before it reaches the
/// ring buffer: AM demodulation (when a carrier is detected), then the cascade.
pub struct InlineFilterChain {
    filters: FilterCascade,
    am: AmDemodulator,
    events: EventBus,
}

impl InlineFilterChain {
    pub fn new(
        settings: FilterSettings,
        am_config: AmDetectionConfig,
        sample_rate: u32,
        events: EventBus,
    ) -> Self {
        Self {
            filters: FilterCascade::new(settings, sample_rate),
            am: AmDemodulator::new(am_config, sample_rate),
            events,
        }
    }

    /// Filter a batch. Modulation changes are published as they happen.
    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        let mut out = samples.to_vec();
        for detected in self.am.process(&mut out) {
            info!(detected, "am_modulation");
            self.events.publish(Event::AmModulationDetected { detected });
        }
        self.filters.process(&mut out);
        out
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if self.am.is_detected() {
            self.events.publish(Event::AmModulationDetected { detected: false });
        }
        self.am.set_sample_rate(sample_rate);
        self.filters.set_sample_rate(sample_rate);
    }

    pub fn set_settings(&mut self, settings: FilterSettings) {
        self.filters.set_settings(settings);
    }

    pub fn settings(&self) -> &FilterSettings {
        self.filters.settings()
    }

    pub fn is_am_modulation_detected(&self) -> bool {
        self.am.is_detected()
    }
}

#[inline]
pub(crate) fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}
