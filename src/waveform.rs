//! Output waveform generation.
//!
//! Periodic waves are rendered into a single period of samples and handed to the
//! channel's output queue as a cyclic buffer, so playback repeats them exactly.
//!
//! Every wave swings between `valley = 2 * midpoint - peak` and `peak`. `period` and
//! `phase` are expressed in samples.

use std::f64::consts::PI;

use crate::error::{AppResult, SmuError};

/// Number of levels produced by [`WaveKind::Stairstep`].
pub const STAIRSTEP_LEVELS: u32 = 10;

/// Longest period that is rendered into a playback buffer.
pub const MAX_PERIOD_SAMPLES: f64 = 1_000_000.0;

/// Shape of a periodic wave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaveKind {
    /// High for `duty_cycle` of the period, low for the rest
    Square {
        /// Fraction of the period spent at the peak, in (0, 1]
        duty_cycle: f64,
    },
    /// Linear ramp from valley to peak
    Sawtooth,
    /// Ramp quantized to [`STAIRSTEP_LEVELS`] levels
    Stairstep,
    /// Sinusoid centred on the midpoint
    Sine,
    /// Linear ramp up then down
    Triangle,
}

/// A periodic output wave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Periodic {
    /// Wave shape
    pub kind: WaveKind,
    /// Centre value
    pub midpoint: f32,
    /// Maximum value
    pub peak: f32,
    /// Period in samples
    pub period: f64,
    /// Phase offset in samples
    pub phase: f64,
}

impl Periodic {
    /// Build and validate a periodic wave.
    pub fn new(kind: WaveKind, midpoint: f32, peak: f32, period: f64, phase: f64) -> AppResult<Self> {
        let wave = Self {
            kind,
            midpoint,
            peak,
            period,
            phase,
        };
        wave.validate()?;
        Ok(wave)
    }

    fn validate(&self) -> AppResult<()> {
        if !self.period.is_finite() || self.period < 2.0 || self.period > MAX_PERIOD_SAMPLES {
            return Err(SmuError::InvalidArgument(format!(
                "invalid period {}: expected 2..={MAX_PERIOD_SAMPLES} samples",
                self.period
            )));
        }
        if !self.phase.is_finite() || !self.midpoint.is_finite() || !self.peak.is_finite() {
            return Err(SmuError::InvalidArgument(
                "waveform parameters must be finite".to_string(),
            ));
        }
        if let WaveKind::Square { duty_cycle } = self.kind {
            if !(duty_cycle > 0.0 && duty_cycle <= 1.0) {
                return Err(SmuError::InvalidArgument(format!(
                    "invalid duty cycle {duty_cycle}: expected (0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Lowest value of the wave.
    pub fn valley(&self) -> f32 {
        2.0 * self.midpoint - self.peak
    }

    /// Value of the wave at sample `index`.
    pub fn value_at(&self, index: u64) -> f32 {
        let position = (index as f64 + self.phase).rem_euclid(self.period);
        let fraction = position / self.period;
        let valley = f64::from(self.valley());
        let peak = f64::from(self.peak);
        let span = peak - valley;

        let value = match self.kind {
            WaveKind::Square { duty_cycle } => {
                if fraction < duty_cycle {
                    peak
                } else {
                    valley
                }
            }
            WaveKind::Sawtooth => valley + span * fraction,
            WaveKind::Stairstep => {
                let levels = f64::from(STAIRSTEP_LEVELS);
                let step = (fraction * levels).floor().min(levels - 1.0);
                valley + span * step / (levels - 1.0)
            }
            WaveKind::Sine => {
                f64::from(self.midpoint) + (span / 2.0) * (2.0 * PI * fraction).sin()
            }
            WaveKind::Triangle => {
                if fraction < 0.5 {
                    valley + span * fraction * 2.0
                } else {
                    peak - span * (fraction - 0.5) * 2.0
                }
            }
        };
        value as f32
    }

    /// Render one full period for cyclic playback.
    pub fn render(&self) -> Vec<f32> {
        let len = self.period.round() as u64;
        (0..len).map(|i| self.value_at(i)).collect()
    }
}
