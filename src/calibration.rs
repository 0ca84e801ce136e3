//! Calibration support for SMU devices.
//!
//! Every device stores a gain/offset correction for each channel, signal and direction
//! in its persistent storage. The engine treats the stored block as an opaque matrix
//! handed over by the transport and applies it in software:
//!
//! ```text
//! measured = raw * gain + offset          (measure direction)
//! raw      = (value - offset) / gain      (source direction)
//! ```
//!
//! # File format
//!
//! Calibration files are TOML, one table per channel, signal and direction. Missing
//! tables default to the identity correction.
//!
//! ```toml
//! [A.voltage.measure]
//! gain = 1.0021
//! offset = -0.0034
//!
//! [A.current.source]
//! gain = 0.9987
//! offset = 0.0001
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppResult, SmuError};
use crate::sample::{channel_name, Signal, CHANNEL_COUNT};

/// Accepted gain window; anything outside it points at a corrupt file.
pub const GAIN_LIMITS: (f32, f32) = (0.5, 1.5);

/// Direction a correction applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Raw reading to physical value
    Measure,
    /// Physical set-point to raw value
    Source,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measure => write!(f, "measure"),
            Self::Source => write!(f, "source"),
        }
    }
}

/// A linear correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    /// Multiplicative gain factor
    #[serde(default = "unity")]
    pub gain: f32,
    /// Constant offset
    #[serde(default)]
    pub offset: f32,
}

fn unity() -> f32 {
    1.0
}

impl Default for Coefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl Coefficients {
    /// Unity gain, zero offset.
    pub fn identity() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }

    /// Create a linear correction.
    pub fn linear(gain: f32, offset: f32) -> Self {
        Self { gain, offset }
    }

    fn validate(&self, context: &str) -> AppResult<()> {
        if !self.gain.is_finite() || !self.offset.is_finite() {
            return Err(SmuError::Calibration(format!(
                "{context}: coefficients must be finite"
            )));
        }
        if self.gain < GAIN_LIMITS.0 || self.gain > GAIN_LIMITS.1 {
            return Err(SmuError::Calibration(format!(
                "{context}: gain {} outside {}..{}",
                self.gain, GAIN_LIMITS.0, GAIN_LIMITS.1
            )));
        }
        Ok(())
    }
}

/// Measure and source corrections for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalCalibration {
    /// Correction applied to readings
    #[serde(default)]
    pub measure: Coefficients,
    /// Correction applied to set-points
    #[serde(default)]
    pub source: Coefficients,
}

/// Corrections for both signals of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// Voltage signal corrections
    #[serde(default)]
    pub voltage: SignalCalibration,
    /// Current signal corrections
    #[serde(default)]
    pub current: SignalCalibration,
}

impl ChannelCalibration {
    /// Correction for a signal and direction.
    pub fn get(&self, signal: Signal, direction: Direction) -> Coefficients {
        let signal = match signal {
            Signal::Voltage => &self.voltage,
            Signal::Current => &self.current,
        };
        match direction {
            Direction::Measure => signal.measure,
            Direction::Source => signal.source,
        }
    }

    fn entries(&self) -> [(Signal, Direction, Coefficients); 4] {
        [
            (Signal::Voltage, Direction::Measure, self.voltage.measure),
            (Signal::Voltage, Direction::Source, self.voltage.source),
            (Signal::Current, Direction::Measure, self.current.measure),
            (Signal::Current, Direction::Source, self.current.source),
        ]
    }
}

/// Per-channel gain/offset matrix of a device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    /// Channel A
    #[serde(rename = "A", default)]
    pub a: ChannelCalibration,
    /// Channel B
    #[serde(rename = "B", default)]
    pub b: ChannelCalibration,
}

impl Calibration {
    /// Factory defaults: identity corrections everywhere.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Whether every correction is the identity.
    pub fn is_factory(&self) -> bool {
        *self == Self::identity()
    }

    /// Corrections for a channel index.
    pub fn channel(&self, channel: usize) -> &ChannelCalibration {
        if channel == 0 {
            &self.a
        } else {
            &self.b
        }
    }

    /// Mutable corrections for a channel index.
    pub fn channel_mut(&mut self, channel: usize) -> &mut ChannelCalibration {
        if channel == 0 {
            &mut self.a
        } else {
            &mut self.b
        }
    }

    /// Parse a calibration file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SmuError::Calibration(format!("cannot read {}: {e}", path.display()))
        })?;
        let calibration = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded calibration file");
        Ok(calibration)
    }

    /// Parse calibration data from TOML text.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let calibration: Self = toml::from_str(content)
            .map_err(|e| SmuError::Calibration(format!("malformed calibration data: {e}")))?;
        calibration.validate()?;
        Ok(calibration)
    }

    /// Render as TOML in the file format accepted by [`Calibration::from_file`].
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SmuError::Calibration(format!("cannot serialize calibration: {e}")))
    }

    /// Check every coefficient is finite and every gain is plausible.
    pub fn validate(&self) -> AppResult<()> {
        for channel in 0..CHANNEL_COUNT {
            for (signal, direction, coefficients) in self.channel(channel).entries() {
                let context = format!("{}.{signal}.{direction}", channel_name(channel));
                coefficients.validate(&context)?;
            }
        }
        Ok(())
    }

    /// Convert a raw reading into a physical value.
    pub fn measure(&self, channel: usize, signal: Signal, raw: f32) -> f32 {
        let c = self.channel(channel).get(signal, Direction::Measure);
        raw * c.gain + c.offset
    }

    /// Convert a physical set-point into the raw value sent to the device.
    pub fn source(&self, channel: usize, signal: Signal, value: f32) -> f32 {
        let c = self.channel(channel).get(signal, Direction::Source);
        (value - c.offset) / c.gain
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for channel in 0..CHANNEL_COUNT {
            for (signal, direction, c) in self.channel(channel).entries() {
                writeln!(
                    f,
                    "{}.{signal}.{direction}: gain {:.4} offset {:.4}",
                    channel_name(channel),
                    c.gain,
                    c.offset
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identity_roundtrip_values() {
        let cal = Calibration::identity();
        assert!(cal.is_factory());
        assert_eq!(cal.measure(0, Signal::Voltage, 2.5), 2.5);
        assert_eq!(cal.source(1, Signal::Current, 0.1), 0.1);
    }

    #[test]
    fn test_partial_file_defaults_to_identity() {
        let cal = Calibration::from_toml_str(
            r#"
            [A.voltage.measure]
            gain = 1.25
            offset = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(cal.measure(0, Signal::Voltage, 2.0), 3.0);
        assert_eq!(cal.b, ChannelCalibration::default());
        assert!(!cal.is_factory());
    }

    #[test]
    fn test_source_inverts_measure_form() {
        let mut cal = Calibration::identity();
        cal.channel_mut(1).current.source = Coefficients::linear(0.5, 0.25);
        assert_eq!(cal.source(1, Signal::Current, 0.75), 1.0);
    }

    #[test]
    fn test_rejects_implausible_gain() {
        let err = Calibration::from_toml_str(
            r#"
            [B.current.measure]
            gain = 4.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SmuError::Calibration(_)));
        assert!(err.to_string().contains("B.current.measure"));
    }

    #[test]
    fn test_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = not [valid").unwrap();
        assert!(matches!(
            Calibration::from_file(file.path()),
            Err(SmuError::Calibration(_))
        ));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut cal = Calibration::identity();
        cal.a.voltage.measure = Coefficients::linear(1.0625, -0.125);
        let text = cal.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        assert_eq!(Calibration::from_file(file.path()).unwrap(), cal);
    }
}
