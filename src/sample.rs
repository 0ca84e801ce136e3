//! Sample and channel-mode types shared by devices, channels and queues.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SmuError};

/// Number of analog channels on every supported device.
pub const CHANNEL_COUNT: usize = 2;

/// Per-channel operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// High impedance, the channel floats
    #[default]
    HiZ,
    /// Source voltage, measure current
    Svmi,
    /// Source current, measure voltage
    Simv,
}

impl Mode {
    /// Raw value used in mode control requests.
    pub fn to_raw(self) -> u8 {
        match self {
            Self::HiZ => 0,
            Self::Svmi => 1,
            Self::Simv => 2,
        }
    }

    /// Map a raw mode value, rejecting anything outside the enumeration.
    pub fn from_raw(raw: u8) -> AppResult<Self> {
        match raw {
            0 => Ok(Self::HiZ),
            1 => Ok(Self::Svmi),
            2 => Ok(Self::Simv),
            other => Err(SmuError::InvalidArgument(format!("invalid mode: {other}"))),
        }
    }

    /// The signal driven by this mode, if any.
    pub fn sourced_signal(self) -> Option<Signal> {
        match self {
            Self::HiZ => None,
            Self::Svmi => Some(Signal::Voltage),
            Self::Simv => Some(Signal::Current),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HiZ => write!(f, "HI_Z"),
            Self::Svmi => write!(f, "SVMI"),
            Self::Simv => write!(f, "SIMV"),
        }
    }
}

impl FromStr for Mode {
    type Err = SmuError;

    /// Accepts the long names as well as the single-letter `d`/`v`/`i` forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "d" | "hi_z" | "hiz" => Ok(Self::HiZ),
            "v" | "svmi" => Ok(Self::Svmi),
            "i" | "simv" => Ok(Self::Simv),
            _ => Err(SmuError::InvalidArgument(format!("invalid mode: {s}"))),
        }
    }
}

/// One of the two signals present on every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Channel voltage in volts
    Voltage,
    /// Channel current in amps
    Current,
}

impl Signal {
    /// Physical range of the signal as (min, max).
    pub fn range(self) -> (f32, f32) {
        match self {
            Self::Voltage => (0.0, 5.0),
            Self::Current => (-0.2, 0.2),
        }
    }

    /// Clamp a value into the signal range.
    pub fn clamp(self, value: f32) -> f32 {
        let (min, max) = self.range();
        value.clamp(min, max)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voltage => write!(f, "voltage"),
            Self::Current => write!(f, "current"),
        }
    }
}

/// Validate a channel index, returning it as `usize`.
pub fn check_channel(channel: usize) -> AppResult<usize> {
    if channel < CHANNEL_COUNT {
        Ok(channel)
    } else {
        Err(SmuError::InvalidArgument(format!(
            "invalid channel {channel}: devices have {CHANNEL_COUNT} channels"
        )))
    }
}

/// Letter name of a channel index (`A`, `B`).
pub fn channel_name(channel: usize) -> char {
    (b'A' + channel as u8) as char
}

/// A single channel's reading for one sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    /// Acquisition index, monotonically increasing within a device
    pub index: u64,
    /// Measured or sourced current (A)
    pub current: f32,
    /// Measured or sourced voltage (V)
    pub voltage: f32,
}

/// A synchronized reading of both channels of a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Acquisition index, monotonically increasing within a device
    pub index: u64,
    /// Channel A (current, voltage)
    pub a: (f32, f32),
    /// Channel B (current, voltage)
    pub b: (f32, f32),
}

impl Sample {
    /// Build from the two per-channel readings of the same interval.
    pub fn from_channels(a: ChannelSample, b: ChannelSample) -> Self {
        Self {
            index: a.index,
            a: (a.current, a.voltage),
            b: (b.current, b.voltage),
        }
    }

    /// The 4-tuple (A current, A voltage, B current, B voltage).
    pub fn as_tuple(&self) -> (f32, f32, f32, f32) {
        (self.a.0, self.a.1, self.b.0, self.b.1)
    }

    /// Project one channel's slice of the sample.
    pub fn channel(&self, channel: usize) -> ChannelSample {
        let (current, voltage) = if channel == 0 { self.a } else { self.b };
        ChannelSample {
            index: self.index,
            current,
            voltage,
        }
    }
}

/// How long a read may block waiting for samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Return whatever is available right now
    NonBlocking,
    /// Block until the request is satisfied or the stream ends
    Forever,
    /// Block for at most this long
    After(Duration),
}

impl ReadTimeout {
    /// Map the integer convention used by the bindings: `0`, `-1`, or milliseconds.
    pub fn from_millis(timeout: i64) -> AppResult<Self> {
        match timeout {
            0 => Ok(Self::NonBlocking),
            -1 => Ok(Self::Forever),
            ms if ms > 0 => Ok(Self::After(Duration::from_millis(ms as u64))),
            other => Err(SmuError::InvalidArgument(format!(
                "invalid timeout {other}: expected -1, 0 or a positive number of milliseconds"
            ))),
        }
    }
}

impl TryFrom<i64> for ReadTimeout {
    type Error = SmuError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_millis(value)
    }
}

/// Samples drained by a read, together with the overflow count since the previous read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult<T> {
    /// Samples in acquisition order
    pub samples: Vec<T>,
    /// Samples evicted by queue overflow since the previous read
    pub dropped: u64,
}

impl<T> ReadResult<T> {
    /// Number of samples returned.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the read returned no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether an overflow was reported.
    pub fn has_dropped(&self) -> bool {
        self.dropped > 0
    }
}

/// Outcome of queueing output data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Values accepted into the output queue
    pub queued: usize,
    /// Pending values evicted to make room
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("d".parse::<Mode>().unwrap(), Mode::HiZ);
        assert_eq!("V".parse::<Mode>().unwrap(), Mode::Svmi);
        assert_eq!("simv".parse::<Mode>().unwrap(), Mode::Simv);
        assert!("x".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_raw_values() {
        for mode in [Mode::HiZ, Mode::Svmi, Mode::Simv] {
            assert_eq!(Mode::from_raw(mode.to_raw()).unwrap(), mode);
        }
        assert!(matches!(
            Mode::from_raw(3),
            Err(SmuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_timeout_mapping() {
        assert_eq!(ReadTimeout::from_millis(0).unwrap(), ReadTimeout::NonBlocking);
        assert_eq!(ReadTimeout::from_millis(-1).unwrap(), ReadTimeout::Forever);
        assert_eq!(
            ReadTimeout::try_from(250).unwrap(),
            ReadTimeout::After(Duration::from_millis(250))
        );
        assert!(ReadTimeout::from_millis(-2).is_err());
    }

    #[test]
    fn test_sample_projection() {
        let a = ChannelSample {
            index: 7,
            current: 0.01,
            voltage: 2.5,
        };
        let b = ChannelSample {
            index: 7,
            current: -0.02,
            voltage: 1.0,
        };
        let sample = Sample::from_channels(a, b);
        assert_eq!(sample.as_tuple(), (0.01, 2.5, -0.02, 1.0));
        assert_eq!(sample.channel(0), a);
        assert_eq!(sample.channel(1), b);
    }

    #[test]
    fn test_channel_validation() {
        assert_eq!(check_channel(1).unwrap(), 1);
        assert!(check_channel(2).is_err());
        assert_eq!(channel_name(0), 'A');
        assert_eq!(channel_name(1), 'B');
    }

    #[test]
    fn test_signal_clamp() {
        assert_eq!(Signal::Voltage.clamp(6.0), 5.0);
        assert_eq!(Signal::Current.clamp(-1.0), -0.2);
        assert_eq!(Signal::Voltage.clamp(2.5), 2.5);
    }
}
