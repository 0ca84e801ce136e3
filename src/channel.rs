//! Channel views.
//!
//! A [`Channel`] is one half of a device, bound to index 0 (`A`) or 1 (`B`). It holds
//! a weak reference to its device and forwards every operation with its index,
//! projecting the channel's slice out of the synchronized samples.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::Device;
use crate::error::{AppResult, SmuError};
use crate::sample::{channel_name, ChannelSample, Mode, ReadResult, ReadTimeout, WriteResult};
use crate::waveform::{Periodic, WaveKind};

/// One analog channel of a device.
#[derive(Clone)]
pub struct Channel {
    device: Weak<Device>,
    index: usize,
}

impl Channel {
    pub(crate) fn new(device: Weak<Device>, index: usize) -> Self {
        Self { device, index }
    }

    /// Channel index (0 for `A`, 1 for `B`).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Letter name of the channel.
    pub fn name(&self) -> char {
        channel_name(self.index)
    }

    /// Owning device.
    ///
    /// Fails once the session has dropped the device.
    pub fn device(&self) -> AppResult<Arc<Device>> {
        self.device.upgrade().ok_or_else(|| {
            SmuError::InvalidState(format!("device of channel {} is gone", self.name()))
        })
    }

    /// Current mode.
    pub fn mode(&self) -> AppResult<Mode> {
        self.device()?.get_mode(self.index)
    }

    /// Change the mode.
    pub fn set_mode(&self, mode: Mode) -> AppResult<()> {
        self.device()?.set_mode(self.index, mode)
    }

    /// Drain up to `num_samples` readings of this channel.
    pub fn read(
        &self,
        num_samples: usize,
        timeout: ReadTimeout,
    ) -> AppResult<ReadResult<ChannelSample>> {
        self.device()?.read_channel(self.index, num_samples, timeout)
    }

    /// Queue values for playback.
    pub fn write(&self, data: &[f32], cyclic: bool) -> AppResult<WriteResult> {
        self.device()?.write(data, self.index, cyclic)
    }

    /// Acquire `n` samples on the device and return this channel's readings.
    pub fn get_samples(&self, n: usize) -> AppResult<Vec<ChannelSample>> {
        let samples = self.device()?.get_samples(n)?;
        Ok(samples.iter().map(|s| s.channel(self.index)).collect())
    }

    /// Blocking iterator over this channel's readings; ends when streaming stops.
    pub fn samples(&self) -> AppResult<ChannelSamples> {
        Ok(ChannelSamples {
            device: self.device()?,
            index: self.index,
        })
    }

    /// Hold a constant value.
    pub fn constant(&self, value: f32) -> AppResult<WriteResult> {
        self.write(&[value], true)
    }

    /// Play an arbitrary buffer, once or repeatedly.
    pub fn arbitrary(&self, buffer: &[f32], repeat: bool) -> AppResult<WriteResult> {
        self.write(buffer, repeat)
    }

    /// Square wave.
    pub fn square(
        &self,
        midpoint: f32,
        peak: f32,
        period: f64,
        phase: f64,
        duty_cycle: f64,
    ) -> AppResult<WriteResult> {
        self.periodic(WaveKind::Square { duty_cycle }, midpoint, peak, period, phase)
    }

    /// Sawtooth wave.
    pub fn sawtooth(&self, midpoint: f32, peak: f32, period: f64, phase: f64) -> AppResult<WriteResult> {
        self.periodic(WaveKind::Sawtooth, midpoint, peak, period, phase)
    }

    /// Stairstep wave.
    pub fn stairstep(&self, midpoint: f32, peak: f32, period: f64, phase: f64) -> AppResult<WriteResult> {
        self.periodic(WaveKind::Stairstep, midpoint, peak, period, phase)
    }

    /// Sine wave.
    pub fn sine(&self, midpoint: f32, peak: f32, period: f64, phase: f64) -> AppResult<WriteResult> {
        self.periodic(WaveKind::Sine, midpoint, peak, period, phase)
    }

    /// Triangle wave.
    pub fn triangle(&self, midpoint: f32, peak: f32, period: f64, phase: f64) -> AppResult<WriteResult> {
        self.periodic(WaveKind::Triangle, midpoint, peak, period, phase)
    }

    fn periodic(
        &self,
        kind: WaveKind,
        midpoint: f32,
        peak: f32,
        period: f64,
        phase: f64,
    ) -> AppResult<WriteResult> {
        let wave = Periodic::new(kind, midpoint, peak, period, phase)?;
        self.write(&wave.render(), true)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device.upgrade() {
            Some(device) => write!(f, "{}:{}", device.serial(), self.name()),
            None => write!(f, "?:{}", self.name()),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("device", &self.device.upgrade().map(|d| d.serial().to_string()))
            .finish()
    }
}

/// Blocking iterator over one channel's input queue.
pub struct ChannelSamples {
    device: Arc<Device>,
    index: usize,
}

impl Iterator for ChannelSamples {
    type Item = ChannelSample;

    fn next(&mut self) -> Option<ChannelSample> {
        self.device
            .read_channel(self.index, 1, ReadTimeout::Forever)
            .ok()?
            .samples
            .pop()
    }
}
