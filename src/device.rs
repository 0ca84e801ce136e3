//! Device handles and the per-device streaming engine.
//!
//! A [`Device`] wraps one physical instrument reached through a [`Transport`]. It
//! caches identity, per-channel modes and the calibration matrix, and owns one input
//! and one output [queue](crate::queue) per channel.
//!
//! # Streaming
//!
//! While a session runs, each active device has a dedicated worker thread that loops
//! over bulk transfers:
//!
//! 1. pull one transfer worth of set-points from each sourcing channel's output queue
//! 2. convert them to raw values with the source calibration
//! 3. exchange the transfer with the transport
//! 4. calibrate the returned readings and push them into the input queues
//!
//! The cancel flag is checked once per transfer, so cancellation never splits a
//! transfer and never discards samples that were already queued.
//!
//! # Control operations
//!
//! Mode changes, calibration writes, raw control transfers, LED updates and bootloader
//! requests are rejected with [`SmuError::InvalidState`] while the device streams. The
//! device's state mutex is held across the check and across stream start, so the two
//! can never interleave.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::calibration::Calibration;
use crate::channel::Channel;
use crate::error::{AppResult, SmuError};
use crate::queue::{self, InputQueue, OutputQueue, DEFAULT_QUEUE_SIZE};
use crate::sample::{
    channel_name, check_channel, ChannelSample, Mode, ReadResult, ReadTimeout, Sample, Signal,
    WriteResult, CHANNEL_COUNT,
};
use crate::transport::{
    ControlSetup, DeviceDescriptor, Transport, TransferRequest, TransportError, DIRECTION_IN,
    REQUEST_LED, REQUEST_MODE, REQUEST_SAMBA,
};

/// Samples exchanged per bulk transfer when nothing else is configured.
pub const DEFAULT_TRANSFER_SIZE: usize = 256;

/// Largest accepted LED mask (three LEDs).
pub const MAX_LED_MASK: u8 = 0b111;

/// Lifecycle of a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Discovered but not claimed by a session
    Available,
    /// Claimed by a session and open on the transport
    Active,
    /// Rebooted into the bootloader; the handle is spent
    Bootloader,
    /// Physically unplugged
    Detached,
    /// Explicitly destroyed by its session
    Destroyed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Available => "available",
            Self::Active => "active",
            Self::Bootloader => "bootloader",
            Self::Detached => "detached",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Streaming parameters pushed down by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Sample rate in Hz, 0 selects the device default
    pub sample_rate: u32,
    /// Capacity of every per-channel queue
    pub queue_size: usize,
    /// Frames per bulk transfer
    pub transfer_size: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            sample_rate: 0,
            queue_size: DEFAULT_QUEUE_SIZE,
            transfer_size: DEFAULT_TRANSFER_SIZE,
        }
    }
}

/// How a device's streaming worker finished.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The requested number of samples was produced
    Completed {
        /// Samples produced per channel
        samples: u64,
    },
    /// The cancel flag was observed
    Cancelled {
        /// Samples produced per channel before stopping
        samples: u64,
    },
    /// The device disappeared mid-stream
    Detached {
        /// Samples produced per channel before the detach
        samples: u64,
    },
    /// A transfer failed
    Failed(SmuError),
}

impl StreamOutcome {
    /// Samples produced per channel.
    pub fn samples(&self) -> u64 {
        match self {
            Self::Completed { samples } | Self::Cancelled { samples } | Self::Detached { samples } => {
                *samples
            }
            Self::Failed(_) => 0,
        }
    }
}

/// Hook run on the worker thread once streaming stops.
pub(crate) type StreamExit = Arc<dyn Fn(&Device, &StreamOutcome) + Send + Sync>;

/// Response of a raw control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Bytes sent for a host-to-device request
    Out(usize),
    /// Payload received for a device-to-host request
    In(Vec<u8>),
}

struct StreamHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<StreamOutcome>,
}

struct StreamPlan {
    samples: u64,
    sample_rate: u32,
    transfer_size: usize,
    modes: [Mode; CHANNEL_COUNT],
    calibration: Calibration,
}

struct DeviceInner {
    state: DeviceState,
    owner: Option<u64>,
    modes: [Mode; CHANNEL_COUNT],
    calibration: Option<Calibration>,
    settings: StreamSettings,
    stream: Option<StreamHandle>,
    streaming: bool,
}

/// Handle for one physical two-channel instrument.
pub struct Device {
    descriptor: DeviceDescriptor,
    transport: Arc<dyn Transport>,
    control_timeout: Duration,
    inner: Mutex<DeviceInner>,
    inputs: [InputQueue; CHANNEL_COUNT],
    outputs: [OutputQueue; CHANNEL_COUNT],
    next_index: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl Device {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        transport: Arc<dyn Transport>,
        control_timeout: Duration,
    ) -> Self {
        let state = if descriptor.bootloader {
            DeviceState::Bootloader
        } else {
            DeviceState::Available
        };
        let capacity = DEFAULT_QUEUE_SIZE;
        Self {
            descriptor,
            transport,
            control_timeout,
            inner: Mutex::new(DeviceInner {
                state,
                owner: None,
                modes: [Mode::HiZ; CHANNEL_COUNT],
                calibration: None,
                settings: StreamSettings::default(),
                stream: None,
                streaming: false,
            }),
            inputs: [InputQueue::new(capacity), InputQueue::new(capacity)],
            outputs: [OutputQueue::new(capacity), OutputQueue::new(capacity)],
            next_index: AtomicU64::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Serial number.
    pub fn serial(&self) -> &str {
        &self.descriptor.serial
    }

    /// Firmware revision.
    pub fn firmware_version(&self) -> &str {
        &self.descriptor.firmware_version
    }

    /// Hardware revision.
    pub fn hardware_version(&self) -> &str {
        &self.descriptor.hardware_version
    }

    /// Native sample rate in Hz.
    pub fn default_sample_rate(&self) -> u32 {
        self.descriptor.default_sample_rate
    }

    /// Descriptor the handle was created from.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Whether the device is running its bootloader.
    pub fn is_bootloader(&self) -> bool {
        self.state() == DeviceState::Bootloader
    }

    /// Whether the streaming worker is running.
    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    /// Identifier of the owning session, if any.
    pub fn owner(&self) -> Option<u64> {
        self.inner.lock().owner
    }

    /// View of one channel.
    pub fn channel(self: &Arc<Self>, channel: usize) -> AppResult<Channel> {
        let channel = check_channel(channel)?;
        Ok(Channel::new(Arc::downgrade(self), channel))
    }

    /// Views of both channels, A first.
    pub fn channels(self: &Arc<Self>) -> [Channel; CHANNEL_COUNT] {
        let weak: Weak<Self> = Arc::downgrade(self);
        [Channel::new(weak.clone(), 0), Channel::new(weak, 1)]
    }

    /// Mode of a channel.
    pub fn get_mode(&self, channel: usize) -> AppResult<Mode> {
        let channel = check_channel(channel)?;
        Ok(self.inner.lock().modes[channel])
    }

    /// Change the mode of a channel.
    ///
    /// Switching to a different mode discards the channel's pending output, since the
    /// queued values were meant for the other signal.
    pub fn set_mode(&self, channel: usize, mode: Mode) -> AppResult<()> {
        let channel = check_channel(channel)?;
        let mut inner = self.inner.lock();
        self.ensure_configurable(&inner, "change mode")?;

        let setup = ControlSetup::vendor_out(REQUEST_MODE, channel as u16, u16::from(mode.to_raw()));
        self.transport
            .control_transfer(self.serial(), setup, &mut [], self.control_timeout)?;

        if inner.modes[channel] != mode {
            self.outputs[channel].clear();
        }
        inner.modes[channel] = mode;
        debug!(serial = %self.serial(), channel = %channel_name(channel), %mode, "Mode set");
        Ok(())
    }

    /// Calibration matrix from the device's persistent storage.
    pub fn calibration(&self) -> AppResult<Calibration> {
        let mut inner = self.inner.lock();
        if let Some(calibration) = inner.calibration {
            return Ok(calibration);
        }
        self.ensure_present(&inner)?;
        let calibration = self.transport.read_calibration(self.serial()).map_err(|e| {
            SmuError::Calibration(format!("cannot read calibration from {}: {e}", self.serial()))
        })?;
        inner.calibration = Some(calibration);
        Ok(calibration)
    }

    /// Store calibration coefficients from a file, or factory defaults when `path` is
    /// `None`.
    pub fn write_calibration(&self, path: Option<&Path>) -> AppResult<()> {
        let calibration = match path {
            Some(path) => Calibration::from_file(path)?,
            None => Calibration::identity(),
        };

        let mut inner = self.inner.lock();
        self.ensure_configurable(&inner, "write calibration")?;
        self.transport
            .write_calibration(self.serial(), &calibration)
            .map_err(|e| {
                SmuError::Calibration(format!("cannot store calibration on {}: {e}", self.serial()))
            })?;
        inner.calibration = Some(calibration);
        info!(
            serial = %self.serial(),
            factory = calibration.is_factory(),
            "Calibration written"
        );
        Ok(())
    }

    /// Raw control transfer.
    ///
    /// For device-to-host requests (bit 7 of `request_type` set) a buffer of `length`
    /// bytes is received and returned. Otherwise `data` is sent and the number of bytes
    /// transferred is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn ctrl_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        length: u16,
        timeout_ms: u32,
    ) -> AppResult<ControlResponse> {
        let inner = self.inner.lock();
        self.ensure_configurable(&inner, "issue control transfers")?;

        let setup = ControlSetup {
            request_type,
            request,
            value,
            index,
        };
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        if request_type & DIRECTION_IN == DIRECTION_IN {
            let mut buffer = vec![0u8; usize::from(length)];
            let received = self
                .transport
                .control_transfer(self.serial(), setup, &mut buffer, timeout)?;
            buffer.truncate(received);
            Ok(ControlResponse::In(buffer))
        } else {
            let mut payload = data.to_vec();
            let sent = self
                .transport
                .control_transfer(self.serial(), setup, &mut payload, timeout)?;
            Ok(ControlResponse::Out(sent))
        }
    }

    /// Light the LEDs selected by a 3-bit mask.
    pub fn set_led(&self, mask: u8) -> AppResult<()> {
        if mask > MAX_LED_MASK {
            return Err(SmuError::InvalidArgument(format!(
                "invalid LED mask {mask}: expected 0..={MAX_LED_MASK}"
            )));
        }
        self.ctrl_transfer(
            crate::transport::REQUEST_TYPE_VENDOR_OUT,
            REQUEST_LED,
            u16::from(mask),
            0,
            &[],
            0,
            self.control_timeout_ms(),
        )?;
        Ok(())
    }

    /// Reboot into the bootloader. The handle is unusable afterwards.
    pub fn samba_mode(&self) -> AppResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_configurable(&inner, "enter the bootloader")?;

        let setup = ControlSetup::vendor_out(REQUEST_SAMBA, 0, 0);
        self.transport
            .control_transfer(self.serial(), setup, &mut [], self.control_timeout)?;

        inner.state = DeviceState::Bootloader;
        self.transport.release(self.serial());
        self.close_inputs();
        info!(serial = %self.serial(), "Device rebooting into bootloader");
        Ok(())
    }

    /// Drain up to `num_samples` synchronized samples.
    ///
    /// Samples are collected as they arrive, so a blocking read may ask for more than
    /// the queue holds. `dropped` counts samples lost to input overflow since the
    /// previous read. A transfer failure surfaces as [`SmuError::DeviceIo`] once every
    /// sample produced before it has been read.
    pub fn read(&self, num_samples: usize, timeout: ReadTimeout) -> AppResult<ReadResult<Sample>> {
        self.ensure_readable()?;

        let deadline = queue::deadline(timeout);
        let mut result = ReadResult {
            samples: Vec::with_capacity(num_samples.min(DEFAULT_QUEUE_SIZE)),
            dropped: 0,
        };
        loop {
            let remaining = num_samples - result.len();
            let mut ready = true;
            for input in &self.inputs {
                let wanted = remaining.min(input.capacity());
                ready &= input.wait_until(wanted, deadline, timeout);
            }

            let batch = self.drain_aligned(remaining);
            result.dropped += batch.dropped;
            result.samples.extend(batch.samples);
            if result.len() >= num_samples || !ready || timeout == ReadTimeout::NonBlocking {
                break;
            }
        }

        self.finish_read(num_samples, &mut result)?;
        Ok(result)
    }

    fn drain_aligned(&self, num_samples: usize) -> ReadResult<Sample> {
        let [a, b] = &self.inputs;
        a.with_state(|a| {
            b.with_state(|b| {
                // Channel reads may have consumed one side; realign on the index.
                let mut skipped = 0u64;
                while let (Some(ia), Some(ib)) = (a.front_index(), b.front_index()) {
                    if ia == ib {
                        break;
                    }
                    if ia < ib {
                        a.pop_front();
                    } else {
                        b.pop_front();
                    }
                    skipped += 1;
                }

                let take = num_samples.min(a.len()).min(b.len());
                let mut samples = Vec::with_capacity(take);
                for _ in 0..take {
                    if let (Some(sa), Some(sb)) = (a.pop_front(), b.pop_front()) {
                        samples.push(Sample::from_channels(sa, sb));
                    }
                }
                let dropped = a.take_dropped().max(b.take_dropped()) + skipped;
                ReadResult { samples, dropped }
            })
        })
    }

    pub(crate) fn read_channel(
        &self,
        channel: usize,
        num_samples: usize,
        timeout: ReadTimeout,
    ) -> AppResult<ReadResult<ChannelSample>> {
        let channel = check_channel(channel)?;
        self.ensure_readable()?;
        let mut result = self.inputs[channel].read(num_samples, timeout);
        self.finish_read(num_samples, &mut result)?;
        Ok(result)
    }

    fn finish_read<T>(&self, requested: usize, result: &mut ReadResult<T>) -> AppResult<()> {
        if result.dropped > 0 {
            warn!(
                serial = %self.serial(),
                dropped = result.dropped,
                "Input queue overflow, samples dropped"
            );
        }
        if requested > 0 && result.is_empty() {
            if let Some(fault) = self.fault.lock().take() {
                return Err(SmuError::DeviceIo(fault));
            }
        }
        Ok(())
    }

    /// Queue values for playback on a channel.
    ///
    /// Values are clamped to the range of the signal the channel sources. With `cyclic`
    /// the buffer is replayed indefinitely; otherwise the last value is held once the
    /// data runs out.
    pub fn write(&self, data: &[f32], channel: usize, cyclic: bool) -> AppResult<WriteResult> {
        let channel = check_channel(channel)?;
        let mode = {
            let inner = self.inner.lock();
            self.ensure_present(&inner)?;
            inner.modes[channel]
        };
        let Some(signal) = mode.sourced_signal() else {
            return Err(SmuError::InvalidState(format!(
                "channel {} of {} is in {mode} mode and cannot source",
                channel_name(channel),
                self.serial()
            )));
        };

        let clamped: Vec<f32> = data.iter().map(|&v| signal.clamp(v)).collect();
        let result = self.outputs[channel].write(&clamped, cyclic);
        if result.dropped > 0 {
            warn!(
                serial = %self.serial(),
                channel = %channel_name(channel),
                dropped = result.dropped,
                "Output queue overflow, oldest values dropped"
            );
        }
        trace!(serial = %self.serial(), channel, queued = result.queued, cyclic, "Output queued");
        Ok(result)
    }

    /// Run a finite acquisition of `n` samples on this device alone and return them.
    pub fn get_samples(self: &Arc<Self>, n: usize) -> AppResult<Vec<Sample>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let settings = self.inner.lock().settings;
        let settings = StreamSettings {
            queue_size: settings.queue_size.max(n),
            ..settings
        };
        self.start_stream(n as u64, settings, None)?;

        let result = self.read(n, ReadTimeout::Forever);
        let outcome = self.join_stream();
        let result = result?;
        if let Some(StreamOutcome::Failed(err)) = outcome {
            return Err(err);
        }
        Ok(result.samples)
    }

    /// Blocking iterator over synchronized samples; ends when streaming stops.
    pub fn samples(self: &Arc<Self>) -> Samples {
        Samples {
            device: Arc::clone(self),
            buffer: Vec::new().into_iter(),
        }
    }

    pub(crate) fn control_timeout_ms(&self) -> u32 {
        u32::try_from(self.control_timeout.as_millis()).unwrap_or(u32::MAX)
    }

    pub(crate) fn apply_settings(&self, settings: StreamSettings) {
        self.inner.lock().settings = settings;
    }

    /// Claim the device for `owner` and open it on the transport.
    pub(crate) fn open(&self, owner: u64, settings: StreamSettings) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let add_error = |message: String| SmuError::DeviceAdd {
            serial: self.serial().to_string(),
            message,
        };
        match (inner.state, inner.owner) {
            (DeviceState::Active, Some(current)) if current == owner => {
                return Err(add_error("already active in this session".to_string()))
            }
            (DeviceState::Active, _) => {
                return Err(add_error("owned by another session".to_string()))
            }
            (DeviceState::Available, _) => {}
            (state, _) => return Err(add_error(format!("device is {state}"))),
        }

        self.transport
            .open(self.serial())
            .map_err(|e| add_error(format!("transport refused to open: {e}")))?;

        match self.transport.read_calibration(self.serial()) {
            Ok(calibration) => inner.calibration = Some(calibration),
            Err(e) => {
                warn!(serial = %self.serial(), error = %e, "Calibration unavailable, using factory defaults");
                inner.calibration = Some(Calibration::identity());
            }
        }
        inner.state = DeviceState::Active;
        inner.owner = Some(owner);
        inner.modes = [Mode::HiZ; CHANNEL_COUNT];
        inner.settings = settings;
        for output in &self.outputs {
            output.clear();
            output.set_capacity(settings.queue_size);
        }
        info!(serial = %self.serial(), owner, "Device opened");
        Ok(())
    }

    /// Stop streaming and give the device back.
    ///
    /// With `detached` the transport's resources are dropped without talking to the
    /// device, which has already gone away.
    pub(crate) fn release(&self, detached: bool) -> AppResult<()> {
        self.cancel_stream();

        let mut inner = self.inner.lock();
        if detached {
            self.transport.release(self.serial());
            if inner.state != DeviceState::Bootloader {
                inner.state = DeviceState::Detached;
            }
        } else if inner.state == DeviceState::Active {
            self.transport
                .close(self.serial())
                .map_err(|e| SmuError::DeviceRemove {
                    serial: self.serial().to_string(),
                    message: format!("transport refused to close: {e}"),
                })?;
            inner.state = DeviceState::Available;
        }
        inner.owner = None;
        inner.modes = [Mode::HiZ; CHANNEL_COUNT];
        drop(inner);

        self.close_inputs();
        for output in &self.outputs {
            output.clear();
        }
        debug!(serial = %self.serial(), detached, "Device released");
        Ok(())
    }

    /// Release and mark the handle as destroyed.
    pub(crate) fn destroy(&self) -> AppResult<()> {
        let result = if self.state() == DeviceState::Active {
            self.release(false)
        } else {
            self.cancel_stream();
            Ok(())
        };
        self.inner.lock().state = DeviceState::Destroyed;
        result
    }

    /// Spawn the streaming worker.
    ///
    /// `samples == 0` streams until cancelled.
    pub(crate) fn start_stream(
        self: &Arc<Self>,
        samples: u64,
        settings: StreamSettings,
        on_exit: Option<StreamExit>,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != DeviceState::Active {
            return Err(SmuError::InvalidState(format!(
                "cannot stream from {}: device is {}",
                self.serial(),
                inner.state
            )));
        }
        if inner.streaming {
            return Err(SmuError::InvalidState(format!(
                "{} is already streaming",
                self.serial()
            )));
        }
        // Reap a worker that finished on its own.
        if let Some(previous) = inner.stream.take() {
            if previous.thread.join().is_err() {
                error!(serial = %self.serial(), "Previous streaming worker panicked");
            }
        }

        let calibration = inner.calibration.unwrap_or_default();
        let plan = StreamPlan {
            samples,
            sample_rate: if settings.sample_rate == 0 {
                self.default_sample_rate()
            } else {
                settings.sample_rate
            },
            transfer_size: settings.transfer_size.max(1),
            modes: inner.modes,
            calibration,
        };
        let sample_rate = plan.sample_rate;

        for input in &self.inputs {
            input.reset(settings.queue_size);
        }
        for output in &self.outputs {
            output.set_capacity(settings.queue_size);
        }
        *self.fault.lock() = None;

        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Arc::clone(self);
        let flag = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name(format!("smu-stream-{}", self.serial()))
            .spawn(move || worker.stream_loop(plan, flag, on_exit))
            .map_err(|e| {
                self.close_inputs();
                SmuError::Stream(format!("cannot spawn worker for {}: {e}", self.serial()))
            })?;

        inner.stream = Some(StreamHandle { cancel, thread });
        inner.streaming = true;
        info!(
            serial = %self.serial(),
            samples,
            sample_rate,
            queue_size = settings.queue_size,
            "Streaming started"
        );
        Ok(())
    }

    /// Signal the worker to stop and wait for it.
    pub(crate) fn cancel_stream(&self) -> Option<StreamOutcome> {
        let handle = self.inner.lock().stream.take()?;
        handle.cancel.store(true, Ordering::SeqCst);
        Self::join_handle(self.serial(), handle)
    }

    /// Wait for the worker to finish on its own.
    pub(crate) fn join_stream(&self) -> Option<StreamOutcome> {
        let handle = self.inner.lock().stream.take()?;
        Self::join_handle(self.serial(), handle)
    }

    fn join_handle(serial: &str, handle: StreamHandle) -> Option<StreamOutcome> {
        match handle.thread.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                error!(serial, "Streaming worker panicked");
                Some(StreamOutcome::Failed(SmuError::Stream(format!(
                    "streaming worker for {serial} panicked"
                ))))
            }
        }
    }

    fn stream_loop(
        self: Arc<Self>,
        plan: StreamPlan,
        cancel: Arc<AtomicBool>,
        on_exit: Option<StreamExit>,
    ) -> StreamOutcome {
        let serial = self.serial().to_string();
        let mut produced = 0u64;

        let outcome = loop {
            if cancel.load(Ordering::SeqCst) {
                break StreamOutcome::Cancelled { samples: produced };
            }
            let remaining = if plan.samples == 0 {
                plan.transfer_size as u64
            } else {
                plan.samples.saturating_sub(produced)
            };
            if remaining == 0 {
                break StreamOutcome::Completed { samples: produced };
            }
            let frames = remaining.min(plan.transfer_size as u64) as usize;

            let request = self.build_request(&plan, frames);
            let raw = match self.transport.transfer(&serial, &request) {
                Ok(raw) if raw.is_empty() => {
                    break StreamOutcome::Failed(SmuError::DeviceIo(format!(
                        "empty transfer from {serial}"
                    )));
                }
                Ok(mut raw) => {
                    raw.truncate(frames);
                    raw
                }
                Err(TransportError::NoDevice) => {
                    warn!(serial = %serial, produced, "Device vanished while streaming");
                    break StreamOutcome::Detached { samples: produced };
                }
                Err(e) => {
                    error!(serial = %serial, error = %e, produced, "Transfer failed");
                    break StreamOutcome::Failed(SmuError::DeviceIo(format!(
                        "transfer failed on {serial}: {e}"
                    )));
                }
            };

            let base = self.next_index.fetch_add(raw.len() as u64, Ordering::SeqCst);
            for channel in 0..CHANNEL_COUNT {
                let batch: Vec<ChannelSample> = raw
                    .iter()
                    .enumerate()
                    .map(|(offset, frame)| {
                        let (current, voltage) = frame[channel];
                        ChannelSample {
                            index: base + offset as u64,
                            current: plan.calibration.measure(channel, Signal::Current, current),
                            voltage: plan.calibration.measure(channel, Signal::Voltage, voltage),
                        }
                    })
                    .collect();
                let evicted = self.inputs[channel].push_batch(&batch);
                if evicted > 0 {
                    trace!(serial = %serial, channel, evicted, "Input queue full");
                }
            }
            produced += raw.len() as u64;
            trace!(serial = %serial, frames = raw.len(), produced, "Transfer complete");
        };

        if let StreamOutcome::Failed(err) = &outcome {
            *self.fault.lock() = Some(err.to_string());
        }
        self.close_inputs();
        {
            let mut inner = self.inner.lock();
            inner.streaming = false;
            if matches!(outcome, StreamOutcome::Detached { .. })
                && matches!(inner.state, DeviceState::Available | DeviceState::Active)
            {
                inner.state = DeviceState::Detached;
            }
        }
        info!(serial = %serial, samples = outcome.samples(), outcome = ?outcome, "Streaming stopped");

        if let Some(on_exit) = on_exit {
            on_exit(&*self, &outcome);
        }
        outcome
    }

    fn build_request(&self, plan: &StreamPlan, frames: usize) -> TransferRequest {
        let mut sources: [Vec<f32>; CHANNEL_COUNT] = Default::default();
        for (channel, source) in sources.iter_mut().enumerate() {
            *source = match plan.modes[channel].sourced_signal() {
                Some(signal) => self.outputs[channel]
                    .next_values(frames)
                    .into_iter()
                    .map(|value| plan.calibration.source(channel, signal, value))
                    .collect(),
                None => vec![0.0; frames],
            };
        }
        TransferRequest {
            sample_rate: plan.sample_rate,
            modes: plan.modes,
            sources,
        }
    }

    fn close_inputs(&self) {
        for input in &self.inputs {
            input.close();
        }
    }

    fn ensure_present(&self, inner: &DeviceInner) -> AppResult<()> {
        match inner.state {
            DeviceState::Available | DeviceState::Active => Ok(()),
            state => Err(SmuError::InvalidState(format!(
                "{} is {state}",
                self.serial()
            ))),
        }
    }

    fn ensure_readable(&self) -> AppResult<()> {
        match self.state() {
            DeviceState::Destroyed | DeviceState::Bootloader => Err(SmuError::InvalidState(
                format!("{} is {}", self.serial(), self.state()),
            )),
            _ => Ok(()),
        }
    }

    fn ensure_configurable(&self, inner: &DeviceInner, action: &str) -> AppResult<()> {
        if inner.state != DeviceState::Active {
            return Err(SmuError::InvalidState(format!(
                "cannot {action} on {}: device is {}",
                self.serial(),
                inner.state
            )));
        }
        if inner.streaming {
            return Err(SmuError::InvalidState(format!(
                "cannot {action} on {} while streaming",
                self.serial()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.serial())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Device")
            .field("serial", &self.descriptor.serial)
            .field("firmware_version", &self.descriptor.firmware_version)
            .field("hardware_version", &self.descriptor.hardware_version)
            .field("state", &inner.state)
            .field("modes", &inner.modes)
            .finish()
    }
}

/// Blocking iterator over a device's input queues.
pub struct Samples {
    device: Arc<Device>,
    buffer: std::vec::IntoIter<Sample>,
}

/// Samples drained from the queues per refill.
const ITER_BATCH: usize = 256;

impl Iterator for Samples {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if let Some(sample) = self.buffer.next() {
            return Some(sample);
        }
        // Wait for the first sample, then take whatever else is ready.
        let first = self.device.read(1, ReadTimeout::Forever).ok()?;
        if first.is_empty() {
            return None;
        }
        let rest = self
            .device
            .read(ITER_BATCH - 1, ReadTimeout::NonBlocking)
            .map(|r| r.samples)
            .unwrap_or_default();
        let mut batch = first.samples;
        batch.extend(rest);
        self.buffer = batch.into_iter();
        self.buffer.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Coefficients;
    use crate::transport::sim::{default_serial, SimDevice, SimulatedTransport};
    use tracing_test::traced_test;

    fn active_device() -> (Arc<SimulatedTransport>, Arc<Device>) {
        let transport = Arc::new(SimulatedTransport::with_devices(1));
        let descriptor = transport.enumerate().unwrap().remove(0);
        let device = Arc::new(Device::new(
            descriptor,
            transport.clone() as Arc<dyn Transport>,
            Duration::from_millis(100),
        ));
        device.open(1, StreamSettings::default()).unwrap();
        (transport, device)
    }

    #[test]
    fn test_set_mode_programs_transport() {
        let (transport, device) = active_device();
        device.set_mode(1, Mode::Simv).unwrap();
        assert_eq!(device.get_mode(1).unwrap(), Mode::Simv);
        assert_eq!(transport.mode(device.serial(), 1), Some(Mode::Simv));
        assert!(matches!(
            device.set_mode(2, Mode::Svmi),
            Err(SmuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_rejected_in_hi_z() {
        let (_transport, device) = active_device();
        let err = device.write(&[1.0], 0, false).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_get_samples_sources_written_values() {
        let (_transport, device) = active_device();
        device.set_mode(0, Mode::Svmi).unwrap();
        device.write(&[1.0, 2.0, 3.0], 0, true).unwrap();

        let samples = device.get_samples(6).unwrap();
        let voltages: Vec<f32> = samples.iter().map(|s| s.a.1).collect();
        assert_eq!(voltages, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        // Channel B floats
        assert!(samples.iter().all(|s| s.b == (0.0, 0.0)));
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_measure_calibration_applied() {
        let transport = Arc::new(SimulatedTransport::new());
        let mut calibration = Calibration::identity();
        calibration.a.voltage.measure = Coefficients::linear(1.0, 0.5);
        transport.plug(SimDevice::new("CAL1").calibration(calibration));
        let descriptor = transport.enumerate().unwrap().remove(0);
        let device = Arc::new(Device::new(
            descriptor,
            transport as Arc<dyn Transport>,
            Duration::from_millis(100),
        ));
        device.open(1, StreamSettings::default()).unwrap();
        device.set_mode(0, Mode::Svmi).unwrap();
        device.write(&[2.0], 0, false).unwrap();

        let samples = device.get_samples(2).unwrap();
        assert_eq!(samples[0].a.1, 2.5);
    }

    #[test]
    fn test_led_mask_validation() {
        let (transport, device) = active_device();
        device.set_led(0b101).unwrap();
        assert_eq!(transport.led(device.serial()), Some(0b101));
        assert!(matches!(
            device.set_led(8),
            Err(SmuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_transfer_failure_surfaces_as_device_io() {
        let (transport, device) = active_device();
        transport.fail_transfers_after(&default_serial(0), 0, TransportError::Io);
        let err = device.get_samples(10).unwrap_err();
        assert!(matches!(err, SmuError::DeviceIo(_)));
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_samba_mode_spends_handle() {
        let (_transport, device) = active_device();
        device.samba_mode().unwrap();
        assert_eq!(device.state(), DeviceState::Bootloader);
        assert!(device.set_mode(0, Mode::Svmi).unwrap_err().is_invalid_state());
        assert!(device.read(1, ReadTimeout::NonBlocking).is_err());
    }

    #[test]
    #[traced_test]
    fn test_overflow_logged_on_read() {
        let (_transport, device) = active_device();
        let settings = StreamSettings {
            queue_size: 10,
            ..StreamSettings::default()
        };
        device.start_stream(30, settings, None).unwrap();
        device.join_stream();

        let result = device.read(10, ReadTimeout::NonBlocking).unwrap();
        assert_eq!(result.len(), 10);
        assert_eq!(result.dropped, 20);
        assert_eq!(result.samples[0].index, 20);
        assert!(logs_contain("samples dropped"));
    }

    #[test]
    #[traced_test]
    fn test_stream_log_reports_effective_rate() {
        let (_transport, device) = active_device();
        device.start_stream(10, StreamSettings::default(), None).unwrap();
        device.join_stream();
        assert!(logs_contain("sample_rate=100000"));
    }

    #[test]
    fn test_ctrl_transfer_in_returns_payload() {
        let (_transport, device) = active_device();
        let response = device
            .ctrl_transfer(
                crate::transport::REQUEST_TYPE_VENDOR_IN,
                crate::transport::sim::REQUEST_FIRMWARE_VERSION,
                0,
                0,
                &[],
                16,
                100,
            )
            .unwrap();
        assert_eq!(response, ControlResponse::In(b"2.17".to_vec()));

        let err = device
            .ctrl_transfer(crate::transport::REQUEST_TYPE_VENDOR_OUT, 0x7F, 0, 0, &[], 0, 100)
            .unwrap_err();
        assert_eq!(err.transport_code(), Some(-9));
    }

    #[test]
    fn test_release_returns_to_available() {
        let (transport, device) = active_device();
        device.release(false).unwrap();
        assert_eq!(device.state(), DeviceState::Available);
        assert!(!transport.is_open(device.serial()));
        assert_eq!(device.owner(), None);
    }
}
