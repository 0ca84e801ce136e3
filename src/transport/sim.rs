//! Simulated transport for running the engine without hardware.
//!
//! Each simulated device behaves like a two-channel SMU wired to a resistive load to
//! ground:
//!
//! - `SVMI`: the sourced voltage appears on the channel, the current is `v / R`.
//! - `SIMV`: the sourced current flows through the load, the voltage is `i * R`.
//! - `HI_Z`: the channel floats and reads zero.
//!
//! Both readings are clamped to the physical signal ranges. Hotplug notifications are
//! delivered on a dedicated notifier thread, the way a USB stack delivers them from its
//! event thread, so handlers may call back into the engine freely.
//!
//! Two timing modes are available:
//!
//! - **Instant**: transfers complete immediately (unit and integration tests)
//! - **Realtime**: transfers are paced at the requested sample rate (CLI)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use super::{
    ControlSetup, DeviceDescriptor, HotplugEvent, HotplugHandler, HotplugToken, RawFrame, Transport,
    TransferRequest, TransportError, REQUEST_LED, REQUEST_MODE, REQUEST_SAMBA,
};
use crate::calibration::Calibration;
use crate::sample::{Mode, Signal, CHANNEL_COUNT};

/// Native sample rate of the simulated hardware.
pub const SIM_SAMPLE_RATE: u32 = 100_000;

/// Default load resistor in ohms.
pub const DEFAULT_LOAD_OHMS: f32 = 1_000.0;

/// Vendor request returning the firmware version string.
pub const REQUEST_FIRMWARE_VERSION: u8 = 0x00;

/// Transfer pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimTiming {
    /// Transfers complete immediately
    #[default]
    Instant,
    /// Transfers take as long as the frames would at the requested rate
    Realtime,
}

/// Configuration of one simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    serial: String,
    firmware_version: String,
    hardware_version: String,
    sample_rate: u32,
    load_ohms: f32,
    noise: f32,
    calibration: Calibration,
}

impl SimDevice {
    /// A device with the given serial and stock identity.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            firmware_version: "2.17".to_string(),
            hardware_version: "F".to_string(),
            sample_rate: SIM_SAMPLE_RATE,
            load_ohms: DEFAULT_LOAD_OHMS,
            noise: 0.0,
            calibration: Calibration::identity(),
        }
    }

    /// Set the firmware revision.
    pub fn firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = version.into();
        self
    }

    /// Set the hardware revision.
    pub fn hardware(mut self, version: impl Into<String>) -> Self {
        self.hardware_version = version.into();
        self
    }

    /// Set the native sample rate.
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the load resistor seen by both channels.
    pub fn load_ohms(mut self, ohms: f32) -> Self {
        self.load_ohms = ohms;
        self
    }

    /// Add uniform noise of this amplitude to measured signals.
    pub fn noise(mut self, amplitude: f32) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Preload the calibration block.
    pub fn calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }
}

#[derive(Debug)]
struct SimState {
    config: SimDevice,
    attached: bool,
    open: bool,
    bootloader: bool,
    modes: [Mode; CHANNEL_COUNT],
    led: u8,
    transfers: u64,
    fail_after: Option<(u64, TransportError)>,
}

impl SimState {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            serial: self.config.serial.clone(),
            firmware_version: self.config.firmware_version.clone(),
            hardware_version: self.config.hardware_version.clone(),
            default_sample_rate: self.config.sample_rate,
            bootloader: self.bootloader,
        }
    }

    fn check_attached(&self) -> Result<(), TransportError> {
        if self.attached {
            Ok(())
        } else {
            Err(TransportError::NoDevice)
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        self.check_attached()?;
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Access)
        }
    }
}

enum Notice {
    Event(HotplugEvent),
    Flush(mpsc::Sender<()>),
}

/// In-process transport backed by simulated devices.
pub struct SimulatedTransport {
    devices: Mutex<Vec<SimState>>,
    handlers: Arc<RwLock<Vec<(HotplugToken, HotplugHandler)>>>,
    next_token: AtomicU64,
    notices: Mutex<mpsc::Sender<Notice>>,
    rng: Mutex<StdRng>,
    timing: SimTiming,
}

impl SimulatedTransport {
    /// An empty bus with instant timing.
    pub fn new() -> Self {
        Self::with_timing(SimTiming::Instant)
    }

    /// An empty bus with the given timing.
    pub fn with_timing(timing: SimTiming) -> Self {
        let handlers: Arc<RwLock<Vec<(HotplugToken, HotplugHandler)>>> =
            Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<Notice>();

        let subscribers = Arc::clone(&handlers);
        let spawned = thread::Builder::new()
            .name("sim-hotplug".to_string())
            .spawn(move || {
                for notice in rx {
                    match notice {
                        Notice::Event(event) => {
                            // Snapshot so handlers may (un)subscribe while running.
                            let current: Vec<HotplugHandler> =
                                subscribers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
                            for handler in current {
                                handler(event.clone());
                            }
                        }
                        Notice::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn hotplug notifier, events will be lost");
        }

        Self {
            devices: Mutex::new(Vec::new()),
            handlers,
            next_token: AtomicU64::new(1),
            notices: Mutex::new(tx),
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
            timing,
        }
    }

    /// A bus with `count` stock devices already attached.
    pub fn with_devices(count: usize) -> Self {
        let transport = Self::new();
        for i in 0..count {
            transport.plug(SimDevice::new(default_serial(i)));
        }
        transport
    }

    /// Attach a device without raising a hotplug event (present at power-up).
    pub fn plug(&self, device: SimDevice) {
        let mut devices = self.devices.lock();
        devices.retain(|d| d.config.serial != device.serial);
        devices.push(SimState {
            config: device,
            attached: true,
            open: false,
            bootloader: false,
            modes: [Mode::HiZ; CHANNEL_COUNT],
            led: 0,
            transfers: 0,
            fail_after: None,
        });
    }

    /// Attach a device and notify the hotplug handler.
    pub fn attach(&self, device: SimDevice) {
        let serial = device.serial.clone();
        self.plug(device);
        let descriptor = self.with_device(&serial, |d| Ok(d.descriptor()));
        if let Ok(descriptor) = descriptor {
            info!(serial = %serial, "Simulated device attached");
            self.notify(HotplugEvent::Attached(descriptor));
        }
    }

    /// Unplug a device and notify the hotplug handler.
    pub fn detach(&self, serial: &str) {
        let found = {
            let mut devices = self.devices.lock();
            let before = devices.len();
            devices.retain(|d| d.config.serial != serial);
            devices.len() != before
        };
        if found {
            info!(serial = %serial, "Simulated device detached");
            self.notify(HotplugEvent::Detached(serial.to_string()));
        }
    }

    /// Make streaming transfers fail with `error` after `count` more succeed.
    pub fn fail_transfers_after(&self, serial: &str, count: u64, error: TransportError) {
        let _ = self.with_device(serial, |d| {
            d.fail_after = Some((d.transfers + count, error));
            Ok(())
        });
    }

    /// Block until every hotplug event raised so far has been delivered.
    pub fn wait_idle(&self) {
        let (tx, rx) = mpsc::channel();
        if self.notices.lock().send(Notice::Flush(tx)).is_ok() {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        }
    }

    /// Current LED mask of a device.
    pub fn led(&self, serial: &str) -> Option<u8> {
        self.with_device(serial, |d| Ok(d.led)).ok()
    }

    /// Mode last programmed into a channel.
    pub fn mode(&self, serial: &str, channel: usize) -> Option<Mode> {
        self.with_device(serial, |d| Ok(d.modes.get(channel).copied()))
            .ok()
            .flatten()
    }

    /// Calibration block currently stored on a device.
    pub fn stored_calibration(&self, serial: &str) -> Option<Calibration> {
        self.with_device(serial, |d| Ok(d.config.calibration)).ok()
    }

    /// Whether a device is claimed.
    pub fn is_open(&self, serial: &str) -> bool {
        self.with_device(serial, |d| Ok(d.open)).unwrap_or(false)
    }

    /// Number of bulk transfers completed by a device.
    pub fn transfer_count(&self, serial: &str) -> u64 {
        self.with_device(serial, |d| Ok(d.transfers)).unwrap_or(0)
    }

    fn notify(&self, event: HotplugEvent) {
        if self.notices.lock().send(Notice::Event(event)).is_err() {
            warn!("Hotplug notifier is gone, event dropped");
        }
    }

    fn with_device<R>(
        &self,
        serial: &str,
        f: impl FnOnce(&mut SimState) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut devices = self.devices.lock();
        let device = devices
            .iter_mut()
            .find(|d| d.config.serial == serial)
            .ok_or(TransportError::NoDevice)?;
        f(device)
    }

    fn control_out(
        state: &mut SimState,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<(usize, Vec<HotplugEvent>), TransportError> {
        match setup.request {
            REQUEST_LED => {
                state.led = (setup.value & 0x07) as u8;
                Ok((data.len(), Vec::new()))
            }
            REQUEST_MODE => {
                let channel = usize::from(setup.value);
                if channel >= CHANNEL_COUNT {
                    return Err(TransportError::Pipe);
                }
                let mode = u8::try_from(setup.index)
                    .ok()
                    .and_then(|raw| Mode::from_raw(raw).ok())
                    .ok_or(TransportError::Pipe)?;
                state.modes[channel] = mode;
                Ok((data.len(), Vec::new()))
            }
            REQUEST_SAMBA => {
                state.bootloader = true;
                state.open = false;
                state.modes = [Mode::HiZ; CHANNEL_COUNT];
                let serial = state.config.serial.clone();
                let events = vec![
                    HotplugEvent::Detached(serial),
                    HotplugEvent::Attached(state.descriptor()),
                ];
                Ok((data.len(), events))
            }
            _ => Err(TransportError::Pipe),
        }
    }

    fn control_in(state: &SimState, setup: ControlSetup, data: &mut [u8]) -> Result<usize, TransportError> {
        let reply: Vec<u8> = match setup.request {
            REQUEST_LED => vec![state.led],
            REQUEST_FIRMWARE_VERSION => state.config.firmware_version.as_bytes().to_vec(),
            _ => return Err(TransportError::Pipe),
        };
        let n = reply.len().min(data.len());
        data[..n].copy_from_slice(&reply[..n]);
        Ok(n)
    }

    fn simulate(&self, config: &SimDevice, request: &TransferRequest) -> Vec<RawFrame> {
        let frames = request.frames();
        let mut rng = self.rng.lock();
        let mut out = vec![[(0.0f32, 0.0f32); CHANNEL_COUNT]; frames];

        for channel in 0..CHANNEL_COUNT {
            let sources = &request.sources[channel];
            for (frame, slot) in out.iter_mut().enumerate() {
                let source = sources.get(frame).copied().unwrap_or(0.0);
                let noise = if config.noise > 0.0 {
                    rng.gen_range(-config.noise..=config.noise)
                } else {
                    0.0
                };
                slot[channel] = match request.modes[channel] {
                    Mode::HiZ => (0.0, 0.0),
                    Mode::Svmi => {
                        let v = Signal::Voltage.clamp(source);
                        (Signal::Current.clamp(v / config.load_ohms + noise), v)
                    }
                    Mode::Simv => {
                        let i = Signal::Current.clamp(source);
                        (i, Signal::Voltage.clamp(i * config.load_ohms + noise))
                    }
                };
            }
        }
        out
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Serial number given to the `index`th stock device.
pub fn default_serial(index: usize) -> String {
    format!("SIM{:04X}", 0x203B + index)
}

impl Transport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let devices = self.devices.lock();
        Ok(devices
            .iter()
            .filter(|d| d.attached)
            .map(SimState::descriptor)
            .collect())
    }

    fn open(&self, serial: &str) -> Result<(), TransportError> {
        self.with_device(serial, |d| {
            d.check_attached()?;
            if d.bootloader {
                return Err(TransportError::NotSupported);
            }
            if d.open {
                return Err(TransportError::Busy);
            }
            d.open = true;
            Ok(())
        })?;
        debug!(serial, "Opened simulated device");
        Ok(())
    }

    fn close(&self, serial: &str) -> Result<(), TransportError> {
        self.with_device(serial, |d| {
            d.check_open()?;
            d.open = false;
            d.modes = [Mode::HiZ; CHANNEL_COUNT];
            Ok(())
        })?;
        debug!(serial, "Closed simulated device");
        Ok(())
    }

    fn release(&self, serial: &str) {
        let _ = self.with_device(serial, |d| {
            d.open = false;
            Ok(())
        });
    }

    fn control_transfer(
        &self,
        serial: &str,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        trace!(
            serial,
            request_type = setup.request_type,
            request = setup.request,
            value = setup.value,
            index = setup.index,
            "Control transfer"
        );
        let (transferred, events) = self.with_device(serial, |d| {
            d.check_open()?;
            if setup.is_in() {
                Self::control_in(d, setup, data).map(|n| (n, Vec::new()))
            } else {
                Self::control_out(d, setup, data)
            }
        })?;
        for event in events {
            self.notify(event);
        }
        Ok(transferred)
    }

    fn transfer(
        &self,
        serial: &str,
        request: &TransferRequest,
    ) -> Result<Vec<RawFrame>, TransportError> {
        let config = self.with_device(serial, |d| {
            d.check_open()?;
            if let Some((limit, error)) = &d.fail_after {
                if d.transfers >= *limit {
                    return Err(error.clone());
                }
            }
            d.transfers += 1;
            Ok(d.config.clone())
        })?;

        if self.timing == SimTiming::Realtime && request.sample_rate > 0 {
            let secs = request.frames() as f64 / f64::from(request.sample_rate);
            thread::sleep(Duration::from_secs_f64(secs));
        }
        Ok(self.simulate(&config, request))
    }

    fn read_calibration(&self, serial: &str) -> Result<Calibration, TransportError> {
        self.with_device(serial, |d| {
            d.check_attached()?;
            Ok(d.config.calibration)
        })
    }

    fn write_calibration(
        &self,
        serial: &str,
        calibration: &Calibration,
    ) -> Result<(), TransportError> {
        self.with_device(serial, |d| {
            d.check_open()?;
            d.config.calibration = *calibration;
            Ok(())
        })
    }

    fn flash_firmware(&self, serial: &str, image: &[u8]) -> Result<(), TransportError> {
        if image.is_empty() {
            return Err(TransportError::InvalidParam);
        }
        let descriptor = self.with_device(serial, |d| {
            d.check_attached()?;
            if !d.bootloader {
                return Err(TransportError::NotSupported);
            }
            d.bootloader = false;
            Ok(d.descriptor())
        })?;
        info!(serial, bytes = image.len(), "Flashed simulated firmware");
        self.notify(HotplugEvent::Detached(serial.to_string()));
        self.notify(HotplugEvent::Attached(descriptor));
        Ok(())
    }

    fn add_hotplug_handler(&self, handler: HotplugHandler) -> HotplugToken {
        let token = HotplugToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((token, handler));
        debug!(token = token.0, "Hotplug handler added");
        token
    }

    fn remove_hotplug_handler(&self, token: HotplugToken) {
        self.handlers.write().retain(|(t, _)| *t != token);
        debug!(token = token.0, "Hotplug handler removed");
    }
}
