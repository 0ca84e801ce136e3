//! Sessions: device membership, the run state machine and hotplug dispatch.
//!
//! A [`Session`] keeps two sets of devices:
//!
//! - **available**: everything the last scan (or hotplug attach) reported
//! - **active**: devices the session has claimed and will stream from
//!
//! ## Run state machine
//!
//! ```text
//! Idle -> Configured -> Running -> (Completed | Cancelled) -> Idle
//! ```
//!
//! [`Session::start`] spawns one streaming worker per active device and returns.
//! Workers report back when they stop; the last one moves the session to
//! `Completed`. [`Session::wait_for_completion`] and [`Session::cancel`] reap the
//! workers and return the session to `Idle`.
//!
//! ## Hotplug
//!
//! The transport delivers attach/detach events on its own thread. A detach of an
//! active device is resolved (the device is released without talking to it) before
//! the registered callback runs, and no session lock is held while a callback runs.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::device::{Device, DeviceState, StreamExit, StreamOutcome, StreamSettings};
use crate::error::{AppResult, SmuError};
use crate::sample::{Mode, CHANNEL_COUNT};
use crate::transport::{DeviceDescriptor, HotplugEvent, HotplugToken, Transport};

/// How long [`Session::flash_firmware`] waits for a rebooted device to show up.
pub const BOOTLOADER_WAIT: Duration = Duration::from_secs(5);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Callback receiving the device affected by a hotplug event.
pub type HotplugCallback = Arc<dyn Fn(Arc<Device>) + Send + Sync>;

/// Run state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing configured or running
    Idle,
    /// A sample rate was set for the next run
    Configured,
    /// Workers are streaming
    Running,
    /// Every worker finished on its own
    Completed,
    /// Cancellation is in progress
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Registry {
    available: Vec<Arc<Device>>,
    active: Vec<Arc<Device>>,
}

impl Registry {
    fn is_active(&self, device: &Arc<Device>) -> bool {
        self.active.iter().any(|d| Arc::ptr_eq(d, device))
    }

    fn find(&self, serial: &str) -> Option<Arc<Device>> {
        self.active
            .iter()
            .chain(self.available.iter())
            .find(|d| d.serial() == serial)
            .cloned()
    }
}

struct RunStatus {
    state: SessionState,
    outstanding: usize,
    failures: Vec<String>,
}

struct RunControl {
    status: Mutex<RunStatus>,
    changed: Condvar,
}

impl RunControl {
    fn worker_finished(&self, device: &Device, outcome: &StreamOutcome) {
        let mut status = self.status.lock();
        status.outstanding = status.outstanding.saturating_sub(1);
        if let StreamOutcome::Failed(err) = outcome {
            status.failures.push(format!("{}: {err}", device.serial()));
        }
        if status.outstanding == 0 && status.state == SessionState::Running {
            status.state = SessionState::Completed;
            debug!("All streaming workers finished");
        }
        self.changed.notify_all();
    }
}

struct Shared {
    id: u64,
    transport: Arc<dyn Transport>,
    registry: RwLock<Registry>,
    run: Arc<RunControl>,
    settings: Mutex<StreamSettings>,
    control_timeout: Duration,
    attach: Mutex<Option<HotplugCallback>>,
    detach: Mutex<Option<HotplugCallback>>,
}

impl Shared {
    fn new_device(&self, descriptor: DeviceDescriptor) -> Arc<Device> {
        Arc::new(Device::new(
            descriptor,
            Arc::clone(&self.transport),
            self.control_timeout,
        ))
    }

    fn handle_hotplug(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Attached(descriptor) => {
                let device = {
                    let mut registry = self.registry.write();
                    let serial = descriptor.serial.clone();
                    registry
                        .available
                        .retain(|d| d.serial() != serial || d.state() == DeviceState::Active);
                    let device = self.new_device(descriptor);
                    registry.available.push(Arc::clone(&device));
                    device
                };
                info!(session = self.id, serial = %device.serial(), "Device attached");
                let callback = self.attach.lock().clone();
                if let Some(callback) = callback {
                    callback(device);
                }
            }
            HotplugEvent::Detached(serial) => {
                let device = {
                    let mut registry = self.registry.write();
                    let device = registry.find(&serial);
                    if let Some(device) = &device {
                        if registry.is_active(device) {
                            if let Err(e) = device.release(true) {
                                warn!(serial = %serial, error = %e, "Release after detach failed");
                            }
                            registry.active.retain(|d| !Arc::ptr_eq(d, device));
                        }
                        registry.available.retain(|d| !Arc::ptr_eq(d, device));
                    }
                    device
                };
                let Some(device) = device else {
                    debug!(session = self.id, serial = %serial, "Detach of unknown device ignored");
                    return;
                };
                info!(session = self.id, serial = %serial, "Device detached");
                let callback = self.detach.lock().clone();
                if let Some(callback) = callback {
                    callback(device);
                }
            }
        }
    }
}

/// A set of devices streamed together.
///
/// Several sessions may share one transport; each subscribes to its hotplug events
/// for as long as it lives.
pub struct Session {
    shared: Arc<Shared>,
    hotplug: HotplugToken,
}

impl Session {
    /// Create a session on `transport` with default settings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::from_config(transport, &SessionConfig::default())
    }

    /// Create a session using the queue, rate and timeout settings of `config`.
    pub fn from_config(transport: Arc<dyn Transport>, config: &SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            registry: RwLock::new(Registry::default()),
            run: Arc::new(RunControl {
                status: Mutex::new(RunStatus {
                    state: SessionState::Idle,
                    outstanding: 0,
                    failures: Vec::new(),
                }),
                changed: Condvar::new(),
            }),
            settings: Mutex::new(config.stream_settings()),
            control_timeout: config.control_timeout(),
            attach: Mutex::new(None),
            detach: Mutex::new(None),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let hotplug = shared.transport.add_hotplug_handler(Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_hotplug(event);
            }
        }));

        info!(
            session = shared.id,
            transport = shared.transport.name(),
            queue_size = config.queue_size,
            "Session created"
        );
        Self { shared, hotplug }
    }

    /// Process-unique session identifier.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current run state.
    pub fn state(&self) -> SessionState {
        self.shared.run.status.lock().state
    }

    /// Per-channel queue capacity.
    pub fn queue_size(&self) -> usize {
        self.shared.settings.lock().queue_size
    }

    /// Sample rate of the next run, 0 meaning each device's default.
    pub fn sample_rate(&self) -> u32 {
        self.shared.settings.lock().sample_rate
    }

    /// Devices reported by the last scan or attach.
    pub fn available_devices(&self) -> Vec<Arc<Device>> {
        self.shared.registry.read().available.clone()
    }

    /// Devices claimed by this session.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.shared.registry.read().active.clone()
    }

    /// Number of devices claimed by this session.
    pub fn active_count(&self) -> usize {
        self.shared.registry.read().active.len()
    }

    /// Refresh the available set from the transport.
    ///
    /// Handles are reused for devices that were already known.
    pub fn scan(&self) -> AppResult<usize> {
        let descriptors = self
            .shared
            .transport
            .enumerate()
            .map_err(|e| SmuError::Scan(format!("{} enumeration failed: {e}", self.shared.transport.name())))?;

        let mut registry = self.shared.registry.write();
        let mut available = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let known = registry
                .find(&descriptor.serial)
                .filter(|d| d.descriptor() == &descriptor)
                .filter(|d| !matches!(d.state(), DeviceState::Detached | DeviceState::Destroyed));
            let device = known.unwrap_or_else(|| self.shared.new_device(descriptor));
            available.push(device);
        }
        registry.available = available;
        let found = registry.available.len();
        drop(registry);

        info!(session = self.shared.id, found, "Scan complete");
        Ok(found)
    }

    /// Scan, then claim every discovered device that is not active yet.
    ///
    /// Devices that cannot be claimed (bootloader mode, owned elsewhere) are skipped.
    /// Returns the number of devices added.
    pub fn add_all(&self) -> AppResult<usize> {
        self.scan()?;
        let mut added = 0;
        for device in self.available_devices() {
            if device.is_bootloader() || self.shared.registry.read().is_active(&device) {
                continue;
            }
            match self.add(&device) {
                Ok(()) => added += 1,
                Err(e) => warn!(serial = %device.serial(), error = %e, "Skipping device"),
            }
        }
        Ok(added)
    }

    /// Claim a discovered device.
    pub fn add(&self, device: &Arc<Device>) -> AppResult<()> {
        let add_error = |message: &str| SmuError::DeviceAdd {
            serial: device.serial().to_string(),
            message: message.to_string(),
        };
        if self.state() == SessionState::Running {
            return Err(add_error("session is streaming"));
        }

        let mut registry = self.shared.registry.write();
        if registry.is_active(device) {
            return Err(add_error("already active in this session"));
        }
        if !registry.available.iter().any(|d| Arc::ptr_eq(d, device)) {
            return Err(add_error("not discovered by this session"));
        }
        device.open(self.shared.id, *self.shared.settings.lock())?;
        registry.active.push(Arc::clone(device));
        info!(session = self.shared.id, serial = %device.serial(), "Device added");
        Ok(())
    }

    /// Release an active device.
    ///
    /// With `detached` the device is assumed to be gone already and no request is sent
    /// to it.
    pub fn remove(&self, device: &Arc<Device>, detached: bool) -> AppResult<()> {
        let mut registry = self.shared.registry.write();
        if !registry.is_active(device) {
            return Err(SmuError::DeviceRemove {
                serial: device.serial().to_string(),
                message: "not active in this session".to_string(),
            });
        }
        device.release(detached)?;
        registry.active.retain(|d| !Arc::ptr_eq(d, device));
        info!(session = self.shared.id, serial = %device.serial(), detached, "Device removed");
        Ok(())
    }

    /// Release a device and drop it from both sets. The handle is unusable afterwards.
    pub fn destroy(&self, device: &Arc<Device>) -> AppResult<()> {
        let mut registry = self.shared.registry.write();
        device.destroy()?;
        registry.active.retain(|d| !Arc::ptr_eq(d, device));
        registry.available.retain(|d| !Arc::ptr_eq(d, device));
        info!(session = self.shared.id, serial = %device.serial(), "Device destroyed");
        Ok(())
    }

    /// Set the sample rate of the next run; 0 selects each device's default.
    pub fn configure(&self, sample_rate: u32) -> AppResult<()> {
        let busy = || SmuError::Configuration("cannot configure while streaming".to_string());
        if self.state() == SessionState::Running {
            return Err(busy());
        }

        let devices = self.devices();
        self.ensure_idle_devices(&devices, "configure")?;
        if let Some(slow) = devices
            .iter()
            .find(|d| sample_rate > d.default_sample_rate())
        {
            return Err(SmuError::Configuration(format!(
                "sample rate {sample_rate} Hz exceeds the {} Hz supported by {}",
                slow.default_sample_rate(),
                slow.serial()
            )));
        }

        {
            let mut status = self.shared.run.status.lock();
            if status.state == SessionState::Running {
                return Err(busy());
            }
            status.state = SessionState::Configured;
        }
        let settings = {
            let mut settings = self.shared.settings.lock();
            settings.sample_rate = sample_rate;
            *settings
        };
        for device in &devices {
            device.apply_settings(settings);
        }
        info!(session = self.shared.id, sample_rate, "Session configured");
        Ok(())
    }

    /// Set the per-channel queue capacity used from the next run on.
    pub fn set_queue_size(&self, queue_size: usize) -> AppResult<()> {
        if queue_size == 0 {
            return Err(SmuError::Configuration(
                "queue size must be positive".to_string(),
            ));
        }
        if self.state() == SessionState::Running {
            return Err(SmuError::Configuration(
                "cannot resize queues while streaming".to_string(),
            ));
        }
        let devices = self.devices();
        self.ensure_idle_devices(&devices, "resize queues")?;
        let settings = {
            let mut settings = self.shared.settings.lock();
            settings.queue_size = queue_size;
            *settings
        };
        for device in &devices {
            device.apply_settings(settings);
        }
        debug!(session = self.shared.id, queue_size, "Queue size set");
        Ok(())
    }

    /// Stream `samples` samples per device (0 = until cancelled) and return once done.
    pub fn run(&self, samples: u64) -> AppResult<()> {
        self.start(samples)?;
        self.wait_for_completion()
    }

    /// Start streaming `samples` samples per device (0 = until cancelled) in the
    /// background.
    pub fn start(&self, samples: u64) -> AppResult<()> {
        let devices = self.devices();
        {
            let mut status = self.shared.run.status.lock();
            if status.state == SessionState::Running || status.state == SessionState::Cancelled {
                return Err(SmuError::Stream(format!(
                    "cannot start: session is {}",
                    status.state
                )));
            }
            if devices.is_empty() {
                return Err(SmuError::Stream("no active devices".to_string()));
            }
            status.state = SessionState::Running;
            status.outstanding = devices.len();
            status.failures.clear();
        }

        let settings = *self.shared.settings.lock();
        let run = Arc::clone(&self.shared.run);
        let on_exit: StreamExit = Arc::new(move |device: &Device, outcome: &StreamOutcome| {
            run.worker_finished(device, outcome)
        });

        for (started, device) in devices.iter().enumerate() {
            if let Err(e) = device.start_stream(samples, settings, Some(Arc::clone(&on_exit))) {
                error!(serial = %device.serial(), error = %e, "Failed to start streaming");
                {
                    let mut status = self.shared.run.status.lock();
                    status.outstanding = status.outstanding.saturating_sub(devices.len() - started);
                }
                self.stop_all(SessionState::Idle);
                return Err(SmuError::Stream(format!(
                    "cannot start {}: {e}",
                    device.serial()
                )));
            }
        }

        info!(
            session = self.shared.id,
            devices = devices.len(),
            samples,
            "Session streaming"
        );
        Ok(())
    }

    /// Stop every worker. A no-op when nothing is running.
    pub fn cancel(&self) -> AppResult<()> {
        {
            let mut status = self.shared.run.status.lock();
            if status.state != SessionState::Running {
                return Ok(());
            }
            status.state = SessionState::Cancelled;
            self.shared.run.changed.notify_all();
        }
        info!(session = self.shared.id, "Cancelling session");
        self.stop_all(SessionState::Idle);
        Ok(())
    }

    /// Block until the current run completes or is cancelled.
    pub fn wait_for_completion(&self) -> AppResult<()> {
        {
            let mut status = self.shared.run.status.lock();
            while status.state == SessionState::Running {
                self.shared.run.changed.wait(&mut status);
            }
        }

        for device in self.devices() {
            device.join_stream();
        }

        let failures = {
            let mut status = self.shared.run.status.lock();
            if status.state == SessionState::Completed {
                status.state = SessionState::Idle;
            }
            std::mem::take(&mut status.failures)
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SmuError::Stream(failures.join("; ")))
        }
    }

    /// Cancel, wait for the workers, then switch every channel of every active device
    /// to high impedance.
    pub fn end(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.cancel() {
            errors.push(e);
        }
        if let Err(e) = self.wait_for_completion() {
            errors.push(e);
        }
        for device in self.devices() {
            if device.state() != DeviceState::Active {
                continue;
            }
            for channel in 0..CHANNEL_COUNT {
                if let Err(e) = device.set_mode(channel, Mode::HiZ) {
                    errors.push(e);
                }
            }
        }
        self.shared.run.status.lock().state = SessionState::Idle;
        debug!(session = self.shared.id, failures = errors.len(), "Session ended");

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SmuError::ShutdownFailed(errors)),
        }
    }

    /// Register the attach callback, replacing any previous one.
    pub fn hotplug_attach<F>(&self, callback: F)
    where
        F: Fn(Arc<Device>) + Send + Sync + 'static,
    {
        *self.shared.attach.lock() = Some(Arc::new(callback));
    }

    /// Register the detach callback, replacing any previous one.
    pub fn hotplug_detach<F>(&self, callback: F)
    where
        F: Fn(Arc<Device>) + Send + Sync + 'static,
    {
        *self.shared.detach.lock() = Some(Arc::new(callback));
    }

    /// Flash a firmware image.
    ///
    /// When `device` is given it is rebooted into its bootloader first. The first
    /// device found in bootloader mode is then flashed; it re-attaches running the
    /// new firmware.
    pub fn flash_firmware(&self, path: impl AsRef<Path>, device: Option<&Arc<Device>>) -> AppResult<()> {
        let path = path.as_ref();
        let image = std::fs::read(path).map_err(|e| {
            SmuError::Firmware(format!("cannot read {}: {e}", path.display()))
        })?;
        if image.is_empty() {
            return Err(SmuError::Firmware(format!(
                "{} is empty",
                path.display()
            )));
        }

        let wait = if let Some(device) = device {
            device.samba_mode()?;
            let mut registry = self.shared.registry.write();
            if registry.is_active(device) {
                device.release(true)?;
                registry.active.retain(|d| !Arc::ptr_eq(d, device));
            }
            BOOTLOADER_WAIT
        } else {
            Duration::ZERO
        };

        let target = self.find_bootloader(wait)?;
        self.shared
            .transport
            .flash_firmware(&target.serial, &image)
            .map_err(|e| SmuError::Firmware(format!("flashing {} failed: {e}", target.serial)))?;
        info!(
            session = self.shared.id,
            serial = %target.serial,
            bytes = image.len(),
            "Firmware flashed"
        );
        Ok(())
    }

    fn find_bootloader(&self, wait: Duration) -> AppResult<DeviceDescriptor> {
        let deadline = Instant::now() + wait;
        loop {
            let descriptors = self
                .shared
                .transport
                .enumerate()
                .map_err(|e| SmuError::Firmware(format!("enumeration failed: {e}")))?;
            if let Some(found) = descriptors.into_iter().find(|d| d.bootloader) {
                return Ok(found);
            }
            if Instant::now() >= deadline {
                return Err(SmuError::Firmware(
                    "no device in bootloader mode".to_string(),
                ));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Devices streaming outside a session run (`Device::get_samples`) block
    /// reconfiguration just like a run does.
    fn ensure_idle_devices(&self, devices: &[Arc<Device>], action: &str) -> AppResult<()> {
        match devices.iter().find(|d| d.is_streaming()) {
            Some(busy) => Err(SmuError::Configuration(format!(
                "cannot {action} while {} is streaming",
                busy.serial()
            ))),
            None => Ok(()),
        }
    }

    fn stop_all(&self, next: SessionState) {
        for device in self.devices() {
            device.cancel_stream();
        }
        let mut status = self.shared.run.status.lock();
        status.state = next;
        status.outstanding = 0;
        self.shared.run.changed.notify_all();
    }

    fn release_all(&self) {
        let mut registry = self.shared.registry.write();
        for device in registry.active.drain(..) {
            if let Err(e) = device.release(false) {
                warn!(serial = %device.serial(), error = %e, "Release during teardown failed");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("active", &self.active_count())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            warn!(session = self.shared.id, error = %e, "Errors while ending session on drop");
        }
        self.release_all();
        self.shared.transport.remove_hotplug_handler(self.hotplug);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimulatedTransport;

    fn session(devices: usize) -> (Arc<SimulatedTransport>, Session) {
        let transport = Arc::new(SimulatedTransport::with_devices(devices));
        let session = Session::new(transport.clone());
        (transport, session)
    }

    #[test]
    fn test_scan_reuses_handles() {
        let (_transport, session) = session(2);
        assert_eq!(session.scan().unwrap(), 2);
        let first = session.available_devices();
        session.scan().unwrap();
        let second = session.available_devices();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn test_add_all_claims_devices() {
        let (transport, session) = session(2);
        assert_eq!(session.add_all().unwrap(), 2);
        assert_eq!(session.active_count(), 2);
        assert!(session
            .devices()
            .iter()
            .all(|d| transport.is_open(d.serial()) && d.owner() == Some(session.id())));
        // Nothing left to add
        assert_eq!(session.add_all().unwrap(), 0);
    }

    #[test]
    fn test_second_session_cannot_claim() {
        let (transport, first) = session(1);
        first.add_all().unwrap();

        let second = Session::new(transport.clone());
        second.scan().unwrap();
        let device = second.available_devices().remove(0);
        assert!(matches!(second.add(&device), Err(SmuError::DeviceAdd { .. })));
        assert_eq!(second.active_count(), 0);
    }

    #[test]
    fn test_configure_rejects_excessive_rate() {
        let (_transport, session) = session(1);
        session.add_all().unwrap();
        assert!(matches!(
            session.configure(10_000_000),
            Err(SmuError::Configuration(_))
        ));
        session.configure(50_000).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(session.sample_rate(), 50_000);
    }

    #[test]
    fn test_start_without_devices_fails() {
        let (_transport, session) = session(0);
        assert!(matches!(session.start(10), Err(SmuError::Stream(_))));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_run_returns_to_idle() {
        let (_transport, session) = session(1);
        session.add_all().unwrap();
        session.run(500).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        let device = session.devices().remove(0);
        assert!(!device.is_streaming());
    }

    #[test]
    fn test_stream_failure_reported_by_run() {
        let (transport, session) = session(1);
        session.add_all().unwrap();
        let serial = session.devices()[0].serial().to_string();
        transport.fail_transfers_after(&serial, 1, crate::transport::TransportError::Io);

        let err = session.run(10_000).unwrap_err();
        assert!(matches!(err, SmuError::Stream(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_flash_without_bootloader_device() {
        let (_transport, session) = session(1);
        let mut image = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut image, b"\x7fFW").unwrap();
        assert!(matches!(
            session.flash_firmware(image.path(), None),
            Err(SmuError::Firmware(_))
        ));
    }

    #[test]
    fn test_flash_rejects_empty_image() {
        let (_transport, session) = session(1);
        let image = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            session.flash_firmware(image.path(), None),
            Err(SmuError::Firmware(_))
        ));
    }
}
