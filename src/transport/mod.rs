//! Transport adapter contract.
//!
//! The engine never talks to USB directly. Everything it needs from the bus is
//! expressed by the [`Transport`] trait: enumeration, exclusive open/close, raw
//! control transfers, bulk sample transfers, access to the calibration block and the
//! firmware image protocol, plus a single hotplug notification stream.
//!
//! [`sim::SimulatedTransport`] is an in-process implementation backed by simulated
//! hardware, used by the `smu` binary and the test-suite.

pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::Calibration;
use crate::sample::{Mode, CHANNEL_COUNT};

/// Vendor request: set the LED mask (`wValue` = mask).
pub const REQUEST_LED: u8 = 0x03;
/// Vendor request: set a channel mode (`wValue` = channel, `wIndex` = raw mode).
pub const REQUEST_MODE: u8 = 0x53;
/// Vendor request: reboot into the SAM-BA bootloader.
pub const REQUEST_SAMBA: u8 = 0xBB;

/// `bmRequestType` for host-to-device vendor requests.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;
/// `bmRequestType` for device-to-host vendor requests.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
/// Direction bit of `bmRequestType`.
pub const DIRECTION_IN: u8 = 0x80;

/// Transport-level failures, each carrying a libusb-style negative status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Input/output error
    #[error("input/output error (-1)")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter (-2)")]
    InvalidParam,
    /// Access denied
    #[error("access denied (-3)")]
    Access,
    /// Device disconnected
    #[error("no such device, it may have been disconnected (-4)")]
    NoDevice,
    /// Entity not found
    #[error("entity not found (-5)")]
    NotFound,
    /// Resource busy
    #[error("resource busy (-6)")]
    Busy,
    /// Operation timed out
    #[error("operation timed out (-7)")]
    Timeout,
    /// Overflow
    #[error("overflow (-8)")]
    Overflow,
    /// Pipe error, the endpoint stalled or the request is unsupported
    #[error("pipe error (-9)")]
    Pipe,
    /// System call interrupted
    #[error("system call interrupted (-10)")]
    Interrupted,
    /// Insufficient memory
    #[error("insufficient memory (-11)")]
    NoMem,
    /// Operation not supported
    #[error("operation not supported (-12)")]
    NotSupported,
    /// Anything else, with the raw status code
    #[error("transport failure ({0})")]
    Other(i32),
}

impl TransportError {
    /// Negative status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Io => -1,
            Self::InvalidParam => -2,
            Self::Access => -3,
            Self::NoDevice => -4,
            Self::NotFound => -5,
            Self::Busy => -6,
            Self::Timeout => -7,
            Self::Overflow => -8,
            Self::Pipe => -9,
            Self::Interrupted => -10,
            Self::NoMem => -11,
            Self::NotSupported => -12,
            Self::Other(code) => *code,
        }
    }

    /// Map a raw status code back to an error.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => Self::Io,
            -2 => Self::InvalidParam,
            -3 => Self::Access,
            -4 => Self::NoDevice,
            -5 => Self::NotFound,
            -6 => Self::Busy,
            -7 => Self::Timeout,
            -8 => Self::Overflow,
            -9 => Self::Pipe,
            -10 => Self::Interrupted,
            -11 => Self::NoMem,
            -12 => Self::NotSupported,
            other => Self::Other(other),
        }
    }

    /// Whether the device has gone away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NoDevice)
    }
}

/// Identity of an attached device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique serial number
    pub serial: String,
    /// Firmware revision string
    pub firmware_version: String,
    /// Hardware revision string
    pub hardware_version: String,
    /// Native sample rate in Hz
    pub default_sample_rate: u32,
    /// Device is running its bootloader instead of the application firmware
    pub bootloader: bool,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bootloader {
            write!(f, "{} (bootloader)", self.serial)
        } else {
            write!(
                f,
                "{} (fw {}, hw {})",
                self.serial, self.firmware_version, self.hardware_version
            )
        }
    }
}

/// Setup packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
}

impl ControlSetup {
    /// Host-to-device vendor request without payload.
    pub fn vendor_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            request_type: REQUEST_TYPE_VENDOR_OUT,
            request,
            value,
            index,
        }
    }

    /// Whether data flows from the device to the host.
    pub fn is_in(&self) -> bool {
        self.request_type & DIRECTION_IN == DIRECTION_IN
    }
}

/// Raw (uncalibrated) reading of one frame: `(current, voltage)` per channel.
pub type RawFrame = [(f32, f32); CHANNEL_COUNT];

/// One bulk transfer worth of streaming data.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    /// Sample rate the device is clocked at
    pub sample_rate: u32,
    /// Mode of each channel for the duration of the transfer
    pub modes: [Mode; CHANNEL_COUNT],
    /// Raw set-points per channel, one per frame, ignored for HI_Z channels
    pub sources: [Vec<f32>; CHANNEL_COUNT],
}

impl TransferRequest {
    /// Number of frames exchanged by this transfer.
    pub fn frames(&self) -> usize {
        self.sources[0].len()
    }
}

/// Attach/detach notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device appeared on the bus
    Attached(DeviceDescriptor),
    /// The device with this serial disappeared
    Detached(String),
}

/// Callback invoked from the transport's notification context.
pub type HotplugHandler = Arc<dyn Fn(HotplugEvent) + Send + Sync>;

/// Registration handle returned by [`Transport::add_hotplug_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotplugToken(pub u64);

/// Capabilities the engine needs from a USB stack.
///
/// Implementations must be callable from several threads at once: each streaming
/// device issues [`Transport::transfer`] from its own thread while clients issue
/// control requests.
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// List every supported device currently attached.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Claim a device for exclusive use.
    fn open(&self, serial: &str) -> Result<(), TransportError>;

    /// Release a claimed device.
    fn close(&self, serial: &str) -> Result<(), TransportError>;

    /// Release local resources for a device that is already gone.
    ///
    /// Never talks to the device and never fails.
    fn release(&self, serial: &str);

    /// Raw control transfer. Returns the number of bytes moved through `data`.
    fn control_transfer(
        &self,
        serial: &str,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Exchange one bulk transfer of sample frames.
    fn transfer(
        &self,
        serial: &str,
        request: &TransferRequest,
    ) -> Result<Vec<RawFrame>, TransportError>;

    /// Read the calibration block from persistent storage.
    fn read_calibration(&self, serial: &str) -> Result<Calibration, TransportError>;

    /// Replace the calibration block in persistent storage.
    fn write_calibration(
        &self,
        serial: &str,
        calibration: &Calibration,
    ) -> Result<(), TransportError>;

    /// Write a firmware image to a device in bootloader mode.
    fn flash_firmware(&self, serial: &str, image: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to attach/detach events. Every subscriber sees every event.
    fn add_hotplug_handler(&self, handler: HotplugHandler) -> HotplugToken;

    /// Drop a subscription. Unknown tokens are ignored.
    fn remove_hotplug_handler(&self, token: HotplugToken);
}
