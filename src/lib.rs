//! # Rust SMU Core Library
//!
//! This crate drives sessions of USB source-measure units: two-channel instruments
//! that source a voltage or current on each channel while measuring the other signal,
//! continuously and synchronized across channels.
//!
//! ## Crate Structure
//!
//! - **`session`**: `Session` owns device membership, the run/start/cancel/end state
//!   machine and hotplug callback dispatch. Start here.
//! - **`device`**: `Device` handles with identity, per-channel modes, calibration and the
//!   per-device streaming worker that moves samples between the transport and the
//!   queues.
//! - **`channel`**: `Channel` views over one half of a device, including waveform helpers.
//! - **`queue`**: bounded per-channel input (drop-oldest) and output (hold/cyclic) queues.
//! - **`sample`**: `Mode`, `Signal`, `Sample` and the read/write result types.
//! - **`calibration`**: the per-channel gain/offset matrix and its file format.
//! - **`waveform`**: periodic output waveform rendering.
//! - **`transport`**: the `Transport` trait the engine needs from a USB stack, and a
//!   simulated implementation in `transport::sim`.
//! - **`config`** / **`logging`**: figment configuration and tracing initialisation.
//! - **`error`**: the crate-wide `SmuError` enum.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_smu::{Mode, ReadTimeout, Session};
//! use rust_smu::transport::sim::SimulatedTransport;
//!
//! # fn main() -> rust_smu::AppResult<()> {
//! let session = Session::new(Arc::new(SimulatedTransport::with_devices(1)));
//! session.add_all()?;
//! let device = session.devices().remove(0);
//! device.set_mode(0, Mode::Svmi)?;
//! device.write(&[1.0, 2.0, 3.0], 0, true)?;
//!
//! session.start(1000)?;
//! let result = device.read(1000, ReadTimeout::Forever)?;
//! session.wait_for_completion()?;
//! println!("{} samples, {} dropped", result.len(), result.dropped);
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod queue;
pub mod sample;
pub mod session;
pub mod transport;
pub mod waveform;

pub use calibration::Calibration;
pub use channel::Channel;
pub use device::{ControlResponse, Device, DeviceState};
pub use error::{AppResult, SmuError};
pub use sample::{ChannelSample, Mode, ReadResult, ReadTimeout, Sample, Signal, WriteResult};
pub use session::{Session, SessionState};
