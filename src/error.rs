//! Custom error types for the SMU engine.
//!
//! This module defines the primary error type, `SmuError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that can occur while managing a session of
//! source-measure units, from device enumeration to streaming and calibration.
//!
//! ## Error Hierarchy
//!
//! - **`Scan`**: the transport could not enumerate attached devices.
//! - **`DeviceAdd`** / **`DeviceRemove`**: membership changes that were rejected, either
//!   because the device is already in the target state or because the transport refused
//!   to open/close it. Session membership is left unchanged.
//! - **`Configuration`**: bad sample rates, invalid configuration files, or configuring
//!   while a stream is running.
//! - **`Stream`**: failures starting, running or cancelling a streaming run. The session
//!   is back in the idle state when one of these surfaces.
//! - **`Calibration`** / **`Firmware`**: malformed calibration data or firmware images.
//! - **`Transport`**: raw control/bulk transfer failures. The transport's signed status
//!   code is preserved.
//! - **`InvalidArgument`**: bad channel indexes, LED masks, mode values and the like,
//!   raised before any transport traffic happens.
//! - **`InvalidState`**: operations that are not allowed in the current device or session
//!   state (changing modes mid-stream, using a released device handle).
//!
//! Dropped samples are deliberately absent: queue overflow is advisory and reported
//! through [`crate::sample::ReadResult`] / [`crate::sample::WriteResult`].

use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SmuError>;

/// Errors produced by sessions, devices and channels.
#[derive(Error, Debug)]
pub enum SmuError {
    /// Device enumeration failed.
    #[error("Scan failed: {0}")]
    Scan(String),

    /// A device could not be added to the session.
    #[error("Failed to add device {serial}: {message}")]
    DeviceAdd {
        /// Serial number of the device
        serial: String,
        /// Reason for the failure
        message: String,
    },

    /// A device could not be removed from the session.
    #[error("Failed to remove device {serial}: {message}")]
    DeviceRemove {
        /// Serial number of the device
        serial: String,
        /// Reason for the failure
        message: String,
    },

    /// Semantic configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file could not be loaded or parsed.
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// Streaming run failure.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Calibration data was malformed or could not be stored.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Firmware image could not be flashed.
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// Raw transfer failure reported by the transport.
    #[error("Transport error ({code}): {message}")]
    Transport {
        /// Negative status code reported by the transport
        code: i32,
        /// Human readable description
        message: String,
    },

    /// Failure moving sample data to or from a device.
    #[error("Device I/O error: {0}")]
    DeviceIo(String),

    /// An argument failed validation before reaching the transport.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several teardown steps failed during an explicit `end()`.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<SmuError>),
}

impl SmuError {
    /// Transport status code, if this error came from the transport.
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this is an invalid-state rejection.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

impl From<TransportError> for SmuError {
    fn from(err: TransportError) -> Self {
        SmuError::Transport {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<figment::Error> for SmuError {
    fn from(err: figment::Error) -> Self {
        SmuError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SmuError::DeviceAdd {
            serial: "203B".into(),
            message: "already active".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to add device 203B: already active"
        );
    }

    #[test]
    fn transport_error_keeps_status_code() {
        let err: SmuError = TransportError::Pipe.into();
        assert_eq!(err.transport_code(), Some(-9));
        assert!(err.to_string().contains("-9"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = SmuError::ShutdownFailed(vec![
            SmuError::Transport {
                code: -4,
                message: "no device".into(),
            },
            SmuError::Stream("worker panicked".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
