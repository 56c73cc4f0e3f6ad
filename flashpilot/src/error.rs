//! Error types for flashpilot.

use std::io;
use thiserror::Error;

/// Result type for flashpilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type raised by collaborators and manifest handling.
///
/// The update orchestrator never lets these escape a session; each one is
/// classified at the phase that owns it (see [`crate::update::FailureCause`]).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Manifest document could not be parsed.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Hexadecimal address could not be parsed.
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress {
        /// Address as written in the manifest.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The user dismissed the device selection.
    #[error("No device selected")]
    UserCancelled,

    /// No usable device port.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device link is not open.
    #[error("Device link is not open")]
    NotOpen,

    /// The bootloader engine reported an error.
    #[error("Bootloader error: {0}")]
    Bootloader(String),

    /// Firmware image could not be fetched.
    #[error("Failed to fetch {file}: {reason}")]
    ImageFetch {
        /// Path or URL of the image.
        file: String,
        /// Underlying cause.
        reason: String,
    },

    /// Unsupported operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}
