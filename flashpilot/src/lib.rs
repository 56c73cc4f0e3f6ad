//! # flashpilot
//!
//! Guided firmware updates for microcontrollers with a serial bootloader.
//!
//! This crate drives one update session end to end:
//!
//! - Update manifest parsing (project, preparation command, device
//!   parameters, ordered firmware images)
//! - Optional preparation handshake asking running firmware to reboot into
//!   its bootloader
//! - Bootloader connection, image loading, batched write and hard reset
//!   through pluggable collaborators
//! - Failure classification with user-facing recovery hints
//!
//! The flashing protocol itself lives behind [`BootloaderClient`]; device
//! selection behind [`DeviceAccess`]; image bytes behind [`ImageSource`];
//! user feedback behind [`ProgressSink`].
//!
//! ## Features
//!
//! - `native` (default): serial links via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use flashpilot::{FileImageSource, LogSink, UpdateManifest, Updater};
//! # use flashpilot::{BootloaderClient, DeviceAccess, DeviceLink, Error, UsbFilter};
//! # struct Picker;
//! # impl DeviceAccess for Picker {
//! #     fn request_access(&self, _: &[UsbFilter]) -> flashpilot::Result<Box<dyn DeviceLink>> {
//! #         Err(Error::UserCancelled)
//! #     }
//! # }
//! # fn engine() -> Box<dyn BootloaderClient> { unimplemented!() }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manifest = UpdateManifest::from_file("update.json")?;
//!     let images = FileImageSource::new(".");
//!     let updater = Updater::new(manifest, Picker, images, engine, LogSink);
//!
//!     if let Some(report) = updater.start().report() {
//!         match report.cause() {
//!             None => println!("done"),
//!             Some(cause) => eprintln!("{cause}: {}", cause.hint()),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod error;
pub mod image;
pub mod link;
pub mod manifest;
pub mod prepare;
pub mod sink;
pub mod update;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(feature = "native")]
pub use link::{SerialLink, detect_ports};
pub use {
    bootloader::{BootloaderClient, BootloaderFactory, DeviceIdentity, FlashImage, WriteOptions},
    error::{Error, Result},
    image::{FileImageSource, ImageSource},
    link::{BridgeKind, DetectedPort, DeviceAccess, DeviceLink, KNOWN_BRIDGES, UsbFilter},
    manifest::{ImageEntry, LayoutWarning, UpdateManifest, check_layout},
    sink::{LogLevel, LogSink, ProgressSink, StatusCategory},
    update::{
        FailureCause, Phase, PhaseOutcome, SessionId, SessionState, StartOutcome, UpdateReport,
        Updater,
    },
};
