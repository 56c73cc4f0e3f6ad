//! Bootloader client capability.
//!
//! The flashing protocol engine (sync, stub upload, flash commands) lives
//! behind [`BootloaderClient`]. The update orchestrator only decides when
//! each call happens and what a failure means.

use crate::error::Result;
use crate::link::DeviceLink;
use crate::manifest::{DeviceParams, ImageSpan};

/// Identity reported by the bootloader after a successful handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Chip description (e.g. "ESP32-D0WD-V3").
    pub chip: String,
    /// MAC address or other unique id, if reported.
    pub id: Option<String>,
}

/// A firmware image loaded into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    /// Logical name from the manifest.
    pub name: String,
    /// Flash load address.
    pub address: u32,
    /// Image bytes.
    pub data: Vec<u8>,
}

impl FlashImage {
    /// Address range occupied by this image.
    pub fn span(&self) -> ImageSpan<'_> {
        ImageSpan {
            name: &self.name,
            address: self.address,
            len: self.data.len() as u64,
        }
    }
}

/// Write policy for a batched image write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Compress data on the wire.
    pub compress: bool,
    /// Erase the whole chip before writing.
    pub erase_all: bool,
}

impl Default for WriteOptions {
    /// Compressed, sector-by-sector write without a full-chip erase.
    fn default() -> Self {
        Self {
            compress: true,
            erase_all: false,
        }
    }
}

/// Progress callback: `(image_index, bytes_written, total_bytes)` for the
/// image currently being written.
pub type WriteProgress<'a> = &'a mut dyn FnMut(usize, usize, usize);

/// Flashing protocol engine.
pub trait BootloaderClient: Send {
    /// Open `link` at `baud_rate`, sync with the bootloader and identify the chip.
    fn connect(&mut self, link: &mut dyn DeviceLink, baud_rate: u32) -> Result<DeviceIdentity>;

    /// Write every image in one batch.
    fn write_images(
        &mut self,
        link: &mut dyn DeviceLink,
        images: &[FlashImage],
        params: &DeviceParams,
        options: WriteOptions,
        progress: WriteProgress<'_>,
    ) -> Result<()>;

    /// Reset the chip into the application.
    fn hard_reset(&mut self, link: &mut dyn DeviceLink) -> Result<()>;

    /// Leave the bootloader session.
    fn disconnect(&mut self, link: &mut dyn DeviceLink) -> Result<()>;
}

/// Creates one bootloader client per update session.
pub trait BootloaderFactory: Send + Sync {
    /// Create a fresh client.
    fn create(&self) -> Box<dyn BootloaderClient>;
}

impl<F> BootloaderFactory for F
where
    F: Fn() -> Box<dyn BootloaderClient> + Send + Sync,
{
    fn create(&self) -> Box<dyn BootloaderClient> {
        self()
    }
}
