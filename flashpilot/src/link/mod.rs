//! Device link abstraction and USB bridge classification.
//!
//! A [`DeviceLink`] is one logical connection to a physical port. The
//! environment grants links through [`DeviceAccess`]; the update session
//! then owns the link exclusively until teardown.
//!
//! Implementations exist for:
//!
//! - Native platforms via the `serialport` crate ([`SerialLink`])
//! - Test fakes that record every call

use crate::error::Result;

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "native")]
pub use native::{SerialLink, detect_ports};

/// One logical connection to a device port.
///
/// A link starts closed; `open` may be called again after `close`, possibly
/// at a different baud rate.
pub trait DeviceLink: Send {
    /// Open the port at the given baud rate.
    fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Write all bytes and flush.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes. Returns 0 on timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Close the port and release the OS handle.
    ///
    /// Closing an already closed link is not an error.
    fn close(&mut self) -> Result<()>;

    /// Whether the port is currently open.
    fn is_open(&self) -> bool;

    /// Port name/path (e.g. "/dev/ttyUSB0", "COM3").
    fn name(&self) -> &str;
}

/// Grants device links, typically by asking the user to pick a port.
pub trait DeviceAccess: Send + Sync {
    /// Request a link to a device matching one of `filters`.
    ///
    /// Returns [`crate::Error::UserCancelled`] when the user dismisses the
    /// selection.
    fn request_access(&self, filters: &[UsbFilter]) -> Result<Box<dyn DeviceLink>>;
}

/// USB vendor filter used when asking for device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbFilter {
    /// USB vendor ID.
    pub vid: u16,
    /// Bridge family.
    pub kind: BridgeKind,
}

impl UsbFilter {
    /// Whether a port with this vendor ID passes the filter.
    pub fn matches(&self, vid: u16) -> bool {
        self.vid == vid
    }
}

/// Known USB-serial bridge families used by the target devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// WCH CH340/CH341/CH9102.
    Ch34x,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232/FT2232.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Espressif native USB-Serial/JTAG.
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Vendor filters for the bridge chips commonly found on the target boards.
pub const KNOWN_BRIDGES: &[UsbFilter] = &[
    UsbFilter {
        vid: 0x1A86,
        kind: BridgeKind::Ch34x,
    },
    UsbFilter {
        vid: 0x10C4,
        kind: BridgeKind::Cp210x,
    },
    UsbFilter {
        vid: 0x0403,
        kind: BridgeKind::Ftdi,
    },
    UsbFilter {
        vid: 0x067B,
        kind: BridgeKind::Prolific,
    },
    UsbFilter {
        vid: 0x303A,
        kind: BridgeKind::Espressif,
    },
];

impl BridgeKind {
    /// Classify a USB vendor ID.
    #[must_use]
    pub fn from_vid(vid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|f| f.matches(vid))
            .map_or(Self::Unknown, |f| f.kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch34x => "CH34x",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Espressif => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial port with metadata.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path.
    pub name: String,
    /// Classified bridge.
    pub bridge: BridgeKind,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Placeholder for a port named explicitly but not found during enumeration.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bridge: BridgeKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port passes any of the given filters.
    pub fn passes(&self, filters: &[UsbFilter]) -> bool {
        self.vid
            .is_some_and(|vid| filters.iter().any(|f| f.matches(vid)))
    }
}

/// Keep only ports passing one of `filters`.
pub fn filter_ports(ports: Vec<DetectedPort>, filters: &[UsbFilter]) -> Vec<DetectedPort> {
    ports.into_iter().filter(|p| p.passes(filters)).collect()
}
