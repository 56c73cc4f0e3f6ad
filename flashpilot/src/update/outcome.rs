//! Phase results and terminal failure causes.

use thiserror::Error;

/// Result of one orchestrator phase.
///
/// `SoftFailure` is logged and the sequence continues; `Fatal` ends the
/// session through the single failure-reporting path.
#[derive(Debug)]
#[must_use]
pub enum PhaseOutcome<T = ()> {
    /// Phase succeeded.
    Continue(T),
    /// Phase failed in a way that does not affect the update.
    SoftFailure(String),
    /// Phase failed and the session must end.
    Fatal(FailureCause),
}

/// Why an update session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    /// The user dismissed device selection.
    #[error("No device selected")]
    NoDeviceSelected,

    /// Device access failed for a reason other than cancellation.
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No bootloader answered the handshake.
    #[error("Bootloader unreachable: {0}")]
    BootloaderUnreachable(String),

    /// A firmware image could not be fetched.
    #[error("Failed to load image '{name}': {reason}")]
    ImageLoadFailed {
        /// Logical image name from the manifest.
        name: String,
        /// Underlying cause.
        reason: String,
    },

    /// The bootloader client failed while writing. Carries the client message as-is.
    #[error("Flash write failed: {0}")]
    FlashWriteFailed(String),
}

const HINT_SELECT: &str = "Select the device's serial port to start the update.";
const HINT_PORT_BUSY: &str =
    "Another program is using the serial port. Close serial monitors and IDEs, then try again.";
const HINT_CHECK_CABLE: &str = "Check the USB cable and that the device is powered, then try again.";
const HINT_BOOT_BUTTON: &str = "Hold the device's BOOT button while the update connects, \
     then release it once writing starts and try again.";
const HINT_BUSY_THEN_BOOT: &str = "Close serial monitors and IDEs using the port, then hold the \
     device's BOOT button while the update connects and try again.";
const HINT_FILES: &str = "Check that every firmware file listed in the manifest is present.";
const HINT_UNSTABLE_LINK: &str =
    "The connection dropped while writing. Try another USB cable or port, then run the update again.";
const HINT_RETRY: &str = "Power-cycle the device and run the update again.";

impl FailureCause {
    /// Short name of the failure category.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoDeviceSelected => "no-device-selected",
            Self::DeviceUnavailable(_) => "device-unavailable",
            Self::BootloaderUnreachable(_) => "bootloader-unreachable",
            Self::ImageLoadFailed { .. } => "image-load-failed",
            Self::FlashWriteFailed(_) => "flash-write-failed",
        }
    }

    /// User-facing hint, picked by category and by keywords in the cause message.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::NoDeviceSelected => HINT_SELECT,
            Self::DeviceUnavailable(msg) if mentions(msg, PORT_BUSY) => HINT_PORT_BUSY,
            Self::DeviceUnavailable(_) => HINT_CHECK_CABLE,
            Self::BootloaderUnreachable(msg) if mentions(msg, PORT_BUSY) => HINT_BUSY_THEN_BOOT,
            Self::BootloaderUnreachable(_) => HINT_BOOT_BUTTON,
            Self::ImageLoadFailed { .. } => HINT_FILES,
            Self::FlashWriteFailed(msg)
                if mentions(msg, &["timed out", "timeout", "disconnected", "broken pipe"]) =>
            {
                HINT_UNSTABLE_LINK
            },
            Self::FlashWriteFailed(_) => HINT_RETRY,
        }
    }
}

const PORT_BUSY: &[&str] = &["busy", "access denied", "permission denied", "in use"];

fn mentions(message: &str, needles: &[&str]) -> bool {
    let lower = message.to_ascii_lowercase();
    needles.iter().any(|n| lower.contains(n))
}
