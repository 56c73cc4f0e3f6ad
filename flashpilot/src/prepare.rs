//! Preparation handshake.
//!
//! Some application firmware has to shut down peripherals before it can
//! safely reboot into the bootloader. The handshake writes a text command
//! to the running application and then waits a fixed time; no reply is
//! parsed. The device state is unknown to the host, so every failure here
//! is soft: a device already sitting in its bootloader will not accept the
//! command, and that is fine.

use crate::error::Result;
use crate::link::DeviceLink;
use crate::manifest::BootloadCommand;
use crate::update::PhaseOutcome;
use log::{debug, info, trace};
use std::thread;
use std::time::Duration;

/// Pause after closing the link, before the bootloader connection is attempted.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Ask a running application to reboot into its bootloader.
///
/// Opens `link` at the command baud rate, writes the command followed by a
/// newline, waits the full command timeout, closes the link and waits
/// `settle`. Never fails the update: errors come back as
/// [`PhaseOutcome::SoftFailure`] with the link force-closed.
pub fn request_bootloader(
    link: &mut dyn DeviceLink,
    command: &BootloadCommand,
    settle: Duration,
) -> PhaseOutcome<()> {
    info!(
        "Sending preparation command to {} at {} baud",
        link.name(),
        command.baudrate
    );

    match send_and_wait(link, command, settle) {
        Ok(()) => {
            debug!("Preparation handshake complete");
            PhaseOutcome::Continue(())
        },
        Err(e) => {
            if let Err(close_err) = link.close() {
                trace!("Force-close after preparation failure: {close_err}");
            }
            PhaseOutcome::SoftFailure(format!(
                "Preparation command not delivered ({e}); the device may already be in bootloader mode"
            ))
        },
    }
}

fn send_and_wait(
    link: &mut dyn DeviceLink,
    command: &BootloadCommand,
    settle: Duration,
) -> Result<()> {
    link.open(command.baudrate)?;

    let mut line = command
        .command
        .trim_end_matches(['\r', '\n'])
        .as_bytes()
        .to_vec();
    line.push(b'\n');
    link.write(&line)?;

    thread::sleep(command.timeout());
    link.close()?;
    thread::sleep(settle);
    Ok(())
}
