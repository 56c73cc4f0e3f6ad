//! Prepare command: send only the preparation command.

use {
    super::load_manifest,
    crate::{Cli, CliError, config::Config, serial::select_serial_port},
    anyhow::Result,
    console::style,
    flashpilot::{
        KNOWN_BRIDGES, PhaseOutcome, SerialLink,
        prepare::{DEFAULT_SETTLE_DELAY, request_bootloader},
    },
    std::path::Path,
};

/// Prepare command implementation.
pub(crate) fn cmd_prepare(cli: &Cli, config: &Config, manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let command = &manifest.bootload_command;

    if !command.enabled {
        return Err(CliError::Usage(format!(
            "{} has no enabled bootloadCommand",
            manifest_path.display()
        ))
        .into());
    }

    let port = select_serial_port(&cli.serial_options(), &config.port, KNOWN_BRIDGES)?;
    if !cli.quiet {
        eprintln!(
            "{} Sending '{}' to {} at {} baud",
            style("🔌").cyan(),
            command.command.trim_end(),
            style(&port.name).green(),
            command.baudrate
        );
    }

    let mut link = SerialLink::new(port.name);
    let settle = config.settle_delay().unwrap_or(DEFAULT_SETTLE_DELAY);
    match request_bootloader(&mut link, command, settle) {
        PhaseOutcome::Continue(()) => {
            if !cli.quiet {
                eprintln!(
                    "{} Preparation command sent; the device should now be in bootloader mode",
                    style("✓").green()
                );
            }
            Ok(())
        },
        PhaseOutcome::SoftFailure(message) => Err(CliError::UpdateFailed(message).into()),
        PhaseOutcome::Fatal(cause) => Err(CliError::UpdateFailed(cause.to_string()).into()),
    }
}
