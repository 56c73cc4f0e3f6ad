//! Update command implementation.

use {
    super::load_manifest,
    crate::{
        Cli, CliError, RunningUpdate, config::Config, engine, engine::EsptoolEngine,
        serial::ConsoleAccess, sink::ConsoleSink, use_fancy_output,
    },
    anyhow::{Result, anyhow},
    console::style,
    flashpilot::{FailureCause, FileImageSource, StartOutcome, UpdateReport, Updater},
    log::debug,
    std::path::Path,
};

/// Engine executable: `--esptool`/`FLASHPILOT_ESPTOOL`, then config, then the default.
fn engine_for(cli: &Cli, config: &Config) -> EsptoolEngine {
    let program = cli
        .esptool
        .clone()
        .or_else(|| config.engine.program.clone())
        .unwrap_or_else(|| engine::DEFAULT_PROGRAM.to_string());
    EsptoolEngine::new(program, config.engine.args.clone())
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &Config, manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;

    if !cli.quiet {
        eprintln!(
            "{} {} {} ({} images)",
            style("📦").cyan(),
            style(&manifest.project.name).bold(),
            manifest.project.version,
            manifest.firmware.len()
        );
        for entry in &manifest.firmware {
            eprintln!(
                "    {} {} @ 0x{:08X} ({})",
                style("•").dim(),
                entry.name,
                entry.address,
                entry.file
            );
        }
    }

    let mut updater = Updater::new(
        manifest,
        ConsoleAccess::new(cli.serial_options(), config.port.clone()),
        FileImageSource::beside(manifest_path),
        engine_for(cli, config),
        ConsoleSink::new(cli.quiet, use_fancy_output()),
    );
    if let Some(delay) = config.settle_delay() {
        updater = updater.with_settle_delay(delay);
    }

    let outcome = {
        let _running = RunningUpdate::begin();
        updater.start()
    };

    match outcome {
        StartOutcome::Finished(report) => conclude(&report),
        StartOutcome::Busy => Err(anyhow!("An update is already running")),
    }
}

fn conclude(report: &UpdateReport) -> Result<()> {
    debug!("Session {} phases: {:?}", report.session, report.history);
    match report.cause() {
        None => Ok(()),
        Some(FailureCause::NoDeviceSelected) => {
            Err(CliError::Cancelled(FailureCause::NoDeviceSelected.to_string()).into())
        },
        // Port selection refused to pick a device: same class as `prepare`
        Some(FailureCause::DeviceUnavailable(message)) => {
            Err(CliError::Usage(message.clone()).into())
        },
        Some(cause) => Err(CliError::UpdateFailed(cause.to_string()).into()),
    }
}
