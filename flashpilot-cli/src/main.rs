//! flashpilot CLI - guided firmware updates for serial-bootloader boards.
//!
//! ## Features
//!
//! - Run a complete update session from an update manifest
//! - Send only the preparation command to running firmware
//! - Inspect a manifest and its image layout
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

mod commands;
mod config;
mod engine;
mod serial;
mod sink;

use config::Config;
use serial::SerialOptions;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set while an update session may be writing to the device.
static UPDATE_RUNNING: AtomicBool = AtomicBool::new(false);

/// Set once port selection has handed a device to the running update.
static DEVICE_GRANTED: AtomicBool = AtomicBool::new(false);

/// Ctrl-C presses seen while an update was running.
static INTERRUPTS: AtomicU8 = AtomicU8::new(0);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Marks an update as running until dropped.
pub(crate) struct RunningUpdate;

impl RunningUpdate {
    pub(crate) fn begin() -> Self {
        INTERRUPTS.store(0, Ordering::Relaxed);
        DEVICE_GRANTED.store(false, Ordering::Relaxed);
        UPDATE_RUNNING.store(true, Ordering::Relaxed);
        Self
    }

    /// From now on the device may be mid-update.
    pub(crate) fn device_granted() {
        DEVICE_GRANTED.store(true, Ordering::Relaxed);
    }
}

impl Drop for RunningUpdate {
    fn drop(&mut self) {
        UPDATE_RUNNING.store(false, Ordering::Relaxed);
        DEVICE_GRANTED.store(false, Ordering::Relaxed);
    }
}

/// Whether a Ctrl-C press should exit now instead of only warning.
///
/// Only the first press after a device was granted is held back.
fn interrupt_exits() -> bool {
    let device_busy =
        UPDATE_RUNNING.load(Ordering::Relaxed) && DEVICE_GRANTED.load(Ordering::Relaxed);
    !device_busy || INTERRUPTS.fetch_add(1, Ordering::Relaxed) > 0
}

/// Errors with a dedicated process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// The user backed out; exit code 130.
    #[error("{0}")]
    Cancelled(String),
    /// The update session ended in `Failed`; exit code 1.
    #[error("{0}")]
    UpdateFailed(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
            Self::UpdateFailed(_) => 1,
        }
    }
}

/// flashpilot - guided firmware updates for serial-bootloader microcontrollers.
///
/// Environment variables:
///   FLASHPILOT_PORT              - Default serial port
///   FLASHPILOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
///   FLASHPILOT_ESPTOOL           - esptool executable used for flashing
#[derive(Parser)]
#[command(name = "flashpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (selected interactively if not specified).
    #[arg(short, long, global = true, env = "FLASHPILOT_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "FLASHPILOT_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for a single recognised port.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// esptool executable used for flashing.
    #[arg(long, global = true, env = "FLASHPILOT_ESPTOOL", value_name = "PROGRAM")]
    pub(crate) esptool: Option<String>,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub(crate) fn serial_options(&self) -> SerialOptions {
        SerialOptions {
            port: self.port.clone(),
            non_interactive: self.non_interactive,
            confirm_port: self.confirm_port,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run a complete firmware update from a manifest.
    Update {
        /// Path to the update manifest (JSON).
        manifest: PathBuf,
    },

    /// Only ask the running firmware to enter its bootloader.
    Prepare {
        /// Path to the update manifest (JSON).
        manifest: PathBuf,
    },

    /// Show the contents of an update manifest.
    Info {
        /// Path to the update manifest (JSON).
        manifest: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if interrupt_exits() {
            std::process::exit(130);
        } else {
            eprintln!(
                "\n{} Interrupting now may leave the device unable to boot. \
                 Press Ctrl-C again to abort anyway.",
                console::style("warning:").yellow().bold()
            );
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_with(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Update { manifest } => commands::update::cmd_update(cli, &config, manifest),
        Commands::Prepare { manifest } => commands::prepare::cmd_prepare(cli, &config, manifest),
        Commands::Info { manifest, json } => commands::info::cmd_info(manifest, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "flashpilot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        let code = err
            .downcast_ref::<CliError>()
            .map_or(1, CliError::exit_code);
        eprintln!("{} {err:#}", console::style("Error:").red().bold());
        std::process::exit(code);
    }
}
