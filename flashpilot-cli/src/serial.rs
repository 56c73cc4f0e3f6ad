//! Interactive serial port selection.
//!
//! Port choice follows this order:
//! - `--port` / `FLASHPILOT_PORT`
//! - `[port] serial` from the configuration
//! - the only recognised USB bridge, when exactly one is plugged in
//! - an interactive list (Esc dismisses it and cancels the update)
//!
//! Non-interactive mode never prompts and fails unless exactly one
//! candidate remains.

use {
    crate::{CliError, RunningUpdate, config::PortConfig},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    flashpilot::{
        DetectedPort, DeviceAccess, DeviceLink, Error, SerialLink, UsbFilter, detect_ports,
    },
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail unless exactly one candidate).
    pub non_interactive: bool,
    /// Ask before using a single recognised port.
    pub confirm_port: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(
    options: &SerialOptions,
    config: &PortConfig,
    filters: &[UsbFilter],
) -> Result<DetectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err("No serial ports found"));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config, filters))
        .cloned()
        .collect();
    let candidates = if known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(candidates);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config, filters)
        },
        Ordering::Equal => {
            let Some(port) = candidates.into_iter().next() else {
                return Err(usage_err("No serial ports available"));
            };
            if is_known_device(&port, config, filters) && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.bridge.name());
                Ok(port)
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn select_non_interactive_port(candidates: Vec<DetectedPort>) -> Result<DetectedPort> {
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(port), None) => Ok(port),
        (Some(_), Some(_)) => Err(usage_err(
            "Found multiple serial ports; pass --port in non-interactive mode",
        )),
        (None, _) => Err(usage_err("No serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled()
            } else {
                usage_err(&format!("Port prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name, falling back to a bare placeholder.
fn find_port_by_name(name: &str) -> DetectedPort {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.name == name) {
        return port.clone();
    }

    // Windows port names are case-insensitive
    if let Some(port) = ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
        return port.clone();
    }

    DetectedPort::named(name)
}

/// Whether the port is a recognised bridge or a configured USB device.
fn is_known_device(port: &DetectedPort, config: &PortConfig, filters: &[UsbFilter]) -> bool {
    if port.passes(filters) {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config.usb_device.iter().any(|d| d.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &PortConfig, filters: &[UsbFilter]) -> String {
    let name = if is_known_device(port, config, filters) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let bridge = if port.bridge.is_known() {
        format!(" [{}]", style(port.bridge.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{bridge}{product}")
}

fn select_port_interactive(
    mut ports: Vec<DetectedPort>,
    config: &PortConfig,
    filters: &[UsbFilter],
) -> Result<DetectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !is_known_device(p, config, filters));

    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| {
            console::truncate_str(&port_label(p, config, filters), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device to update (Esc to cancel)")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(cancelled()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<DetectedPort> {
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(port)
    } else {
        Err(cancelled())
    }
}

/// Grants serial links chosen on the console.
#[derive(Debug, Clone)]
pub struct ConsoleAccess {
    options: SerialOptions,
    config: PortConfig,
}

impl ConsoleAccess {
    /// Access backed by the given selection options and port configuration.
    pub fn new(options: SerialOptions, config: PortConfig) -> Self {
        Self { options, config }
    }
}

impl DeviceAccess for ConsoleAccess {
    fn request_access(&self, filters: &[UsbFilter]) -> flashpilot::Result<Box<dyn DeviceLink>> {
        let port = select_serial_port(&self.options, &self.config, filters)
            .map_err(into_access_error)?;
        debug!("Granting {} [{}]", port.name, port.bridge.name());
        RunningUpdate::device_granted();
        Ok(Box::new(SerialLink::new(port.name)))
    }
}

fn into_access_error(err: anyhow::Error) -> Error {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Cancelled(_)) => Error::UserCancelled,
        _ => Error::DeviceNotFound(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::config::UsbDevice,
        flashpilot::{BridgeKind, KNOWN_BRIDGES},
    };

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            bridge: vid.map_or(BridgeKind::Unknown, BridgeKind::from_vid),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_is_known_device_builtin() {
        let ch340 = port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523));
        assert!(is_known_device(&ch340, &PortConfig::default(), KNOWN_BRIDGES));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let other = port("/dev/ttyUSB0", Some(0x9999), Some(0x9999));
        assert!(!is_known_device(&other, &PortConfig::default(), KNOWN_BRIDGES));

        let bare = port("/dev/ttyS0", None, None);
        assert!(!is_known_device(&bare, &PortConfig::default(), KNOWN_BRIDGES));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let custom = port("/dev/ttyACM0", Some(0xABCD), Some(0x1234));
        let config = PortConfig {
            serial: None,
            usb_device: vec![UsbDevice {
                vid: 0xABCD,
                pid: 0x1234,
            }],
        };
        assert!(is_known_device(&custom, &config, KNOWN_BRIDGES));
    }

    #[test]
    fn test_port_label_shows_bridge() {
        console::set_colors_enabled(false);
        let mut cp2102 = port("COM3", Some(0x10C4), Some(0xEA60));
        cp2102.product = Some("CP2102 USB to UART".to_string());
        let label = port_label(&cp2102, &PortConfig::default(), KNOWN_BRIDGES);
        assert_eq!(label, "COM3 [CP210x] - CP2102 USB to UART");
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let selected = select_non_interactive_port(vec![port("/dev/ttyUSB0", None, None)]).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![
            port("/dev/ttyUSB0", None, None),
            port("/dev/ttyUSB1", None, None),
        ])
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_select_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![]).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_cancelled_selection_becomes_user_cancelled() {
        assert!(matches!(into_access_error(cancelled()), Error::UserCancelled));
        assert!(matches!(
            into_access_error(usage_err("No serial ports found")),
            Error::DeviceNotFound(ref msg) if msg == "No serial ports found"
        ));
    }
}
