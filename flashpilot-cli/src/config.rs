//! Configuration file support for flashpilot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FLASHPILOT_*)
//! 3. File given with `--config`
//! 4. Local config file (./flashpilot.toml)
//! 5. Global config file (~/.config/flashpilot/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "flashpilot.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Port selection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Extra USB devices treated as known bridges.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Update session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Pause after the preparation handshake, in milliseconds.
    pub settle_delay_ms: Option<u64>,
}

/// External flashing engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine executable (default `esptool`).
    pub program: Option<String>,
    /// Extra arguments placed before every engine command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Update configuration.
    #[serde(default)]
    pub update: UpdateConfig,
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load the global and local configuration files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load the usual sources, then layer the file given with `--config` on top.
    pub fn load_with(path: &Path) -> Self {
        let mut config = Self::load();
        if let Some(explicit) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config.merge(explicit);
        } else {
            warn!(
                "Could not load config from {}, ignoring it",
                path.display()
            );
        }
        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "flashpilot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Pause after the preparation handshake, if configured.
    pub fn settle_delay(&self) -> Option<Duration> {
        self.update.settle_delay_ms.map(Duration::from_millis)
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        if other.update.settle_delay_ms.is_some() {
            self.update.settle_delay_ms = other.update.settle_delay_ms;
        }

        if other.engine.program.is_some() {
            self.engine.program = other.engine.program;
        }
        if !other.engine.args.is_empty() {
            self.engine.args = other.engine.args;
        }
    }
}
