//! Update manifest parsing.
//!
//! The manifest is a JSON document describing the project, the optional
//! preparation command, the device parameters and the ordered set of
//! firmware images to write:
//!
//! ```json
//! {
//!   "project": { "name": "demo", "version": "1.2.0" },
//!   "bootloadCommand": { "enabled": true, "command": "bootload", "baudrate": 115200, "timeout": 1500 },
//!   "device": { "baudrate": 460800, "flashSize": "4MB", "flashMode": "dio", "flashFreq": "40m" },
//!   "firmware": {
//!     "bootloader": { "file": "bootloader.bin", "address": "0x1000" },
//!     "app": { "file": "app.bin", "address": "0x10000" }
//!   }
//! }
//! ```
//!
//! Image order follows the document order of the `firmware` object.

use crate::error::{Error, Result};
use log::debug;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Project metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Project name.
    pub name: String,
    /// Firmware version string.
    #[serde(default)]
    pub version: String,
}

/// Application-level command that asks running firmware to enter its bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootloadCommand {
    /// Whether the preparation handshake runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Command text, sent followed by a newline.
    #[serde(default)]
    pub command: String,
    /// Baud rate the running application listens on.
    #[serde(default = "default_command_baud")]
    pub baudrate: u32,
    /// Time given to the application to act on the command, in milliseconds.
    #[serde(rename = "timeout", default)]
    pub timeout_ms: u64,
}

fn default_command_baud() -> u32 {
    115_200
}

impl BootloadCommand {
    /// Wait applied after the command is written.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BootloadCommand {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
            baudrate: default_command_baud(),
            timeout_ms: 0,
        }
    }
}

/// Device parameters handed to the bootloader client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    /// Baud rate for the bootloader connection.
    pub baudrate: u32,
    /// Flash size (`"4MB"`, `"detect"`, `"keep"`).
    #[serde(default = "keep")]
    pub flash_size: String,
    /// Flash mode (`"dio"`, `"qio"`, `"keep"`).
    #[serde(default = "keep")]
    pub flash_mode: String,
    /// Flash frequency (`"40m"`, `"80m"`, `"keep"`).
    #[serde(default = "keep")]
    pub flash_freq: String,
}

fn keep() -> String {
    "keep".to_string()
}

impl DeviceParams {
    /// Declared flash size in bytes, if the manifest names a concrete size.
    pub fn flash_size_bytes(&self) -> Option<u64> {
        parse_flash_size(&self.flash_size)
    }
}

/// One firmware image entry of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Logical image name (the key in the `firmware` object).
    pub name: String,
    /// File path, relative to the manifest location.
    pub file: String,
    /// Flash load address.
    pub address: u32,
}

/// Ordered collection of firmware images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImages(Vec<ImageEntry>);

impl FirmwareImages {
    /// Create from entries already in write order.
    pub fn new(entries: Vec<ImageEntry>) -> Self {
        Self(entries)
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the manifest lists no image.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in write order.
    pub fn iter(&self) -> std::slice::Iter<'_, ImageEntry> {
        self.0.iter()
    }

    /// Look up an image by logical name.
    pub fn get(&self, name: &str) -> Option<&ImageEntry> {
        self.0.iter().find(|e| e.name == name)
    }
}

impl<'a> IntoIterator for &'a FirmwareImages {
    type Item = &'a ImageEntry;
    type IntoIter = std::slice::Iter<'a, ImageEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Deserialize)]
struct RawImage {
    file: String,
    address: String,
}

struct FirmwareVisitor;

impl<'de> Visitor<'de> for FirmwareVisitor {
    type Value = FirmwareImages;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object mapping image names to {file, address}")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries: Vec<ImageEntry> = Vec::with_capacity(map.size_hint().unwrap_or(0));

        while let Some((name, raw)) = map.next_entry::<String, RawImage>()? {
            if entries.iter().any(|e| e.name == name) {
                return Err(de::Error::custom(format!("duplicate image '{name}'")));
            }
            let address = parse_hex_address(&raw.address).map_err(de::Error::custom)?;
            entries.push(ImageEntry {
                name,
                file: raw.file,
                address,
            });
        }

        Ok(FirmwareImages(entries))
    }
}

impl<'de> Deserialize<'de> for FirmwareImages {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(FirmwareVisitor)
    }
}

impl Serialize for FirmwareImages {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Out<'a> {
            file: &'a str,
            address: String,
        }

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in &self.0 {
            map.serialize_entry(
                &entry.name,
                &Out {
                    file: &entry.file,
                    address: format!("0x{:X}", entry.address),
                },
            )?;
        }
        map.end()
    }
}

/// Immutable update configuration, loaded once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    /// Project metadata.
    pub project: ProjectInfo,
    /// Preparation handshake settings.
    #[serde(default)]
    pub bootload_command: BootloadCommand,
    /// Bootloader connection and flash parameters.
    pub device: DeviceParams,
    /// Images to write, in order.
    pub firmware: FirmwareImages,
}

impl UpdateManifest {
    /// Parse and shape-check a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(text).map_err(|e| Error::Manifest(e.to_string()))?;
        manifest.validate()?;
        debug!(
            "Loaded manifest for {} {} ({} images)",
            manifest.project.name,
            manifest.project.version,
            manifest.firmware.len()
        );
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Basic shape checks. Address layout is checked separately by [`check_layout`].
    pub fn validate(&self) -> Result<()> {
        if self.firmware.is_empty() {
            return Err(Error::Manifest("no firmware images listed".into()));
        }
        if self.device.baudrate == 0 {
            return Err(Error::Manifest("device baudrate must be non-zero".into()));
        }
        if self.bootload_command.enabled {
            if self.bootload_command.command.trim().is_empty() {
                return Err(Error::Manifest(
                    "bootloadCommand is enabled but has no command".into(),
                ));
            }
            if self.bootload_command.baudrate == 0 {
                return Err(Error::Manifest(
                    "bootloadCommand baudrate must be non-zero".into(),
                ));
            }
        }
        for entry in &self.firmware {
            if entry.file.trim().is_empty() {
                return Err(Error::Manifest(format!(
                    "image '{}' has an empty file path",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}

/// Parse a hexadecimal address (optional `0x` prefix, `_` separators allowed).
pub fn parse_hex_address(s: &str) -> Result<u32> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = digits.chars().filter(|c| *c != '_').collect();

    if digits.is_empty() {
        return Err(Error::InvalidAddress {
            value: s.to_string(),
            reason: "empty".into(),
        });
    }

    u32::from_str_radix(&digits, 16).map_err(|e| Error::InvalidAddress {
        value: s.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a flash size such as `"4MB"` or `"512KB"`.
///
/// Returns `None` for `"detect"`, `"keep"` and anything unrecognised.
pub fn parse_flash_size(s: &str) -> Option<u64> {
    let upper = s.trim().to_ascii_uppercase();
    let (digits, unit) = if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else {
        return None;
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(unit)
}

/// Address range of an image, used for the layout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpan<'a> {
    /// Logical image name.
    pub name: &'a str,
    /// Load address.
    pub address: u32,
    /// Image length in bytes.
    pub len: u64,
}

impl ImageSpan<'_> {
    fn end(&self) -> u64 {
        u64::from(self.address).saturating_add(self.len)
    }
}

/// A suspicious image placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutWarning {
    /// Two images share flash bytes.
    Overlap {
        /// Image with the lower address.
        first: String,
        /// Image starting inside `first`.
        second: String,
    },
    /// An image ends past the declared flash size.
    ExceedsFlash {
        /// Image name.
        name: String,
        /// First address past the image.
        end: u64,
        /// Declared flash size.
        flash_size: u64,
    },
}

impl fmt::Display for LayoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap { first, second } => {
                write!(f, "image '{second}' overlaps image '{first}'")
            },
            Self::ExceedsFlash {
                name,
                end,
                flash_size,
            } => write!(
                f,
                "image '{name}' ends at 0x{end:X}, past the {flash_size}-byte flash"
            ),
        }
    }
}

/// Check image placement for overlaps and flash bounds.
///
/// The orchestrator trusts the manifest author; this only reports.
pub fn check_layout(spans: &[ImageSpan<'_>], flash_size: Option<u64>) -> Vec<LayoutWarning> {
    let mut warnings = Vec::new();

    let mut sorted: Vec<&ImageSpan<'_>> = spans.iter().collect();
    sorted.sort_by_key(|s| s.address);

    // Furthest end seen so far, and the image that reaches it.
    let mut reach: Option<(&str, u64)> = None;
    for span in sorted {
        if let Some((name, end)) = reach {
            if u64::from(span.address) < end {
                warnings.push(LayoutWarning::Overlap {
                    first: name.to_string(),
                    second: span.name.to_string(),
                });
            }
        }
        if reach.is_none_or(|(_, end)| span.end() > end) {
            reach = Some((span.name, span.end()));
        }
    }

    if let Some(size) = flash_size {
        for span in spans {
            if span.end() > size {
                warnings.push(LayoutWarning::ExceedsFlash {
                    name: span.name.to_string(),
                    end: span.end(),
                    flash_size: size,
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "project": { "name": "demo", "version": "1.2.0" },
        "bootloadCommand": { "enabled": true, "command": "bootload", "baudrate": 115200, "timeout": 1500 },
        "device": { "baudrate": 460800, "flashSize": "4MB", "flashMode": "dio", "flashFreq": "40m" },
        "firmware": {
            "partitions": { "file": "partitions.bin", "address": "0x8000" },
            "bootloader": { "file": "bootloader.bin", "address": "0x1000" },
            "app": { "file": "app.bin", "address": "0x10000" }
        }
    }"#;

    #[test]
    fn test_parse_manifest() {
        let m = UpdateManifest::from_json(MANIFEST).unwrap();
        assert_eq!(m.project.name, "demo");
        assert!(m.bootload_command.enabled);
        assert_eq!(m.bootload_command.timeout(), Duration::from_millis(1500));
        assert_eq!(m.device.baudrate, 460800);
        assert_eq!(m.device.flash_size_bytes(), Some(4 * 1024 * 1024));
    }

    #[test]
    fn test_firmware_keeps_document_order() {
        let m = UpdateManifest::from_json(MANIFEST).unwrap();
        let names: Vec<&str> = m.firmware.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["partitions", "bootloader", "app"]);
        assert_eq!(m.firmware.get("app").unwrap().address, 0x10000);
    }

    #[test]
    fn test_missing_bootload_command_is_disabled() {
        let m = UpdateManifest::from_json(
            r#"{"project":{"name":"x"},"device":{"baudrate":115200},
                "firmware":{"app":{"file":"a.bin","address":"10000"}}}"#,
        )
        .unwrap();
        assert!(!m.bootload_command.enabled);
        assert_eq!(m.device.flash_mode, "keep");
    }

    #[test]
    fn test_bad_address_is_rejected() {
        let err = UpdateManifest::from_json(
            r#"{"project":{"name":"x"},"device":{"baudrate":115200},
                "firmware":{"app":{"file":"a.bin","address":"0xZZ"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }

    #[test]
    fn test_duplicate_image_is_rejected() {
        let err = UpdateManifest::from_json(
            r#"{"project":{"name":"x"},"device":{"baudrate":115200},
                "firmware":{"app":{"file":"a.bin","address":"0"},"app":{"file":"b.bin","address":"0"}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_enabled_command_requires_text() {
        let err = UpdateManifest::from_json(
            r#"{"project":{"name":"x"},"bootloadCommand":{"enabled":true,"command":" "},
                "device":{"baudrate":115200},
                "firmware":{"app":{"file":"a.bin","address":"0"}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn test_empty_firmware_is_rejected() {
        let err = UpdateManifest::from_json(
            r#"{"project":{"name":"x"},"device":{"baudrate":115200},"firmware":{}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }

    #[test]
    fn test_parse_hex_address() {
        assert_eq!(parse_hex_address("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address("0X1000").unwrap(), 0x1000);
        assert_eq!(parse_hex_address(" 10000 ").unwrap(), 0x10000);
        assert_eq!(parse_hex_address("0x00_80_00_00").unwrap(), 0x0080_0000);
        assert!(parse_hex_address("0x").is_err());
        assert!(parse_hex_address("-1").is_err());
        assert!(parse_hex_address("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_flash_size() {
        assert_eq!(parse_flash_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_flash_size("512kb"), Some(512 * 1024));
        assert_eq!(parse_flash_size("detect"), None);
        assert_eq!(parse_flash_size("keep"), None);
    }

    #[test]
    fn test_parse_flash_size_overflow_is_unknown() {
        assert_eq!(parse_flash_size("20000000000000MB"), None);
        assert_eq!(parse_flash_size("18446744073709551615KB"), None);
    }

    #[test]
    fn test_serialize_round_trips_addresses_as_hex() {
        let m = UpdateManifest::from_json(MANIFEST).unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["firmware"]["app"]["address"], "0x10000");
        assert_eq!(json["bootloadCommand"]["timeout"], 1500);
    }

    #[test]
    fn test_check_layout_reports_overlap_and_bounds() {
        let spans = [
            ImageSpan {
                name: "bootloader",
                address: 0x1000,
                len: 0x8000,
            },
            ImageSpan {
                name: "partitions",
                address: 0x8000,
                len: 0xC00,
            },
            ImageSpan {
                name: "app",
                address: 0x3F_0000,
                len: 0x2_0000,
            },
        ];

        let warnings = check_layout(&spans, Some(4 * 1024 * 1024));
        assert_eq!(warnings.len(), 2);
        assert_eq!(
            warnings[0],
            LayoutWarning::Overlap {
                first: "bootloader".into(),
                second: "partitions".into(),
            }
        );
        assert!(matches!(&warnings[1], LayoutWarning::ExceedsFlash { name, .. } if name == "app"));
    }

    #[test]
    fn test_check_layout_nested_images() {
        let spans = [
            ImageSpan {
                name: "big",
                address: 0x0,
                len: 0x10000,
            },
            ImageSpan {
                name: "small",
                address: 0x1000,
                len: 0x100,
            },
            ImageSpan {
                name: "later",
                address: 0x8000,
                len: 0x100,
            },
        ];
        let warnings = check_layout(&spans, None);
        assert_eq!(warnings.len(), 2);
        assert!(
            warnings
                .iter()
                .all(|w| matches!(w, LayoutWarning::Overlap { first, .. } if first == "big"))
        );
    }

    #[test]
    fn test_check_layout_adjacent_images_are_fine() {
        let spans = [
            ImageSpan {
                name: "a",
                address: 0x0,
                len: 0x1000,
            },
            ImageSpan {
                name: "b",
                address: 0x1000,
                len: 0x1000,
            },
        ];
        assert!(check_layout(&spans, None).is_empty());
    }
}
