//! Manifest info and port listing command implementations.

use {
    super::load_manifest,
    anyhow::Result,
    console::style,
    flashpilot::{
        FileImageSource, KNOWN_BRIDGES, LayoutWarning, UpdateManifest, check_layout,
        detect_ports, manifest::ImageSpan,
    },
    std::{fs, path::Path},
};

/// On-disk size of every image, `None` when the file is missing.
fn image_sizes(manifest: &UpdateManifest, source: &FileImageSource) -> Vec<Option<u64>> {
    manifest
        .firmware
        .iter()
        .map(|entry| fs::metadata(source.resolve(&entry.file)).ok().map(|m| m.len()))
        .collect()
}

/// Layout warnings for the images that exist on disk.
fn layout_warnings(manifest: &UpdateManifest, sizes: &[Option<u64>]) -> Vec<LayoutWarning> {
    let spans: Vec<ImageSpan<'_>> = manifest
        .firmware
        .iter()
        .zip(sizes)
        .filter_map(|(entry, size)| {
            size.map(|len| ImageSpan {
                name: &entry.name,
                address: entry.address,
                len,
            })
        })
        .collect();
    check_layout(&spans, manifest.device.flash_size_bytes())
}

/// Info command implementation.
pub(crate) fn cmd_info(manifest_path: &Path, json: bool) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let sizes = image_sizes(&manifest, &FileImageSource::beside(manifest_path));
    let warnings = layout_warnings(&manifest, &sizes);

    if json {
        return print_info_json(&manifest, &sizes, &warnings);
    }

    eprintln!("{}", style("Update manifest").bold().underlined());
    eprintln!(
        "  Project: {} {}",
        style(&manifest.project.name).cyan().bold(),
        manifest.project.version
    );

    let command = &manifest.bootload_command;
    if command.enabled {
        eprintln!(
            "  Preparation: '{}' at {} baud, wait {} ms",
            command.command.trim_end(),
            command.baudrate,
            command.timeout_ms
        );
    } else {
        eprintln!("  Preparation: {}", style("disabled").dim());
    }

    let device = &manifest.device;
    eprintln!(
        "  Device: {} baud, flash {} / {} / {}",
        device.baudrate, device.flash_size, device.flash_mode, device.flash_freq
    );

    eprintln!("\n{}", style("Images").bold().underlined());
    for (i, (entry, size)) in manifest.firmware.iter().zip(&sizes).enumerate() {
        let size = size.map_or_else(
            || style("missing").red().to_string(),
            |len| format!("{len} bytes"),
        );
        eprintln!(
            "  [{:2}] {} @ 0x{:08X}  {} ({})",
            i,
            style(&entry.name).cyan().bold(),
            entry.address,
            entry.file,
            size
        );
    }

    for warning in &warnings {
        eprintln!("{} {warning}", style("warning:").yellow().bold());
    }

    Ok(())
}

/// Info command `--json` output: structured JSON to stdout.
fn print_info_json(
    manifest: &UpdateManifest,
    sizes: &[Option<u64>],
    warnings: &[LayoutWarning],
) -> Result<()> {
    let images: Vec<serde_json::Value> = manifest
        .firmware
        .iter()
        .zip(sizes)
        .map(|(entry, size)| {
            serde_json::json!({
                "name": entry.name,
                "file": entry.file,
                "address": format!("0x{:08X}", entry.address),
                "size": size,
                "present": size.is_some(),
            })
        })
        .collect();

    let info = serde_json::json!({
        "ok": true,
        "data": {
            "project": manifest.project,
            "bootloadCommand": manifest.bootload_command,
            "device": manifest.device,
            "images": images,
            "warnings": warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "bridge": p.bridge.name(),
                    "known": p.passes(KNOWN_BRIDGES),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let bridge = if port.bridge.is_known() {
            format!(" [{}]", style(port.bridge.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{bridge}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "project": { "name": "demo", "version": "1.0.0" },
        "device": { "baudrate": 460800, "flashSize": "64KB" },
        "firmware": {
            "boot": { "file": "boot.bin", "address": "0x1000" },
            "app": { "file": "app.bin", "address": "0x8000" },
            "data": { "file": "data.bin", "address": "0xF000" }
        }
    }"#;

    #[test]
    fn test_image_sizes_marks_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("boot.bin"), vec![0u8; 0x100]).unwrap();
        fs::write(dir.path().join("app.bin"), vec![0u8; 0x200]).unwrap();

        let manifest = UpdateManifest::from_json(MANIFEST).unwrap();
        let sizes = image_sizes(&manifest, &FileImageSource::new(dir.path()));
        assert_eq!(sizes, vec![Some(0x100), Some(0x200), None]);
    }

    #[test]
    fn test_layout_warnings_use_file_sizes() {
        let manifest = UpdateManifest::from_json(MANIFEST).unwrap();

        assert!(layout_warnings(&manifest, &[Some(0x100), Some(0x200), None]).is_empty());

        let warnings = layout_warnings(&manifest, &[Some(0x8000), Some(0x200), Some(0x2000)]);
        assert_eq!(
            warnings,
            vec![
                LayoutWarning::Overlap {
                    first: "boot".into(),
                    second: "app".into(),
                },
                LayoutWarning::ExceedsFlash {
                    name: "data".into(),
                    end: 0x11000,
                    flash_size: 0x10000,
                },
            ]
        );
    }
}
