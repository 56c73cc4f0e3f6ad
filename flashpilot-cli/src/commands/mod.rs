//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod prepare;
pub(crate) mod update;

use {
    anyhow::{Context, Result},
    flashpilot::UpdateManifest,
    std::path::Path,
};

/// Load and shape-check a manifest file.
pub(crate) fn load_manifest(path: &Path) -> Result<UpdateManifest> {
    UpdateManifest::from_file(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))
}
