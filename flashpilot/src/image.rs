//! Firmware image sources.

use crate::error::{Error, Result};
use log::debug;
use std::path::{Path, PathBuf};

/// Fetches firmware image bytes named by the manifest.
pub trait ImageSource: Send + Sync {
    /// Fetch the complete content of `file` for image `name`.
    fn fetch(&self, name: &str, file: &str) -> Result<Vec<u8>>;
}

/// Reads images from the filesystem, relative to a base directory.
#[derive(Debug, Clone)]
pub struct FileImageSource {
    base_dir: PathBuf,
}

impl FileImageSource {
    /// Resolve relative image paths against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve relative image paths against the directory holding `manifest_path`.
    pub fn beside(manifest_path: &Path) -> Self {
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::new(dir)
    }

    /// Full path for a manifest file entry.
    pub fn resolve(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }
}

impl ImageSource for FileImageSource {
    fn fetch(&self, name: &str, file: &str) -> Result<Vec<u8>> {
        let path = self.resolve(file);
        let data = std::fs::read(&path).map_err(|e| Error::ImageFetch {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Loaded {name} from {} ({} bytes)", path.display(), data.len());
        Ok(data)
    }
}
