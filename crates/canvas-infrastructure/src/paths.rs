//! Path management for canvas configuration files.
//!
//! # Directory Structure
//!
//! ```text
//! ~/.config/canvas/            # Config directory (dirs::config_dir)
//! └── config.toml              # Engine configuration
//! ```
//!
//! `CANVAS_CONFIG_PATH` overrides the location of `config.toml`.

use canvas_core::{CanvasError, Result};
use std::path::PathBuf;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "CANVAS_CONFIG_PATH";

const APP_DIR: &str = "canvas";
const CONFIG_FILE: &str = "config.toml";

/// Resolves canvas paths, optionally relative to a custom base directory.
#[derive(Debug, Clone, Default)]
pub struct CanvasPaths {
    base: Option<PathBuf>,
}

impl CanvasPaths {
    /// Creates a resolver.
    ///
    /// # Arguments
    ///
    /// * `base` - Directory used instead of the platform config directory
    pub fn new(base: Option<PathBuf>) -> Self {
        Self { base }
    }

    /// Returns the canvas configuration directory.
    ///
    /// # Errors
    ///
    /// Returns `CanvasError::Config` if the platform has no config directory.
    pub fn config_dir(&self) -> Result<PathBuf> {
        match &self.base {
            Some(base) => Ok(base.clone()),
            None => dirs::config_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or_else(|| CanvasError::config("cannot determine the config directory")),
        }
    }

    /// Returns the path to `config.toml`.
    ///
    /// Without a custom base, `CANVAS_CONFIG_PATH` takes precedence.
    pub fn config_file(&self) -> Result<PathBuf> {
        let overridden = self
            .base
            .is_none()
            .then(|| std::env::var_os(CONFIG_PATH_ENV))
            .flatten()
            .filter(|p| !p.is_empty());
        if let Some(path) = overridden {
            return Ok(PathBuf::from(path));
        }
        Ok(self.config_dir()?.join(CONFIG_FILE))
    }
}
