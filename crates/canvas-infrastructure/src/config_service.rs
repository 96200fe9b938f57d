//! Configuration service implementation.
//!
//! This module provides a ConfigService that loads the engine configuration
//! from the configuration file (~/.config/canvas/config.toml).

use crate::paths::CanvasPaths;
use canvas_core::{CanvasError, EngineConfig, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Configuration service that loads and caches the engine configuration.
///
/// A missing or empty file yields the defaults. The cache is filled lazily on
/// first access.
#[derive(Debug, Clone)]
pub struct ConfigService {
    paths: CanvasPaths,
    config: Arc<RwLock<Option<EngineConfig>>>,
}

impl ConfigService {
    pub fn new(paths: CanvasPaths) -> Self {
        Self {
            paths,
            config: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config_path(&self) -> Result<PathBuf> {
        self.paths.config_file()
    }

    /// Gets the engine configuration, loading from file if not cached.
    ///
    /// # Errors
    ///
    /// Returns `CanvasError::Config` if the file cannot be parsed or holds
    /// invalid values.
    pub fn get_config(&self) -> Result<EngineConfig> {
        {
            let read_lock = self.config.read().map_err(|_| poisoned())?;
            if let Some(cached) = read_lock.as_ref() {
                return Ok(cached.clone());
            }
        }

        let loaded = Self::load_from(&self.config_path()?)?;

        let mut write_lock = self.config.write().map_err(|_| poisoned())?;
        *write_lock = Some(loaded.clone());
        Ok(loaded)
    }

    /// Invalidates the cache, forcing a reload on next access.
    pub fn invalidate_cache(&self) -> Result<()> {
        let mut write_lock = self.config.write().map_err(|_| poisoned())?;
        *write_lock = None;
        Ok(())
    }

    /// Writes `config` to the config file and refreshes the cache.
    pub fn save(&self, config: &EngineConfig) -> Result<()> {
        config.validate()?;
        let path = self.config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| CanvasError::config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(&path, text)?;
        tracing::info!("[ConfigService] saved config to {}", path.display());

        let mut write_lock = self.config.write().map_err(|_| poisoned())?;
        *write_lock = Some(config.clone());
        Ok(())
    }

    /// Parses and validates a config file.
    pub fn load_from(path: &Path) -> Result<EngineConfig> {
        if !path.exists() {
            tracing::debug!(
                "[ConfigService] {} not found, using defaults",
                path.display()
            );
            return Ok(EngineConfig::default());
        }

        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| CanvasError::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!("[ConfigService] loaded config from {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new(CanvasPaths::default())
    }
}

fn poisoned() -> CanvasError {
    CanvasError::internal("config cache lock poisoned")
}
