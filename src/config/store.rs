use std::path::{Path, PathBuf};

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration loaded from a TOML file
///
/// A missing file is not an error: the store falls back to defaults so the
/// binary can run without any configuration on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: AppConfig,
}

impl ConfigStore {
    /// Load configuration from `path`, or defaults when `path` is `None`
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::read_file(path).await?,
            None => AppConfig::default(),
        };
        config.validate()?;

        Ok(Self {
            path: path.map(Path::to_path_buf),
            config,
        })
    }

    async fn read_file(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get the current configuration
    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    /// Mutate the configuration in place, re-validating afterwards
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut next = self.config.clone();
        f(&mut next);
        next.validate()?;
        self.config = next;
        Ok(())
    }

    /// Persist the configuration back to its file
    pub async fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| AppError::Config("No config file path set".into()))?;
        let text = toml::to_string_pretty(&self.config)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Path this store was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
