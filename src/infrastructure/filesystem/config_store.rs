use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use validator::Validate;

use crate::common::error::FleetError;
use crate::domain::entities::environment_config::{EnvironmentConfig, Registry};

/// Environment variable overriding the registry directory.
pub const HOME_ENV_VAR: &str = "REPOFLEET_HOME";
pub const REGISTRY_FILE: &str = "environments.yml";

/// Configuration store related errors
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("Configuration file not found at path: {0}")]
    ConfigFileNotFound(String),

    #[error("Configuration file read failed: {0}")]
    ReadFailed(String),

    #[error("Configuration file write failed: {0}")]
    WriteFailed(String),

    #[error("YAML parsing failed in {path}: {message}")]
    YamlParsingFailed { path: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Configuration directory creation failed: {0}")]
    DirectoryCreationFailed(String),

    #[error("Configuration backup failed: {0}")]
    BackupFailed(String),

    #[error("Cannot locate a home directory; set {HOME_ENV_VAR}")]
    NoHomeDirectory,

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl From<ConfigStoreError> for FleetError {
    fn from(error: ConfigStoreError) -> Self {
        FleetError::config_error_with_source(error.to_string(), error)
    }
}

/// YAML persistence for the per-environment config and the global registry.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    backup_suffix: String,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            backup_suffix: ".bak".to_string(),
        }
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_config<T, P>(&self, config_path: P) -> Result<T, ConfigStoreError>
    where
        T: for<'de> Deserialize<'de>,
        P: AsRef<Path>,
    {
        let config_path = config_path.as_ref();

        if !config_path.exists() {
            return Err(ConfigStoreError::ConfigFileNotFound(
                config_path.display().to_string(),
            ));
        }

        let contents = fs::read_to_string(config_path)
            .map_err(|e| ConfigStoreError::ReadFailed(e.to_string()))?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigStoreError::YamlParsingFailed {
            path: config_path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn write_config<T, P>(&self, config_path: P, config: &T) -> Result<(), ConfigStoreError>
    where
        T: Serialize,
        P: AsRef<Path>,
    {
        let config_path = config_path.as_ref();

        if config_path.exists() {
            self.create_backup(config_path)?;
        }

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigStoreError::DirectoryCreationFailed(e.to_string()))?;
        }

        let yaml_content = serde_yaml::to_string(config)?;
        fs::write(config_path, yaml_content)
            .map_err(|e| ConfigStoreError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    pub fn read_environment_config(
        &self,
        config_path: &Path,
    ) -> Result<EnvironmentConfig, ConfigStoreError> {
        let config: EnvironmentConfig = self.read_config(config_path)?;
        config
            .validate()
            .map_err(|e| ConfigStoreError::ValidationFailed(e.to_string()))?;
        Ok(config)
    }

    pub fn write_environment_config(
        &self,
        config_path: &Path,
        config: &EnvironmentConfig,
    ) -> Result<(), ConfigStoreError> {
        config
            .validate()
            .map_err(|e| ConfigStoreError::ValidationFailed(e.to_string()))?;
        self.write_config(config_path, config)
    }

    fn create_backup(&self, config_path: &Path) -> Result<(), ConfigStoreError> {
        let mut name = config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.backup_suffix);
        fs::copy(config_path, config_path.with_file_name(name))
            .map_err(|e| ConfigStoreError::BackupFailed(e.to_string()))?;
        Ok(())
    }
}

/// The global registry file of known environments.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    store: ConfigStore,
}

impl RegistryStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            path: home.into().join(REGISTRY_FILE),
            store: ConfigStore::new(),
        }
    }

    /// `$REPOFLEET_HOME`, falling back to `~/.repofleet`.
    pub fn from_env() -> Result<Self, ConfigStoreError> {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
            return Ok(Self::new(home));
        }
        let home = dirs::home_dir().ok_or(ConfigStoreError::NoHomeDirectory)?;
        Ok(Self::new(home.join(".repofleet")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing registry is empty; an unparsable one is an error.
    pub fn load(&self) -> Result<Registry, ConfigStoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no registry yet");
            return Ok(Registry::default());
        }
        self.store.read_config(&self.path)
    }

    pub fn save(&self, registry: &Registry) -> Result<(), ConfigStoreError> {
        self.store.write_config(&self.path, registry)
    }

    /// Load, drop stale records, and persist if anything changed.
    pub fn load_clean(&self) -> Result<Registry, ConfigStoreError> {
        let mut registry = self.load()?;
        let stale = registry.cleanup();
        if !stale.is_empty() {
            warn!(?stale, "dropping environments whose root no longer exists");
            self.save(&registry)?;
        }
        Ok(registry)
    }
}
