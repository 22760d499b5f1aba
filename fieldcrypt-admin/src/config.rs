use anyhow::{Context, Result};
use fieldcrypt_core::{
    KeyFileLayout, LoggingConfig, ModelRegistry, ModelSpec, SecretsManagerConfig,
    DEFAULT_KDF_ITERATIONS, DEFAULT_KEYS_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdminConfig {
    pub env_file: PathBuf,
    pub database: Option<PathBuf>,
    pub keys_prefix: String,
    pub kdf_iterations: u32,
    pub logging: LoggingSection,
    pub models: BTreeMap<String, ModelSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json_format: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            env_file: PathBuf::from(".env.crypto"),
            database: None,
            keys_prefix: DEFAULT_KEYS_PREFIX.to_string(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            logging: LoggingSection::default(),
            models: BTreeMap::new(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_file: None,
        }
    }
}

impl AdminConfig {
    /// Load from TOML; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AdminConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid admin configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn manager_config(&self) -> SecretsManagerConfig {
        SecretsManagerConfig {
            layout: KeyFileLayout {
                keys_prefix: self.keys_prefix.clone(),
                ..Default::default()
            },
            kdf_iterations: self.kdf_iterations,
        }
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.logging.level.clone(),
            json_format: self.logging.json_format,
            log_file: self.logging.log_file.clone(),
        }
    }

    pub fn registry(&self) -> Result<ModelRegistry> {
        ModelRegistry::from_specs(&self.models).context("Invalid [models] section")
    }
}
