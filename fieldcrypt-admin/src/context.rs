//! Shared state for command execution

use anyhow::{anyhow, Context, Result};
use fieldcrypt_core::{
    AuditLogger, EncryptedColumnCodec, EnvFile, KeyStore, ProcessEnv, SecretsManager,
    SecretsManagerConfig,
};
use rusqlite::Connection;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AdminConfig;

pub struct AdminContext {
    pub config: AdminConfig,
    pub env_file: PathBuf,
    pub database: Option<PathBuf>,
    pub audit: AuditLogger,
}

impl AdminContext {
    pub fn new(config: AdminConfig, env_file: Option<PathBuf>, database: Option<PathBuf>) -> Self {
        let env_file = env_file.unwrap_or_else(|| config.env_file.clone());
        let database = database.or_else(|| config.database.clone());
        Self {
            config,
            env_file,
            database,
            audit: AuditLogger::default(),
        }
    }

    pub fn manager_config(&self) -> SecretsManagerConfig {
        self.config.manager_config()
    }

    /// Manager over the key file (when present) and the process environment
    pub fn load_manager(&self) -> Result<Arc<SecretsManager>> {
        let config = self.manager_config();

        let store = if self.env_file.exists() {
            debug!(path = %self.env_file.display(), "Loading key file");
            EnvFile::load(&self.env_file)?
                .key_store(&config.layout)
                .with_context(|| format!("Invalid key file {}", self.env_file.display()))?
        } else {
            info!(path = %self.env_file.display(), "Key file not found; using environment variables only");
            KeyStore::new()
        };

        let manager = SecretsManager::install(config, store, Arc::new(ProcessEnv))
            .with_audit_callback(self.audit.secrets_callback());
        Ok(Arc::new(manager))
    }

    pub fn codec(&self) -> Result<EncryptedColumnCodec> {
        Ok(EncryptedColumnCodec::new(self.load_manager()?))
    }

    pub fn open_database(&self) -> Result<Connection> {
        let path = self
            .database
            .as_deref()
            .ok_or_else(|| anyhow!("No database configured: pass --database or set `database` in the admin config"))?;
        open_existing(path)
    }
}

fn open_existing(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(anyhow!("Database does not exist: {}", path.display()));
    }
    Connection::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Ask a y/N question on stdin; anything but an answer starting with `y` declines
pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{} (y/N): ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().to_lowercase().starts_with('y'))
}
