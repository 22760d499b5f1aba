//! Tracing setup and the audit trail
//!
//! Audit records go through the same subscriber under the `audit` target
//! with the serialized payload in the `event` field.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::encryption::{AuditCallback, SecretsAuditEvent};

/// Tracing target of audit records
pub const AUDIT_TARGET: &str = "audit";

const MAX_RETAINED_RECORDS: usize = 10_000;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE); `RUST_LOG` overrides it
    pub level: String,

    /// Enable JSON format output
    pub json_format: bool,

    /// Log file path (logs to stderr if None)
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_file: None,
        }
    }
}

impl LoggingConfig {
    /// Parse log level from string
    pub fn parse_level(&self) -> Level {
        match self.level.to_uppercase().as_str() {
            "ERROR" => Level::ERROR,
            "WARN" => Level::WARN,
            "INFO" => Level::INFO,
            "DEBUG" => Level::DEBUG,
            "TRACE" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.parse_level().to_string()));

    let writer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let to_file = config.log_file.is_some();

    let subscriber = Registry::default().with(env_filter);
    let result = if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(writer);
        subscriber.with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_ansi(!to_file)
            .with_writer(writer)
            .compact();
        subscriber.with(fmt_layer).try_init()
    };
    result.context("Logging already initialized")?;

    tracing::debug!(
        level = %config.level,
        json = config.json_format,
        log_file = ?config.log_file,
        "Logging initialized"
    );
    Ok(())
}

/// One retained audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Audit logger: emits `audit` target events and keeps the most recent ones
#[derive(Debug, Clone)]
pub struct AuditLogger {
    enabled: bool,
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Log `payload` as a JSON audit record of `event_type`
    pub fn record<T: Serialize>(&self, event_type: &str, payload: &T) {
        if !self.enabled {
            return;
        }

        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(target: AUDIT_TARGET, event_type, error = %e, "Audit payload could not be serialized");
                return;
            }
        };
        tracing::info!(target: AUDIT_TARGET, event_type, event = %payload, "Audit record");

        let mut records = self.records.write();
        records.push(AuditRecord {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        });
        if records.len() > MAX_RETAINED_RECORDS {
            let len = records.len();
            records.drain(0..len - MAX_RETAINED_RECORDS);
        }
    }

    /// Most recent records, newest first
    pub fn records(&self, limit: usize) -> Vec<AuditRecord> {
        let records = self.records.read();
        records.iter().rev().take(limit).cloned().collect()
    }

    /// Callback for [`SecretsManager`](crate::encryption::SecretsManager) events.
    ///
    /// Per-value encryption and decryption are only traced; rotation, version
    /// removal and cache resets become audit records.
    pub fn secrets_callback(&self) -> AuditCallback {
        let logger = self.clone();
        Arc::new(move |event: &SecretsAuditEvent| match event {
            SecretsAuditEvent::Encryption { version, size } => {
                tracing::trace!(target: AUDIT_TARGET, version = %version, size, "Value encrypted");
            }
            SecretsAuditEvent::Decryption { version, was_hint } => {
                tracing::trace!(target: AUDIT_TARGET, version = %version, was_hint, "Value decrypted");
            }
            other => logger.record("secrets", other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.parse_level(), Level::INFO);
        assert!(config.log_file.is_none());

        for (level, expected) in [("Debug", Level::DEBUG), ("warn", Level::WARN), ("TRACE", Level::TRACE), ("loud", Level::INFO)] {
            let config = LoggingConfig {
                level: level.to_string(),
                ..Default::default()
            };
            assert_eq!(config.parse_level(), expected, "level {level}");
        }
    }

    #[test]
    fn test_audit_logger_retains_records() {
        let logger = AuditLogger::new(true);
        logger.record("cleanup", &serde_json::json!({"operation_id": "cleanup_1", "outcome": "dry_run"}));
        logger.record("restore", &serde_json::json!({"backup": "keys.env.backup_20240101_000000"}));

        let records = logger.records(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "restore");
        assert_eq!(records[1].payload["outcome"], "dry_run");
    }

    #[test]
    fn test_disabled_audit_logger() {
        let logger = AuditLogger::new(false);
        logger.record("cleanup", &"ignored");
        assert!(logger.records(10).is_empty());
    }

    #[test]
    fn test_secrets_callback_filters_hot_path() {
        let logger = AuditLogger::default();
        let callback = logger.secrets_callback();

        callback(&SecretsAuditEvent::Encryption { version: "v1".into(), size: 3 });
        callback(&SecretsAuditEvent::Rotation { new_version: "v2".into() });

        let records = logger.records(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["event"], "rotation");
        assert_eq!(records[0].payload["new_version"], "v2");
    }
}
