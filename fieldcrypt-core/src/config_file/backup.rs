//! Timestamped backups of the key file

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::atomic::{write_atomically, AtomicWriteError};

const BACKUP_MARKER: &str = ".backup_";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("file {0} not found")]
    NotFound(PathBuf),

    #[error("backup {path} failed verification: {reason}")]
    Verification { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("restoring configuration failed: {0}")]
    Restore(#[from] AtomicWriteError),
}

/// A backup file next to the key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn backup_prefix(config_path: &Path) -> String {
    let name = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}{}", name, BACKUP_MARKER)
}

/// Copy the key file to `<name>.backup_<YYYYmmdd_HHMMSS>` and verify the copy
pub fn backup_configuration(config_path: &Path) -> Result<BackupInfo, BackupError> {
    if !config_path.is_file() {
        return Err(BackupError::NotFound(config_path.to_path_buf()));
    }

    let created_at = Utc::now();
    let base = config_path.with_file_name(format!(
        "{}{}",
        backup_prefix(config_path),
        created_at.format(BACKUP_TIMESTAMP_FORMAT)
    ));

    let mut backup_path = base.clone();
    let mut attempt = 1;
    while backup_path.exists() {
        backup_path = PathBuf::from(format!("{}_{}", base.display(), attempt));
        attempt += 1;
    }

    // fs::copy carries the permission bits over
    fs::copy(config_path, &backup_path).map_err(io_error(&backup_path))?;

    let size_bytes = fs::metadata(&backup_path)
        .map_err(|_| BackupError::Verification {
            path: backup_path.clone(),
            reason: "backup file missing after copy".to_string(),
        })?
        .len();
    if size_bytes == 0 {
        return Err(BackupError::Verification {
            path: backup_path,
            reason: "backup file is empty".to_string(),
        });
    }

    info!(backup = %backup_path.display(), size_bytes, "Configuration backup created");
    Ok(BackupInfo {
        path: backup_path,
        created_at,
        size_bytes,
    })
}

/// Check that a file looks like a usable key file backup
pub fn validate_backup_integrity(backup_path: &Path) -> Result<(), BackupError> {
    if !backup_path.is_file() {
        return Err(BackupError::NotFound(backup_path.to_path_buf()));
    }

    let content = fs::read_to_string(backup_path).map_err(io_error(backup_path))?;
    let reason = if content.trim().is_empty() {
        Some("file is empty")
    } else if !["ENCRYPTION_KEYS__", "ENCRYPTION_SALT__", "ACTIVE_ENCRYPTION_VERSION"]
        .iter()
        .any(|marker| content.contains(marker))
    {
        Some("no key configuration found")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(BackupError::Verification {
            path: backup_path.to_path_buf(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Atomically put the contents of `backup_path` back at `config_path`
pub fn restore_configuration(backup_path: &Path, config_path: &Path) -> Result<(), BackupError> {
    validate_backup_integrity(backup_path)?;

    let contents = fs::read(backup_path).map_err(io_error(backup_path))?;
    write_atomically(config_path, &contents)?;

    info!(
        backup = %backup_path.display(),
        config = %config_path.display(),
        "Configuration restored from backup"
    );
    Ok(())
}

/// Backups of `config_path`, newest first
pub fn list_backups(config_path: &Path) -> Result<Vec<BackupInfo>, BackupError> {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = backup_prefix(config_path);

    let mut backups = Vec::new();
    for entry in fs::read_dir(&dir).map_err(io_error(&dir))? {
        let entry = entry.map_err(io_error(&dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(stamp) = stamp.get(..15) else {
            continue;
        };
        let Ok(created) = NaiveDateTime::parse_from_str(stamp, BACKUP_TIMESTAMP_FORMAT) else {
            continue;
        };

        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        backups.push(BackupInfo {
            path: entry.path(),
            created_at: Utc.from_utc_datetime(&created),
            size_bytes,
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(backups)
}

/// Delete all but the `keep` newest backups; returns the removed paths
pub fn cleanup_old_backups(config_path: &Path, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
    let mut removed = Vec::new();

    for backup in list_backups(config_path)?.into_iter().skip(keep) {
        match fs::remove_file(&backup.path) {
            Ok(()) => removed.push(backup.path),
            Err(e) => warn!(backup = %backup.path.display(), error = %e, "Could not remove old backup"),
        }
    }

    if !removed.is_empty() {
        info!(removed = removed.len(), kept = keep, "Old configuration backups removed");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONTENT: &str = "ACTIVE_ENCRYPTION_VERSION=\"v1\"\nENCRYPTION_KEYS__v1=\"k\"\nENCRYPTION_SALT__v1=\"s\"\n";

    #[test]
    fn test_backup_and_restore() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join(".env.crypto");
        fs::write(&config, CONTENT).unwrap();

        let backup = backup_configuration(&config).unwrap();
        assert!(backup
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".env.crypto.backup_"));
        assert_eq!(backup.size_bytes, CONTENT.len() as u64);

        fs::write(&config, "broken").unwrap();
        restore_configuration(&backup.path, &config).unwrap();
        assert_eq!(fs::read_to_string(&config).unwrap(), CONTENT);
    }

    #[test]
    fn test_same_second_backups_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("keys.env");
        fs::write(&config, CONTENT).unwrap();

        let first = backup_configuration(&config).unwrap();
        let second = backup_configuration(&config).unwrap();
        assert_ne!(first.path, second.path);
        assert!(first.path.exists());
        assert!(second.path.exists());
    }

    #[test]
    fn test_missing_config() {
        let dir = TempDir::new().unwrap();
        let result = backup_configuration(&dir.path().join("absent.env"));
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_validate_backup_integrity() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good");
        let empty = dir.path().join("empty");
        let unrelated = dir.path().join("unrelated");
        fs::write(&good, CONTENT).unwrap();
        fs::write(&empty, "  \n").unwrap();
        fs::write(&unrelated, "A=1\n").unwrap();

        assert!(validate_backup_integrity(&good).is_ok());
        assert!(matches!(validate_backup_integrity(&empty), Err(BackupError::Verification { .. })));
        assert!(matches!(validate_backup_integrity(&unrelated), Err(BackupError::Verification { .. })));

        let config = dir.path().join("target");
        fs::write(&config, CONTENT).unwrap();
        assert!(restore_configuration(&empty, &config).is_err());
        assert_eq!(fs::read_to_string(&config).unwrap(), CONTENT);
    }

    #[test]
    fn test_cleanup_old_backups() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("keys.env");
        fs::write(&config, CONTENT).unwrap();

        for stamp in ["20240101_000000", "20240102_000000", "20240103_000000", "20240104_000000"] {
            fs::write(dir.path().join(format!("keys.env.backup_{}", stamp)), CONTENT).unwrap();
        }
        fs::write(dir.path().join("other.env.backup_20240101_000000"), CONTENT).unwrap();

        let removed = cleanup_old_backups(&config, 2).unwrap();
        assert_eq!(removed.len(), 2);

        let remaining: Vec<String> = list_backups(&config)
            .unwrap()
            .iter()
            .map(|b| b.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining, vec!["keys.env.backup_20240104_000000", "keys.env.backup_20240103_000000"]);
        assert!(dir.path().join("other.env.backup_20240101_000000").exists());
    }
}
