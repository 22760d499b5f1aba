//! Line-oriented key file (`KEY="value"`)
//!
//! Rewrites keep every unrelated line (comments, blank lines, other keys)
//! exactly as it was; only assignments owned by key versions and the
//! timestamp header are touched.

pub mod atomic;
pub mod backup;

pub use atomic::*;
pub use backup::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::encryption::{
    encode_salt, normalize_version, salt_digest, sort_versions, strip_quotes, KeyStore,
    SecretsError, ACTIVE_VERSION_KEY, DEFAULT_KEYS_PREFIX, SALT_HASH_PREFIX, SALT_PREFIX,
};

/// Header written on every rewrite
pub const UPDATED_HEADER: &str = "# Atualizado em";

/// Header written when a file is first generated
pub const GENERATED_HEADER: &str = "# Gerado em";

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    AtomicWrite(#[from] AtomicWriteError),

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("value of {key} cannot be written to a key file (quotes, line breaks or surrounding whitespace)")]
    UnrepresentableValue { key: String },
}

/// Structural problems found in a key file
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("configuration file {0} does not exist")]
    Missing(PathBuf),

    #[error("cannot read configuration file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration file is empty")]
    Empty,

    #[error("no active version declared ({0} is missing)")]
    NoActiveVersion(String),

    #[error("no encryption keys found")]
    NoKeys,

    #[error("active version {0} has no key")]
    ActiveKeyMissing(String),
}

/// Which part of a key version an assignment configures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyField {
    Key,
    Salt,
    SaltHash,
}

/// Entry names used by a key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFileLayout {
    /// Prefix of key entries (`<prefix>__<version>`)
    pub keys_prefix: String,

    /// Name of the active version entry
    pub active_version_key: String,
}

impl Default for KeyFileLayout {
    fn default() -> Self {
        Self {
            keys_prefix: DEFAULT_KEYS_PREFIX.to_string(),
            active_version_key: ACTIVE_VERSION_KEY.to_string(),
        }
    }
}

impl KeyFileLayout {
    pub fn key_name(&self, version: &str) -> String {
        format!("{}__{}", self.keys_prefix, version)
    }

    pub fn salt_name(&self, version: &str) -> String {
        format!("{}__{}", SALT_PREFIX, version)
    }

    pub fn salt_hash_name(&self, version: &str) -> String {
        format!("{}__{}", SALT_HASH_PREFIX, version)
    }

    /// Classify `<PREFIX>__<version>`, returning the field and the normalized version
    pub fn classify(&self, name: &str) -> Option<(KeyField, String)> {
        let (prefix, version) = name.trim().split_once("__")?;
        if version.is_empty() {
            return None;
        }

        // Salt hash first: it shares the salt prefix
        let field = if prefix.eq_ignore_ascii_case(SALT_HASH_PREFIX) {
            KeyField::SaltHash
        } else if prefix.eq_ignore_ascii_case(SALT_PREFIX) {
            KeyField::Salt
        } else if prefix.eq_ignore_ascii_case(&self.keys_prefix) {
            KeyField::Key
        } else {
            return None;
        };
        Some((field, normalize_version(version)))
    }

    pub fn is_active_version_key(&self, name: &str) -> bool {
        name.trim().eq_ignore_ascii_case(&self.active_version_key)
    }
}

/// One parsed line of a key file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvLine<'a> {
    Blank,
    Comment(&'a str),
    Assignment { key: &'a str, value: &'a str },
    Other(&'a str),
}

pub fn parse_line(line: &str) -> EnvLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return EnvLine::Blank;
    }
    if trimmed.starts_with('#') {
        return EnvLine::Comment(trimmed);
    }

    match trimmed.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => EnvLine::Assignment {
            key: key.trim().trim_start_matches("export ").trim(),
            value: strip_quotes(value),
        },
        _ => EnvLine::Other(line),
    }
}

/// In-memory copy of a key file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    lines: Vec<String>,
}

impl EnvFile {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content))
    }

    /// Load `path`, or start empty when it does not exist yet
    pub fn load_or_empty(path: &Path) -> Result<Self, ConfigFileError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Save through the atomic writer
    pub fn save(&self, path: &Path) -> Result<(), ConfigFileError> {
        write_atomically(path, self.render().as_bytes())?;
        Ok(())
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match parse_line(line) {
            EnvLine::Assignment { key, value } => Some((key, value)),
            _ => None,
        })
    }

    /// Value of `key`; a later assignment overrides an earlier one
    pub fn get(&self, key: &str) -> Option<&str> {
        self.assignments()
            .filter(|(k, _)| *k == key)
            .last()
            .map(|(_, v)| v)
    }

    /// Replace the first assignment of `key` in place (dropping duplicates) or append one.
    ///
    /// Values that would not read back unchanged are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigFileError> {
        let quoted = format!("\"{}\"", value);
        if value.contains(['"', '\n', '\r']) || strip_quotes(&quoted) != value {
            return Err(ConfigFileError::UnrepresentableValue { key: key.to_string() });
        }
        let rendered = format!("{}={}", key, quoted);
        let mut replaced = false;

        self.lines.retain_mut(|line| {
            let matches = matches!(parse_line(line), EnvLine::Assignment { key: k, .. } if k == key);
            if !matches {
                return true;
            }
            if replaced {
                return false;
            }
            *line = rendered.clone();
            replaced = true;
            true
        });

        if !replaced {
            self.lines.push(rendered);
        }
        Ok(())
    }

    pub fn key_store(&self, layout: &KeyFileLayout) -> Result<KeyStore, SecretsError> {
        KeyStore::from_assignments(self.assignments(), layout)
    }

    pub fn active_version(&self, layout: &KeyFileLayout) -> Option<String> {
        self.assignments()
            .filter(|(k, _)| layout.is_active_version_key(k))
            .last()
            .map(|(_, v)| normalize_version(v))
            .filter(|v| !v.is_empty())
    }

    /// Versions that have a key entry, oldest first
    pub fn versions(&self, layout: &KeyFileLayout) -> Vec<String> {
        let mut versions: Vec<String> = self
            .assignments()
            .filter_map(|(k, _)| match layout.classify(k) {
                Some((KeyField::Key, version)) => Some(version),
                _ => None,
            })
            .collect();
        sort_versions(&mut versions);
        versions.dedup();
        versions
    }

    fn owned_by(&self, line: &str, versions: &[String], layout: &KeyFileLayout) -> bool {
        match parse_line(line) {
            EnvLine::Assignment { key, .. } => layout
                .classify(key)
                .is_some_and(|(_, version)| versions.contains(&version)),
            _ => false,
        }
    }

    /// Raw lines holding key, salt or salt hash of any of `versions`
    pub fn version_lines(&self, versions: &[String], layout: &KeyFileLayout) -> Vec<String> {
        let versions: Vec<String> = versions.iter().map(|v| normalize_version(v)).collect();
        self.lines
            .iter()
            .filter(|line| self.owned_by(line, &versions, layout))
            .cloned()
            .collect()
    }

    /// Drop the key, salt and salt hash lines of `versions`; returns the number of lines removed
    pub fn remove_versions(&mut self, versions: &[String], layout: &KeyFileLayout) -> usize {
        let versions: Vec<String> = versions.iter().map(|v| normalize_version(v)).collect();
        let before = self.lines.len();
        let kept: Vec<String> = self
            .lines
            .iter()
            .filter(|line| !self.owned_by(line, &versions, layout))
            .cloned()
            .collect();
        self.lines = kept;
        before - self.lines.len()
    }

    /// Replace the timestamp header, or insert one as the first line
    pub fn touch_timestamp(&mut self, now: DateTime<Utc>) {
        let header = format!("{} {}Z", UPDATED_HEADER, now.format("%Y-%m-%dT%H:%M:%S"));
        let existing = self.lines.iter_mut().find(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with(UPDATED_HEADER) || trimmed.starts_with(GENERATED_HEADER)
        });

        match existing {
            Some(line) => *line = header,
            None => self.lines.insert(0, header),
        }
    }

    /// Structural check: active version declared, at least one key, active key present
    pub fn validate_integrity(&self, layout: &KeyFileLayout) -> Result<IntegritySummary, IntegrityError> {
        if self.lines.iter().all(|line| line.trim().is_empty()) {
            return Err(IntegrityError::Empty);
        }

        let active = self
            .active_version(layout)
            .ok_or_else(|| IntegrityError::NoActiveVersion(layout.active_version_key.clone()))?;

        let versions = self.versions(layout);
        if versions.is_empty() {
            return Err(IntegrityError::NoKeys);
        }
        if !versions.contains(&active) {
            return Err(IntegrityError::ActiveKeyMissing(active));
        }

        Ok(IntegritySummary {
            active_version: active,
            versions,
        })
    }
}

/// Result of a successful integrity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegritySummary {
    pub active_version: String,
    pub versions: Vec<String>,
}

/// Validate the key file at `path`
pub fn validate_config_integrity(
    path: &Path,
    layout: &KeyFileLayout,
) -> Result<IntegritySummary, IntegrityError> {
    if !path.exists() {
        return Err(IntegrityError::Missing(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(|source| IntegrityError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    EnvFile::parse(&content).validate_integrity(layout)
}

/// Record a rotated version in the key file and make it active
pub fn persist_rotation(
    path: &Path,
    layout: &KeyFileLayout,
    version: &str,
    key: &str,
    salt: &[u8],
) -> Result<(), ConfigFileError> {
    let mut file = EnvFile::load_or_empty(path)?;

    file.set(&layout.key_name(version), key)?;
    file.set(&layout.salt_name(version), &encode_salt(salt))?;
    file.set(&layout.salt_hash_name(version), &salt_digest(salt))?;
    file.set(&layout.active_version_key, version)?;
    file.touch_timestamp(Utc::now());

    file.save(path)
}

/// Write a fresh key file holding a single version
pub fn write_initial(
    path: &Path,
    layout: &KeyFileLayout,
    version: &str,
    key: &str,
    salt: &[u8],
    overwrite: bool,
) -> Result<(), ConfigFileError> {
    if path.exists() && !overwrite {
        return Err(ConfigFileError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigFileError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let version = normalize_version(version);
    let mut file = EnvFile::parse(&format!(
        "{} {}Z\n# Keep this file private: it holds the keys protecting stored data.\n",
        GENERATED_HEADER,
        Utc::now().format("%Y-%m-%dT%H:%M:%S")
    ));
    file.set(&layout.active_version_key, &version)?;
    file.set(&layout.key_name(&version), key)?;
    file.set(&layout.salt_name(&version), &encode_salt(salt))?;
    file.set(&layout.salt_hash_name(&version), &salt_digest(salt))?;
    file.save(path)?;

    restrict_permissions(path).map_err(|source| ConfigFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Owner read/write only
#[cfg(unix)]
pub fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
