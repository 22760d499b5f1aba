//! Sources of key material: the in-process key store and the environment

use std::collections::BTreeMap;

use super::key_config::{normalize_version, strip_quotes};
use super::SecretsError;
use crate::config_file::{KeyField, KeyFileLayout};

/// Raw, undecoded entry for one key version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Option<String>,
    pub salt: Option<String>,
    pub salt_hash: Option<String>,
}

impl KeyEntry {
    pub fn new(key: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            salt: Some(salt.into()),
            salt_hash: None,
        }
    }

    pub fn with_salt_hash(mut self, salt_hash: impl Into<String>) -> Self {
        self.salt_hash = Some(salt_hash.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.is_empty())
            && self.salt.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// In-process key-value configuration: `{version: {key, salt, salt_hash}}` plus the active version
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    entries: BTreeMap<String, KeyEntry>,
    active_version: Option<String>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from flat `NAME=value` assignments.
    ///
    /// Recognizes `<keys_prefix>__<v>`, `ENCRYPTION_SALT__<v>`,
    /// `ENCRYPTION_SALT_HASH__<v>` and the active version entry; other
    /// names are ignored. Fails if any version lacks a key or a salt.
    pub fn from_assignments<'a, I>(assignments: I, layout: &KeyFileLayout) -> Result<Self, SecretsError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut store = Self::new();

        for (name, value) in assignments {
            let value = strip_quotes(value);

            if layout.is_active_version_key(name) {
                store.set_active_version(value);
                continue;
            }

            let Some((field, version)) = layout.classify(name) else {
                continue;
            };
            let entry = store.entries.entry(version).or_default();
            match field {
                KeyField::Key => entry.key = Some(value.to_string()),
                KeyField::Salt => entry.salt = Some(value.to_string()),
                KeyField::SaltHash => entry.salt_hash = Some(value.to_string()),
            }
        }

        let incomplete: Vec<&str> = store
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_complete())
            .map(|(version, _)| version.as_str())
            .collect();

        if !incomplete.is_empty() {
            return Err(SecretsError::Configuration(format!(
                "incomplete key configuration for version(s): {}",
                incomplete.join(", ")
            )));
        }

        Ok(store)
    }

    pub fn insert(&mut self, version: &str, entry: KeyEntry) {
        self.entries.insert(normalize_version(version), entry);
    }

    pub fn remove(&mut self, version: &str) -> Option<KeyEntry> {
        self.entries.remove(&normalize_version(version))
    }

    pub fn get(&self, version: &str) -> Option<&KeyEntry> {
        self.entries.get(&normalize_version(version))
    }

    pub fn contains(&self, version: &str) -> bool {
        self.entries.contains_key(&normalize_version(version))
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured active version, quotes stripped; empty values count as unset
    pub fn active_version(&self) -> Option<&str> {
        self.active_version.as_deref().filter(|v| !v.is_empty())
    }

    pub fn set_active_version(&mut self, version: &str) {
        self.active_version = Some(normalize_version(version));
    }
}

/// Read access to environment variables
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;

    fn vars(&self) -> Vec<(String, String)>;

    /// Look up `PREFIX__<version>` trying the version as given, upper-cased and lower-cased
    fn versioned_var(&self, prefix: &str, version: &str) -> Option<String> {
        let candidates = [
            version.to_string(),
            version.to_uppercase(),
            version.to_lowercase(),
        ];
        candidates
            .iter()
            .find_map(|v| self.var(&format!("{}__{}", prefix, v)))
            .map(|value| strip_quotes(&value).to_string())
            .filter(|value| !value.is_empty())
    }

    /// Versions that have a key variable, normalized and deduplicated
    fn key_versions(&self, layout: &KeyFileLayout) -> Vec<String> {
        let mut versions: Vec<String> = self
            .vars()
            .into_iter()
            .filter_map(|(name, _)| match layout.classify(&name) {
                Some((KeyField::Key, version)) => Some(version),
                _ => None,
            })
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn vars(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }
}

/// Fixed set of variables, used by tests and embedders that do not want
/// process-wide state
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: BTreeMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn vars(&self) -> Vec<(String, String)> {
        self.vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
