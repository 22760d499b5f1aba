//! Secrets manager: active version, ordered trial decryption and rotation

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::derivation::KeyDerivationCache;
use super::key_config::{
    decode_salt, encode_salt, normalize_version, salt_digest, sort_versions, KeyConfiguration,
};
use super::sources::{EnvSource, KeyEntry, KeyStore};
use super::token::{TokenCipher, TokenError};
use super::{SecretsError, DEFAULT_KDF_ITERATIONS, SALT_HASH_PREFIX, SALT_PREFIX};
use crate::config_file::{persist_rotation, KeyFileLayout};

/// Secrets manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsManagerConfig {
    /// Names used for key entries and the active version entry
    pub layout: KeyFileLayout,

    /// PBKDF2 iteration count (default: 100000)
    pub kdf_iterations: u32,
}

impl Default for SecretsManagerConfig {
    fn default() -> Self {
        Self {
            layout: KeyFileLayout::default(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

/// Events delivered to the audit callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecretsAuditEvent {
    Encryption { version: String, size: usize },
    Decryption { version: String, was_hint: bool },
    Rotation { new_version: String },
    VersionsRemoved { versions: Vec<String> },
    CacheCleared,
}

pub type AuditCallback = Arc<dyn Fn(&SecretsAuditEvent) + Send + Sync>;

/// Snapshot of manager counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatistics {
    pub encryptions: u64,
    pub decryptions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub integrity_checks: u64,
    pub cached_configs: usize,
    pub cached_ciphers: usize,
    pub active_version: Option<String>,
    pub validated: bool,
}

#[derive(Default)]
struct Counters {
    encryptions: AtomicU64,
    decryptions: AtomicU64,
    integrity_checks: AtomicU64,
}

/// Outcome of a single decryption attempt
enum AttemptError {
    Unavailable(SecretsError),
    Rejected(TokenError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Unavailable(e) => write!(f, "{}", e),
            AttemptError::Rejected(e) => write!(f, "{}", e),
        }
    }
}

/// Single authority for the active key version and for opening old ciphertext.
///
/// Configuration comes from the in-process [`KeyStore`] first and from the
/// environment for versions the store does not know. The manager starts
/// unvalidated; the first successful [`validate`](Self::validate) flips it to
/// validated for the rest of its lifetime. Encryption and decryption retry
/// validation while unvalidated and fail if it still does not pass.
///
/// Rotation and version removal mutate shared state and are expected to be
/// driven by a single administrative caller at a time.
pub struct SecretsManager {
    config: SecretsManagerConfig,
    store: RwLock<KeyStore>,
    env: Arc<dyn EnvSource>,
    cache: KeyDerivationCache,
    validated: AtomicBool,
    audit: Option<AuditCallback>,
    counters: Counters,
}

impl SecretsManager {
    /// Create an unvalidated manager
    pub fn new(config: SecretsManagerConfig, store: KeyStore, env: Arc<dyn EnvSource>) -> Self {
        let cache = KeyDerivationCache::new(config.kdf_iterations);
        Self {
            config,
            store: RwLock::new(store),
            env,
            cache,
            validated: AtomicBool::new(false),
            audit: None,
            counters: Counters::default(),
        }
    }

    /// Create a manager and attempt validation, keeping it installed when validation fails
    pub fn install(config: SecretsManagerConfig, store: KeyStore, env: Arc<dyn EnvSource>) -> Self {
        let manager = Self::new(config, store, env);
        if let Err(e) = manager.validate() {
            warn!(error = %e, "Secrets manager installed unvalidated; encryption is unavailable until keys are configured");
        }
        manager
    }

    pub fn with_audit_callback(mut self, callback: AuditCallback) -> Self {
        self.audit = Some(callback);
        self
    }

    pub fn config(&self) -> &SecretsManagerConfig {
        &self.config
    }

    pub fn layout(&self) -> &KeyFileLayout {
        &self.config.layout
    }

    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    /// Check that keys are configured and the active version resolves to one of them
    pub fn validate(&self) -> Result<(), SecretsError> {
        if self.is_validated() {
            return Ok(());
        }

        let versions = self.get_all_versions();
        if versions.is_empty() {
            return Err(SecretsError::Validation(
                "no encryption key versions are configured".to_string(),
            ));
        }

        let active = self
            .get_active_version()
            .map_err(|e| SecretsError::Validation(e.to_string()))?;
        if !versions.contains(&active) {
            return Err(SecretsError::Validation(format!(
                "active version {} has no key configuration",
                active
            )));
        }

        for version in &versions {
            self.load_config(version)
                .map_err(|e| SecretsError::Validation(e.to_string()))?;
        }

        self.validated.store(true, Ordering::Release);
        info!(active_version = %active, versions = versions.len(), "Secrets manager validated");
        Ok(())
    }

    fn ensure_validated(&self) -> Result<(), SecretsError> {
        if self.is_validated() {
            Ok(())
        } else {
            self.validate()
        }
    }

    /// Resolve the active version: in-process store, then environment, then sole configured version
    pub fn get_active_version(&self) -> Result<String, SecretsError> {
        if let Some(active) = self.store.read().active_version() {
            return Ok(active.to_string());
        }

        let from_env = self
            .env
            .var(&self.config.layout.active_version_key)
            .map(|v| normalize_version(&v))
            .filter(|v| !v.is_empty());
        if let Some(active) = from_env {
            return Ok(active);
        }

        let mut versions = self.get_all_versions();
        if versions.len() == 1 {
            if let Some(sole) = versions.pop() {
                debug!(version = %sole, "Using sole configured key version as active");
                return Ok(sole);
            }
        }

        Err(SecretsError::NoActiveVersion(
            self.config.layout.active_version_key.clone(),
        ))
    }

    /// Every known version, oldest first
    pub fn get_all_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.store.read().versions().map(str::to_string).collect();

        for version in self.env.key_versions(&self.config.layout) {
            if versions.contains(&version) {
                continue;
            }
            if self.env.versioned_var(SALT_PREFIX, &version).is_some() {
                versions.push(version);
            } else {
                warn!(version = %version, "Ignoring environment key version without a salt");
            }
        }

        sort_versions(&mut versions);
        versions
    }

    /// Load (or fetch from cache) the configuration of `version`
    pub fn load_config(&self, version: &str) -> Result<Arc<KeyConfiguration>, SecretsError> {
        self.cache.config_with(version, |v| self.build_config(v))
    }

    fn build_config(&self, version: &str) -> Result<KeyConfiguration, SecretsError> {
        let entry = self.lookup_entry(version).ok_or_else(|| {
            SecretsError::Configuration(format!("key version {} is not configured", version))
        })?;

        let key = entry.key.filter(|k| !k.is_empty()).ok_or_else(|| {
            SecretsError::Configuration(format!("key version {} has no key material", version))
        })?;
        let salt = entry.salt.filter(|s| !s.is_empty()).ok_or_else(|| {
            SecretsError::Configuration(format!("key version {} has no salt", version))
        })?;

        if entry.salt_hash.is_some() {
            self.counters.integrity_checks.fetch_add(1, Ordering::Relaxed);
        }

        KeyConfiguration::new(version, key, decode_salt(&salt), entry.salt_hash)
    }

    fn lookup_entry(&self, version: &str) -> Option<KeyEntry> {
        if let Some(entry) = self.store.read().get(version) {
            return Some(entry.clone());
        }

        let key = self.env.versioned_var(&self.config.layout.keys_prefix, version);
        let salt = self.env.versioned_var(SALT_PREFIX, version);
        if key.is_none() && salt.is_none() {
            return None;
        }

        Some(KeyEntry {
            key,
            salt,
            salt_hash: self.env.versioned_var(SALT_HASH_PREFIX, version),
        })
    }

    fn cipher(&self, version: &str) -> Result<Arc<TokenCipher>, SecretsError> {
        self.cache.cipher_with(version, |v| self.load_config(v))
    }

    /// Encrypt under the active version
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(String, Vec<u8>), SecretsError> {
        self.ensure_validated()?;
        let version = self.get_active_version()?;
        let token = self.seal(&version, plaintext)?;
        Ok((version, token))
    }

    /// Encrypt under an explicit version
    pub fn encrypt_with(&self, version: &str, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
        self.ensure_validated()?;
        self.seal(&normalize_version(version), plaintext)
    }

    fn seal(&self, version: &str, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let cipher = self.cipher(version)?;
        let token = cipher
            .encrypt(plaintext)
            .map_err(|source| SecretsError::Encryption {
                version: version.to_string(),
                source,
            })?;

        self.counters.encryptions.fetch_add(1, Ordering::Relaxed);
        self.emit(SecretsAuditEvent::Encryption {
            version: version.to_string(),
            size: plaintext.len(),
        });
        Ok(token)
    }

    /// Decrypt by trying the hint, the active version, then every other version once
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        version_hint: Option<&str>,
    ) -> Result<(String, Vec<u8>), SecretsError> {
        self.ensure_validated()?;

        let hint = version_hint
            .map(normalize_version)
            .filter(|v| !v.is_empty());
        let candidates = self.candidate_versions(hint.as_deref());

        let mut last_error = String::from("no key versions configured");
        for version in &candidates {
            match self.try_decrypt(version, ciphertext) {
                Ok(plaintext) => {
                    self.counters.decryptions.fetch_add(1, Ordering::Relaxed);
                    self.emit(SecretsAuditEvent::Decryption {
                        version: version.clone(),
                        was_hint: hint.as_deref() == Some(version.as_str()),
                    });
                    return Ok((version.clone(), plaintext));
                }
                Err(e) => {
                    debug!(version = %version, error = %e, "Decryption attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(SecretsError::DecryptionExhausted {
            attempted: candidates,
            last_error,
        })
    }

    fn candidate_versions(&self, hint: Option<&str>) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        let mut push = |version: String| {
            if !candidates.contains(&version) {
                candidates.push(version);
            }
        };

        if let Some(hint) = hint {
            push(hint.to_string());
        }
        if let Ok(active) = self.get_active_version() {
            push(active);
        }
        for version in self.get_all_versions() {
            push(version);
        }
        candidates
    }

    fn try_decrypt(&self, version: &str, ciphertext: &[u8]) -> Result<Vec<u8>, AttemptError> {
        let cipher = self.cipher(version).map_err(AttemptError::Unavailable)?;
        cipher.decrypt(ciphertext).map_err(AttemptError::Rejected)
    }

    /// Add `new_version`, make it active and drop cached ciphers.
    ///
    /// Without `new_salt` the salt of the oldest configured version is reused;
    /// the derived key still differs because the key material differs. With
    /// `persist_to` the key file is rewritten first, so a failed write leaves
    /// the manager unchanged. Existing data is not re-encrypted.
    pub fn rotate_to_new_version(
        &self,
        new_version: &str,
        new_key: &str,
        new_salt: Option<&[u8]>,
        persist_to: Option<&Path>,
    ) -> Result<(), SecretsError> {
        let version = normalize_version(new_version);
        if version.is_empty() {
            return Err(SecretsError::Configuration("new version name is empty".to_string()));
        }
        if self.get_all_versions().contains(&version) {
            return Err(SecretsError::Configuration(format!(
                "key version {} is already configured",
                version
            )));
        }

        let salt = match new_salt {
            Some(salt) => salt.to_vec(),
            None => self.reusable_salt()?,
        };
        let salt_hash = salt_digest(&salt);

        // Reject unusable material before anything is written
        KeyConfiguration::new(&version, new_key, salt.clone(), Some(salt_hash.clone()))?;

        if let Some(path) = persist_to {
            persist_rotation(path, &self.config.layout, &version, new_key, &salt)?;
            info!(path = %path.display(), version = %version, "Persisted rotated key configuration");
        }

        {
            let mut store = self.store.write();
            store.insert(
                &version,
                KeyEntry::new(new_key, encode_salt(&salt)).with_salt_hash(salt_hash),
            );
            store.set_active_version(&version);
        }
        self.cache.clear();

        info!(new_version = %version, "Rotated active encryption key");
        self.emit(SecretsAuditEvent::Rotation {
            new_version: version,
        });
        Ok(())
    }

    fn reusable_salt(&self) -> Result<Vec<u8>, SecretsError> {
        let first = self.get_all_versions().into_iter().next().ok_or_else(|| {
            SecretsError::Configuration(
                "no existing key version to take a salt from; supply a salt".to_string(),
            )
        })?;
        Ok(self.load_config(&first)?.salt().to_vec())
    }

    /// Forget `versions` in-process and clear caches; the active version cannot be removed
    pub fn remove_versions(&self, versions: &[String]) -> Result<Vec<String>, SecretsError> {
        let versions: Vec<String> = versions.iter().map(|v| normalize_version(v)).collect();

        if let Ok(active) = self.get_active_version() {
            if versions.contains(&active) {
                return Err(SecretsError::Configuration(format!(
                    "refusing to remove active version {}",
                    active
                )));
            }
        }

        let removed: Vec<String> = {
            let mut store = self.store.write();
            versions
                .into_iter()
                .filter(|v| store.remove(v).is_some())
                .collect()
        };

        self.cache.clear();
        info!(versions = ?removed, "Removed key versions from memory");
        self.emit(SecretsAuditEvent::VersionsRemoved {
            versions: removed.clone(),
        });
        Ok(removed)
    }

    /// Drop every cached configuration and derived cipher
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.emit(SecretsAuditEvent::CacheCleared);
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let cache = self.cache.stats();
        ManagerStatistics {
            encryptions: self.counters.encryptions.load(Ordering::Relaxed),
            decryptions: self.counters.decryptions.load(Ordering::Relaxed),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            integrity_checks: self.counters.integrity_checks.load(Ordering::Relaxed),
            cached_configs: cache.cached_configs,
            cached_ciphers: cache.cached_ciphers,
            active_version: self.get_active_version().ok(),
            validated: self.is_validated(),
        }
    }

    fn emit(&self, event: SecretsAuditEvent) {
        let Some(callback) = &self.audit else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            warn!(event = ?event, "Audit callback panicked; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::sources::MapEnv;
    use parking_lot::Mutex;

    const TEST_ITERATIONS: u32 = 1_000;

    fn test_config() -> SecretsManagerConfig {
        SecretsManagerConfig {
            kdf_iterations: TEST_ITERATIONS,
            ..Default::default()
        }
    }

    fn store_with(versions: &[&str], active: Option<&str>) -> KeyStore {
        let mut store = KeyStore::new();
        for version in versions {
            store.insert(
                version,
                KeyEntry::new(format!("material-{}", version), format!("salt-{}", version)),
            );
        }
        if let Some(active) = active {
            store.set_active_version(active);
        }
        store
    }

    fn manager(versions: &[&str], active: Option<&str>) -> SecretsManager {
        SecretsManager::install(test_config(), store_with(versions, active), Arc::new(MapEnv::new()))
    }

    #[test]
    fn test_active_version_resolution_order() {
        let env = MapEnv::new().with("ACTIVE_ENCRYPTION_VERSION", "\"V2\"");

        let from_store = SecretsManager::new(test_config(), store_with(&["v1", "v2"], Some("v1")), Arc::new(env.clone()));
        assert_eq!(from_store.get_active_version().unwrap(), "v1");

        let from_env = SecretsManager::new(test_config(), store_with(&["v1", "v2"], None), Arc::new(env));
        assert_eq!(from_env.get_active_version().unwrap(), "v2");

        let sole = SecretsManager::new(test_config(), store_with(&["v7"], None), Arc::new(MapEnv::new()));
        assert_eq!(sole.get_active_version().unwrap(), "v7");

        let ambiguous = SecretsManager::new(test_config(), store_with(&["v1", "v2"], None), Arc::new(MapEnv::new()));
        assert!(matches!(ambiguous.get_active_version(), Err(SecretsError::NoActiveVersion(_))));
    }

    #[test]
    fn test_env_versions_merged_only_when_absent() {
        let env = MapEnv::new()
            .with("ENCRYPTION_KEYS__v1", "env-material")
            .with("ENCRYPTION_SALT__v1", "env-salt")
            .with("ENCRYPTION_KEYS__v2", "env-material-2")
            .with("ENCRYPTION_SALT__v2", "env-salt-2")
            .with("ENCRYPTION_KEYS__v3", "no-salt");
        let manager = SecretsManager::new(test_config(), store_with(&["v1"], Some("v1")), Arc::new(env));

        assert_eq!(manager.get_all_versions(), vec!["v1", "v2"]);
        assert_eq!(manager.load_config("v1").unwrap().key(), "material-v1");
        assert_eq!(manager.load_config("V2").unwrap().key(), "env-material-2");

        let missing_salt = manager.load_config("v3");
        assert!(matches!(missing_salt, Err(SecretsError::Configuration(msg)) if msg.contains("no salt")));
        assert!(manager.load_config("v9").is_err());
    }

    #[test]
    fn test_soft_fail_then_hard_fail() {
        let manager = manager(&[], None);
        assert!(!manager.is_validated());
        assert!(matches!(manager.encrypt(b"x"), Err(SecretsError::Validation(_))));
        assert!(matches!(manager.decrypt(b"x", None), Err(SecretsError::Validation(_))));
    }

    #[test]
    fn test_validation_recovers_after_rotation() {
        let manager = manager(&[], None);
        manager
            .rotate_to_new_version("v1", "first-key", Some(b"fresh-salt"), None)
            .unwrap();

        let (version, token) = manager.encrypt(b"hello").unwrap();
        assert_eq!(version, "v1");
        assert!(manager.is_validated());
        assert_eq!(manager.decrypt(&token, None).unwrap(), ("v1".to_string(), b"hello".to_vec()));
    }

    #[test]
    fn test_wrong_hint_still_decrypts() {
        let manager = manager(&["v1", "v2", "v3"], Some("v3"));
        let token = manager.encrypt_with("v1", b"payload").unwrap();

        let (version, plaintext) = manager.decrypt(&token, Some("v2")).unwrap();
        assert_eq!(version, "v1");
        assert_eq!(plaintext, b"payload");

        // Unknown hints are just another failed candidate
        let (version, _) = manager.decrypt(&token, Some("v99")).unwrap();
        assert_eq!(version, "v1");
    }

    #[test]
    fn test_exhausted_reports_attempts() {
        let manager = manager(&["v1", "v2"], Some("v2"));
        let mut token = manager.encrypt(b"payload").unwrap().1;
        let last = token.len() - 1;
        token[last] ^= 0xff;

        match manager.decrypt(&token, Some("v1")) {
            Err(SecretsError::DecryptionExhausted { attempted, last_error }) => {
                assert_eq!(attempted, vec!["v1", "v2"]);
                assert_eq!(last_error, "invalid token");
            }
            other => panic!("unexpected result: {:?}", other.map(|(v, _)| v)),
        }
    }

    #[test]
    fn test_rotation_reuses_salt_and_rejects_duplicates() {
        let manager = manager(&["v1"], Some("v1"));
        manager.rotate_to_new_version("V2", "second-key", None, None).unwrap();

        assert_eq!(manager.get_active_version().unwrap(), "v2");
        let v1 = manager.load_config("v1").unwrap();
        let v2 = manager.load_config("v2").unwrap();
        assert_eq!(v1.salt(), v2.salt());
        assert_eq!(v2.salt_hash(), Some(salt_digest(v2.salt()).as_str()));

        let duplicate = manager.rotate_to_new_version("v2", "other", None, None);
        assert!(matches!(duplicate, Err(SecretsError::Configuration(_))));
    }

    #[test]
    fn test_encrypt_and_decrypt_during_rotation() {
        let manager = manager(&["v1"], Some("v1"));

        std::thread::scope(|scope| {
            for t in 0..4 {
                let manager = &manager;
                scope.spawn(move || {
                    for i in 0..25 {
                        let plaintext = format!("thread-{}-{}", t, i);
                        let (version, token) = manager.encrypt(plaintext.as_bytes()).unwrap();
                        let (opened_by, bytes) = manager.decrypt(&token, None).unwrap();
                        assert_eq!(opened_by, version);
                        assert_eq!(bytes, plaintext.as_bytes());
                    }
                });
            }
            scope.spawn(|| {
                for n in 2..=4 {
                    manager
                        .rotate_to_new_version(&format!("v{}", n), &format!("material-v{}", n), None, None)
                        .unwrap();
                    manager.clear_cache();
                }
            });
        });

        assert_eq!(manager.get_active_version().unwrap(), "v4");
        assert_eq!(manager.get_all_versions(), vec!["v1", "v2", "v3", "v4"]);
        assert_eq!(manager.statistics().encryptions, 100);
        assert_eq!(manager.statistics().decryptions, 100);
    }

    #[test]
    fn test_remove_versions_refuses_active() {
        let manager = manager(&["v1", "v2"], Some("v2"));
        assert!(manager.remove_versions(&["v2".to_string()]).is_err());

        let removed = manager.remove_versions(&["V1".to_string(), "v5".to_string()]).unwrap();
        assert_eq!(removed, vec!["v1"]);
        assert_eq!(manager.get_all_versions(), vec!["v2"]);
    }

    #[test]
    fn test_audit_events_and_statistics() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let manager = manager(&["v1"], Some("v1"))
            .with_audit_callback(Arc::new(move |event| sink.lock().push(event.clone())));

        let (_, token) = manager.encrypt(b"abc").unwrap();
        manager.decrypt(&token, Some("v1")).unwrap();
        manager.decrypt(&token, None).unwrap();

        let recorded = events.lock().clone();
        assert_eq!(
            recorded,
            vec![
                SecretsAuditEvent::Encryption { version: "v1".into(), size: 3 },
                SecretsAuditEvent::Decryption { version: "v1".into(), was_hint: true },
                SecretsAuditEvent::Decryption { version: "v1".into(), was_hint: false },
            ]
        );

        let stats = manager.statistics();
        assert_eq!(stats.encryptions, 1);
        assert_eq!(stats.decryptions, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 2);
        assert!(stats.validated);
    }

    #[test]
    fn test_panicking_audit_callback_is_contained() {
        let manager = manager(&["v1"], Some("v1"))
            .with_audit_callback(Arc::new(|_| panic!("audit sink down")));
        assert!(manager.encrypt(b"still works").is_ok());
    }

    #[test]
    fn test_salt_hash_mismatch_fails_validation() {
        let mut store = KeyStore::new();
        store.insert("v1", KeyEntry::new("material", "salt").with_salt_hash("deadbeef"));
        store.set_active_version("v1");

        let manager = SecretsManager::install(test_config(), store, Arc::new(MapEnv::new()));
        assert!(!manager.is_validated());
        assert!(manager.encrypt(b"x").is_err());
    }
}
