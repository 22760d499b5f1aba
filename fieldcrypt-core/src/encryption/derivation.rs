//! PBKDF2 key derivation with a per-version config and cipher cache

use parking_lot::ReentrantMutex;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

use super::key_config::{normalize_version, KeyConfiguration};
use super::token::TokenCipher;
use super::SecretsError;

/// Derive a 32-byte key from raw key material and salt
pub fn derive_key(key: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut derived = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(key.as_bytes(), salt, iterations, &mut *derived);
    derived
}

#[derive(Default)]
struct CacheState {
    configs: HashMap<String, Arc<KeyConfiguration>>,
    ciphers: HashMap<(String, u32), Arc<TokenCipher>>,
}

/// Cache of loaded configurations and derived ciphers.
///
/// Both maps sit behind one re-entrant lock. A cipher miss holds the lock
/// for the whole load + derive + insert, and the loader it calls may take
/// the lock again to consult the config map.
pub struct KeyDerivationCache {
    iterations: u32,
    state: ReentrantMutex<RefCell<CacheState>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_configs: usize,
    pub cached_ciphers: usize,
}

impl KeyDerivationCache {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
            state: ReentrantMutex::new(RefCell::new(CacheState::default())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Cached configuration for `version`, or the result of `load` which is then cached
    pub fn config_with<F>(&self, version: &str, load: F) -> Result<Arc<KeyConfiguration>, SecretsError>
    where
        F: FnOnce(&str) -> Result<KeyConfiguration, SecretsError>,
    {
        let version = normalize_version(version);
        let guard = self.state.lock();

        if let Some(config) = guard.borrow().configs.get(&version) {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(load(&version)?);
        guard
            .borrow_mut()
            .configs
            .insert(version, Arc::clone(&config));
        Ok(config)
    }

    /// Cached cipher for `version`, deriving it from `load`'s configuration on a miss
    pub fn cipher_with<F>(&self, version: &str, load: F) -> Result<Arc<TokenCipher>, SecretsError>
    where
        F: FnOnce(&str) -> Result<Arc<KeyConfiguration>, SecretsError>,
    {
        let cache_key = (normalize_version(version), self.iterations);
        let guard = self.state.lock();

        if let Some(cipher) = guard.borrow().ciphers.get(&cache_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(cipher));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let config = load(&cache_key.0)?;

        tracing::debug!(
            version = %config.version(),
            iterations = self.iterations,
            "Deriving encryption key"
        );
        let derived = derive_key(config.key(), config.salt(), self.iterations);
        let cipher = Arc::new(TokenCipher::new(&derived));

        guard
            .borrow_mut()
            .ciphers
            .insert(cache_key, Arc::clone(&cipher));
        Ok(cipher)
    }

    /// Drop every cached configuration and cipher
    pub fn clear(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.configs.clear();
        state.ciphers.clear();
        tracing::debug!("Key derivation cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        let state = guard.borrow();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_configs: state.configs.len(),
            cached_ciphers: state.ciphers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn config(version: &str) -> KeyConfiguration {
        KeyConfiguration::new(version, format!("key-{}", version), b"salt-bytes".to_vec(), None).unwrap()
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("secret", b"salt", 1_000);
        let b = derive_key("secret", b"salt", 1_000);
        let c = derive_key("secret", b"other", 1_000);
        let d = derive_key("secret", b"salt", 1_001);
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
        assert_ne!(*a, *d);
    }

    #[test]
    fn test_cipher_derived_once() {
        let cache = KeyDerivationCache::new(1_000);
        let loads = Cell::new(0);

        for _ in 0..3 {
            cache
                .cipher_with("V1", |v| {
                    loads.set(loads.get() + 1);
                    Ok(Arc::new(config(v)))
                })
                .unwrap();
        }

        assert_eq!(loads.get(), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.cached_ciphers, 1);
    }

    #[test]
    fn test_loader_may_reenter_cache() {
        let cache = KeyDerivationCache::new(1_000);

        let cipher = cache.cipher_with("v1", |v| cache.config_with(v, |v| Ok(config(v))));
        assert!(cipher.is_ok());

        let stats = cache.stats();
        assert_eq!(stats.cached_configs, 1);
        assert_eq!(stats.cached_ciphers, 1);
    }

    #[test]
    fn test_failed_load_not_cached() {
        let cache = KeyDerivationCache::new(1_000);
        let result = cache.cipher_with("v9", |v| {
            Err(SecretsError::Configuration(format!("unknown version {}", v)))
        });
        assert!(result.is_err());
        assert_eq!(cache.stats().cached_ciphers, 0);
    }

    #[test]
    fn test_clear() {
        let cache = KeyDerivationCache::new(1_000);
        cache.config_with("v1", |v| Ok(config(v))).unwrap();
        cache.cipher_with("v1", |v| Ok(Arc::new(config(v)))).unwrap();

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.cached_configs, 0);
        assert_eq!(stats.cached_ciphers, 0);
    }

    #[test]
    fn test_concurrent_misses_derive_once() {
        let cache = KeyDerivationCache::new(1_000);
        let loads = std::sync::atomic::AtomicUsize::new(0);

        let ciphers: Vec<Arc<TokenCipher>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        cache
                            .cipher_with("v1", |v| {
                                loads.fetch_add(1, Ordering::SeqCst);
                                Ok(Arc::new(config(v)))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(ciphers.iter().all(|c| Arc::ptr_eq(c, &ciphers[0])));
    }

    #[test]
    fn test_clear_while_deriving() {
        let cache = KeyDerivationCache::new(1_000);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let cache = &cache;
                scope.spawn(move || {
                    let version = format!("v{}", t % 2 + 1);
                    for _ in 0..20 {
                        let cipher = cache.cipher_with(&version, |v| Ok(Arc::new(config(v)))).unwrap();
                        let token = cipher.encrypt(b"payload").unwrap();
                        assert_eq!(cipher.decrypt(&token).unwrap(), b"payload");
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..20 {
                    cache.clear();
                    std::thread::yield_now();
                }
            });
        });

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 80);
        assert!(stats.cached_ciphers <= 2);
    }
}
