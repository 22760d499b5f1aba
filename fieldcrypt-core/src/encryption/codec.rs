//! Column codec: the encrypt/decrypt hook invoked at the persistence boundary
//!
//! Stored values look like `v3:<base64url token>`. Values written before
//! versioning are bare base64url tokens and are opened by trial decryption.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::key_config::normalize_version;
use super::manager::SecretsManager;
use super::token::looks_like_token;

/// Separator between the version tag and the payload
pub const VERSION_SEPARATOR: char = ':';

/// Errors surfaced to callers of the codec; deliberately carry no detail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("could not encrypt value for storage")]
    Encode,

    #[error("could not decode stored value")]
    Decode,
}

fn versioned_shape() -> Option<&'static Regex> {
    static SHAPE: OnceLock<Option<Regex>> = OnceLock::new();
    SHAPE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+:[A-Za-z0-9_-]+={0,2}$").ok())
        .as_ref()
}

/// Decode base64url with or without padding
pub fn decode_payload(payload: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()
}

/// Split a stored value into `(version hint, payload)` on the first separator
pub fn split_stored(stored: &str) -> (Option<&str>, &str) {
    match stored.split_once(VERSION_SEPARATOR) {
        Some((version, payload)) => (Some(version), payload),
        None => (None, stored),
    }
}

/// True when `value` is already a versioned ciphertext produced by this codec
pub fn is_versioned_ciphertext(value: &str) -> bool {
    if !versioned_shape().is_some_and(|shape| shape.is_match(value)) {
        return false;
    }
    let (_, payload) = split_stored(value);
    decode_payload(payload).is_some_and(|bytes| looks_like_token(&bytes))
}

/// Version tag of a stored value, if it carries one
pub fn stored_version_tag(stored: &str) -> Option<String> {
    if is_versioned_ciphertext(stored) {
        split_stored(stored).0.map(normalize_version)
    } else {
        None
    }
}

/// Transparent field encryption backed by a shared [`SecretsManager`]
#[derive(Clone)]
pub struct EncryptedColumnCodec {
    manager: Arc<SecretsManager>,
}

impl EncryptedColumnCodec {
    pub fn new(manager: Arc<SecretsManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<SecretsManager> {
        &self.manager
    }

    /// Encrypt `value` under the active version; already-versioned values pass through
    pub fn encode(&self, value: &str) -> Result<String, CodecError> {
        if is_versioned_ciphertext(value) {
            return Ok(value.to_string());
        }
        self.seal(value)
    }

    /// Encrypt `plaintext` under the active version without the pass-through check
    pub fn seal(&self, plaintext: &str) -> Result<String, CodecError> {
        let (version, token) = self.manager.encrypt(plaintext.as_bytes()).map_err(|e| {
            debug!(error = %e, "Column encryption failed");
            CodecError::Encode
        })?;

        Ok(format!(
            "{}{}{}",
            version,
            VERSION_SEPARATOR,
            URL_SAFE.encode(token)
        ))
    }

    pub fn encode_optional(&self, value: Option<&str>) -> Result<Option<String>, CodecError> {
        value.map(|v| self.encode(v)).transpose()
    }

    /// Decrypt a stored value
    pub fn decode(&self, stored: &str) -> Result<String, CodecError> {
        self.decode_with_version(stored).map(|(_, plaintext)| plaintext)
    }

    pub fn decode_optional(&self, stored: Option<&str>) -> Result<Option<String>, CodecError> {
        stored.map(|s| self.decode(s)).transpose()
    }

    /// Decrypt a stored value, also returning the version that opened it
    pub fn decode_with_version(&self, stored: &str) -> Result<(String, String), CodecError> {
        let (hint, payload) = split_stored(stored.trim());

        let token = decode_payload(payload).ok_or(CodecError::Decode)?;
        let (version, plaintext) = self.manager.decrypt(&token, hint).map_err(|e| {
            debug!(error = %e, "Column decryption failed");
            CodecError::Decode
        })?;

        let plaintext = String::from_utf8(plaintext).map_err(|_| CodecError::Decode)?;
        Ok((version, plaintext))
    }

    /// Whether `stored` must be rewritten to end up under `target_version`.
    ///
    /// Any failure to open the value answers `true`.
    pub fn needs_reencryption(&self, stored: &str, target_version: &str) -> bool {
        match self.decode_with_version(stored) {
            Ok((version, _)) => version != normalize_version(target_version),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::manager::SecretsManagerConfig;
    use crate::encryption::sources::{KeyEntry, KeyStore, MapEnv};

    fn codec(versions: &[&str], active: &str) -> EncryptedColumnCodec {
        let mut store = KeyStore::new();
        for version in versions {
            store.insert(version, KeyEntry::new(format!("k-{}", version), format!("s-{}", version)));
        }
        store.set_active_version(active);
        let config = SecretsManagerConfig {
            kdf_iterations: 1_000,
            ..Default::default()
        };
        let manager = SecretsManager::install(config, store, Arc::new(MapEnv::new()));
        EncryptedColumnCodec::new(Arc::new(manager))
    }

    #[test]
    fn test_encode_decode() {
        let codec = codec(&["v1"], "v1");
        let stored = codec.encode("alice@example.com").unwrap();

        assert!(stored.starts_with("v1:"));
        assert!(is_versioned_ciphertext(&stored));
        assert_eq!(codec.decode(&stored).unwrap(), "alice@example.com");
    }

    #[test]
    fn test_encode_is_idempotent() {
        let codec = codec(&["v1"], "v1");
        let once = codec.encode("secret").unwrap();
        let twice = codec.encode(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_encode_is_idempotent_for_unnumbered_version() {
        let codec = codec(&["prod"], "prod");
        let once = codec.encode("x").unwrap();
        assert!(once.starts_with("prod:"));

        let twice = codec.encode(&once).unwrap();
        assert_eq!(twice, once);
        assert_eq!(stored_version_tag(&once).as_deref(), Some("prod"));
        assert_eq!(codec.decode(&twice).unwrap(), "x");
    }

    #[test]
    fn test_colon_text_is_still_encrypted() {
        let codec = codec(&["v1"], "v1");
        for text in ["v1:hello", "note: call back", "http://example.com"] {
            let stored = codec.encode(text).unwrap();
            assert_ne!(stored, text);
            assert_eq!(codec.decode(&stored).unwrap(), text);
        }
    }

    #[test]
    fn test_legacy_bare_value() {
        let codec = codec(&["v1", "v2"], "v2");
        let token = codec.manager().encrypt_with("v1", b"old row").unwrap();
        let legacy = URL_SAFE.encode(token);

        assert!(!legacy.contains(VERSION_SEPARATOR));
        assert_eq!(codec.decode_with_version(&legacy).unwrap(), ("v1".to_string(), "old row".to_string()));
        assert_eq!(stored_version_tag(&legacy), None);
    }

    #[test]
    fn test_errors_are_generic() {
        let codec = codec(&["v1"], "v1");
        assert_eq!(codec.decode("v1:!!not-base64!!"), Err(CodecError::Decode));

        let stored = codec.encode("x").unwrap();
        let mut tampered = stored.into_bytes();
        let idx = tampered.len() - 3;
        tampered[idx] = if tampered[idx] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        let err = codec.decode(&tampered).unwrap_err();
        assert_eq!(err.to_string(), "could not decode stored value");
    }

    #[test]
    fn test_needs_reencryption() {
        let codec = codec(&["v1", "v2"], "v2");
        let old = format!("v1:{}", URL_SAFE.encode(codec.manager().encrypt_with("v1", b"a").unwrap()));
        let current = codec.encode("a").unwrap();

        assert!(codec.needs_reencryption(&old, "v2"));
        assert!(!codec.needs_reencryption(&current, "V2"));
        assert!(codec.needs_reencryption("garbage", "v2"));
    }

    #[test]
    fn test_optional_values() {
        let codec = codec(&["v1"], "v1");
        assert_eq!(codec.encode_optional(None).unwrap(), None);
        let stored = codec.encode_optional(Some("x")).unwrap();
        assert_eq!(codec.decode_optional(stored.as_deref()).unwrap().as_deref(), Some("x"));
    }
}
