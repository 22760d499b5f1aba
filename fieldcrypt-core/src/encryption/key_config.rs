//! Immutable key configuration for a single key version

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::fmt;

use super::SecretsError;

/// Key material, salt and optional salt digest for one key version
///
/// The salt digest is verified when the configuration is built; a
/// configuration that exists is therefore known to be untampered.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyConfiguration {
    version: String,
    key: String,
    salt: Vec<u8>,
    salt_hash: Option<String>,
}

impl KeyConfiguration {
    /// Build a configuration, checking `sha256(salt)` against `salt_hash` when given
    pub fn new(
        version: &str,
        key: impl Into<String>,
        salt: Vec<u8>,
        salt_hash: Option<String>,
    ) -> Result<Self, SecretsError> {
        let version = normalize_version(version);
        let key = key.into();

        if key.is_empty() {
            return Err(SecretsError::Configuration(format!(
                "key version {} has empty key material",
                version
            )));
        }
        if salt.is_empty() {
            return Err(SecretsError::Configuration(format!(
                "key version {} has an empty salt",
                version
            )));
        }

        let salt_hash = salt_hash
            .map(|h| strip_quotes(&h).to_ascii_lowercase())
            .filter(|h| !h.is_empty());

        if let Some(expected) = &salt_hash {
            let actual = salt_digest(&salt);
            if &actual != expected {
                return Err(SecretsError::Configuration(format!(
                    "salt integrity check failed for key version {}",
                    version
                )));
            }
        }

        Ok(Self {
            version,
            key,
            salt,
            salt_hash,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn salt_hash(&self) -> Option<&str> {
        self.salt_hash.as_deref()
    }
}

impl fmt::Debug for KeyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfiguration")
            .field("version", &self.version)
            .field("key", &"<redacted>")
            .field("salt_len", &self.salt.len())
            .field("salt_hash", &self.salt_hash)
            .finish()
    }
}

/// Lowercase and trim a version identifier
pub fn normalize_version(version: &str) -> String {
    strip_quotes(version).trim().to_lowercase()
}

/// Hex SHA-256 digest of raw salt bytes
pub fn salt_digest(salt: &[u8]) -> String {
    hex::encode(Sha256::digest(salt))
}

/// Decode a configured salt string.
///
/// Tried in order: hex (even length only), base64url (padding optional),
/// then the raw UTF-8 bytes of the string.
pub fn decode_salt(raw: &str) -> Vec<u8> {
    let raw = strip_quotes(raw).trim();

    if raw.len() % 2 == 0 {
        if let Ok(bytes) = hex::decode(raw) {
            return bytes;
        }
    }

    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')) {
        if !bytes.is_empty() {
            return bytes;
        }
    }

    raw.as_bytes().to_vec()
}

/// Encode salt bytes the way rotation and key generation store them
pub fn encode_salt(salt: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(salt)
}

/// Remove surrounding quote characters left behind by naive env-file parsers
pub fn strip_quotes(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

/// Numeric ordering key of a version identifier.
///
/// `v12` orders as 12; identifiers without a trailing integer order as 0.
pub fn version_number(version: &str) -> u64 {
    let digits_start = version
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);

    match digits_start {
        Some(start) => version[start..].parse().unwrap_or(0),
        None => 0,
    }
}

/// Sort versions oldest first by numeric suffix, then by name
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| {
        version_number(a)
            .cmp(&version_number(b))
            .then_with(|| a.cmp(b))
    });
}
