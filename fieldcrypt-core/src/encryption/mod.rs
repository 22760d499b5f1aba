//! Envelope encryption for persisted fields
//!
//! This module provides:
//! - Integrity-checked key configurations (one per key version)
//! - PBKDF2-HMAC-SHA256 derivation with a per-version cipher cache
//! - The secrets manager: active version, ordered trial decryption, rotation
//! - The column codec producing `version:base64url(token)` values

pub mod codec;
pub mod derivation;
pub mod key_config;
pub mod manager;
pub mod sources;
pub mod token;

pub use codec::*;
pub use derivation::*;
pub use key_config::*;
pub use manager::*;
pub use sources::*;
pub use token::*;

use crate::config_file::ConfigFileError;

/// Default PBKDF2 iteration count
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Default name prefix of key entries (`ENCRYPTION_KEYS__<version>`)
pub const DEFAULT_KEYS_PREFIX: &str = "ENCRYPTION_KEYS";

/// Name of the entry selecting the active version
pub const ACTIVE_VERSION_KEY: &str = "ACTIVE_ENCRYPTION_VERSION";

/// Name prefix of salt entries
pub const SALT_PREFIX: &str = "ENCRYPTION_SALT";

/// Name prefix of salt hash entries
pub const SALT_HASH_PREFIX: &str = "ENCRYPTION_SALT_HASH";

/// Errors raised by key loading, encryption and rotation
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no active encryption version: set {0} or configure exactly one key version")]
    NoActiveVersion(String),

    #[error("decryption failed with every configured version (tried {}): {last_error}", .attempted.join(", "))]
    DecryptionExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    #[error("secrets manager is not usable: {0}")]
    Validation(String),

    #[error("encryption under version {version} failed: {source}")]
    Encryption {
        version: String,
        #[source]
        source: TokenError,
    },

    #[error("failed to persist key configuration: {0}")]
    Persist(#[from] ConfigFileError),
}
