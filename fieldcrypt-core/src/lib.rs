//! Fieldcrypt Core - versioned envelope encryption for persisted fields
//!
//! This crate provides:
//! - Key configuration loading, PBKDF2 derivation and cipher caching
//! - The secrets manager (active version, trial decryption, rotation)
//! - The column codec used at the persistence boundary
//! - Key file handling (atomic rewrite, backups, integrity checks)
//! - Resumable re-encryption jobs and safe key retirement

pub mod cleanup;
pub mod config_file;
pub mod encryption;
pub mod monitoring;
pub mod reencrypt;
pub mod storage;

pub use cleanup::*;
pub use config_file::*;
pub use encryption::*;
pub use monitoring::*;
pub use reencrypt::*;
pub use storage::*;
