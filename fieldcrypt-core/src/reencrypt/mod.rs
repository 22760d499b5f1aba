//! Resumable bulk re-encryption of one encrypted column
//!
//! A job walks the column in primary-key order, rewrites every value that
//! is not yet under the active key version and checkpoints its position in
//! the `reencrypt_jobs` table so an interrupted run continues where the last
//! committed batch ended.

pub mod job;
pub mod job_store;
pub mod runner;

pub use job::*;
pub use job_store::*;
pub use runner::*;

use crate::encryption::SecretsError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("unknown job status '{0}'")]
    UnknownStatus(String),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id} is {status} and cannot be resumed")]
    NotResumable { id: i64, status: JobStatus },

    #[error("job {id} targets {model}.{column}, not {requested}")]
    JobMismatch {
        id: i64,
        model: String,
        column: String,
        requested: String,
    },

    #[error("active version changed from {target} to {active} while job {id} was running; job paused")]
    TargetVersionChanged {
        id: i64,
        target: String,
        active: String,
    },

    #[error("job {id} failed: {message}")]
    Failed { id: i64, message: String },

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}
