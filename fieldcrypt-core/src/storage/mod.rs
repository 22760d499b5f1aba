//! Storage seam for bulk operations over an encrypted column
//!
//! Re-encryption and cleanup analysis only need to walk one column in
//! primary-key order, rewrite single values and control transactions.
//! [`EncryptedColumnSource`] is that capability; [`ModelRegistry`] maps the
//! model names operators type on the command line to concrete tables.

pub mod sqlite;

pub use sqlite::*;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("column '{column}' is not an encrypted column of '{model}'")]
    UnknownColumn { model: String, column: String },

    #[error("table '{0}' has no primary key; re-encryption requires one")]
    NoPrimaryKey(String),

    #[error("table '{table}' has a composite primary key ({}); only single-column keys are supported", .columns.join(", "))]
    CompositePrimaryKey { table: String, columns: Vec<String> },

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid checkpoint cursor '{0}'")]
    InvalidCursor(String),
}

/// Primary key value of a row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PkValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Integer(v) => write!(f, "{}", v),
            PkValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// One row of the encrypted column, read without decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub pk: PkValue,
    pub value: Option<String>,
}

/// Ordered access to one encrypted column.
///
/// Implementations must return rows strictly ordered by primary key and
/// only rows whose key is greater than `after`.
pub trait EncryptedColumnSource {
    /// Registered model name
    fn model(&self) -> &str;

    fn column(&self) -> &str;

    /// `model.column`, for logs
    fn describe(&self) -> String {
        format!("{}.{}", self.model(), self.column())
    }

    fn primary_key(&self) -> &str;

    fn count(&self) -> Result<u64, StorageError>;

    /// Turn a stored checkpoint back into a key value
    fn parse_cursor(&self, cursor: &str) -> Result<PkValue, StorageError>;

    fn iterate_ordered_by_pk(
        &self,
        after: Option<&PkValue>,
        batch_size: usize,
    ) -> Result<Vec<RawRecord>, StorageError>;

    fn write_value(&self, pk: &PkValue, stored: &str) -> Result<(), StorageError>;

    fn begin(&self) -> Result<(), StorageError>;

    fn commit(&self) -> Result<(), StorageError>;

    fn rollback(&self) -> Result<(), StorageError>;
}

/// A persisted entity with encrypted columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Model name to table mapping, built at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from named specs, validating every identifier
    pub fn from_specs<'a, I>(specs: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = (&'a String, &'a ModelSpec)>,
    {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.register(name, spec.clone())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, spec: ModelSpec) -> Result<(), StorageError> {
        validate_identifier(&spec.table)?;
        for column in &spec.columns {
            validate_identifier(column)?;
        }
        self.models.insert(name.to_string(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ModelSpec, StorageError> {
        self.models
            .get(name)
            .ok_or_else(|| StorageError::UnknownModel(name.to_string()))
    }

    /// Model spec, checking that `column` is one of its encrypted columns
    pub fn resolve(&self, name: &str, column: &str) -> Result<&ModelSpec, StorageError> {
        let spec = self.get(name)?;
        if !spec.columns.iter().any(|c| c == column) {
            return Err(StorageError::UnknownColumn {
                model: name.to_string(),
                column: column.to_string(),
            });
        }
        Ok(spec)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Accept plain SQL identifiers only; they are interpolated into queries
pub fn validate_identifier(name: &str) -> Result<(), StorageError> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name));

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}
