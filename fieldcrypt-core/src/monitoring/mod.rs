//! Logging and audit trail
//!
//! This module provides:
//! - Structured logging with tracing (compact or JSON, stderr or file)
//! - Audit records for key rotation, key retirement and configuration restores

pub mod logging;

pub use logging::*;
