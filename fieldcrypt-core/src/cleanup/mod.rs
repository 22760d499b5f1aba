//! Safe retirement of old key versions
//!
//! This module provides:
//! - Usage analysis: which versions stored ciphertext still references
//! - Planning: keep/remove sets that never include active or used versions
//! - The orchestrator: backup, atomic rewrite, integrity check, rollback

pub mod analysis;
pub mod orchestrator;
pub mod planner;

pub use analysis::*;
pub use orchestrator::*;
pub use planner::*;
