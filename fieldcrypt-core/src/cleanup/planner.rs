//! Removal planning: which key versions may leave the configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::encryption::{normalize_version, sort_versions, version_number};

/// Default number of most recent versions always kept
pub const DEFAULT_KEEP_COUNT: usize = 3;

/// A proposed removal would break a safety rule; nothing has been changed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanValidationError {
    #[error("keep count must be at least 1")]
    KeepCountZero,

    #[error("active version {0} is not among the configured versions")]
    ActiveVersionUnknown(String),

    #[error("active version {0} cannot be removed")]
    ActiveVersionRemoved(String),

    #[error("versions still referenced by stored data cannot be removed: {}", .0.join(", "))]
    UsedVersionRemoved(Vec<String>),

    #[error("unknown versions: {}", .0.join(", "))]
    UnknownVersions(Vec<String>),

    #[error("removal would leave {remaining} versions; at least {required} must remain")]
    TooFewRemaining { remaining: usize, required: usize },
}

/// Keep and remove sets for one cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPlan {
    pub all_versions: Vec<String>,
    pub used_versions: Vec<String>,
    pub active_version: String,
    pub keep_count: usize,
    pub versions_to_keep: Vec<String>,
    pub versions_to_remove: Vec<String>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.versions_to_remove.is_empty()
    }
}

fn normalized(versions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = versions.iter().map(|v| normalize_version(v)).collect();
    sort_versions(&mut out);
    out.dedup();
    out
}

/// Versions that are neither active, used, nor among the `keep_count` newest
pub fn identify_removable_versions(
    all_versions: &[String],
    used_versions: &BTreeSet<String>,
    active_version: &str,
    keep_count: usize,
) -> Vec<String> {
    let all = normalized(all_versions);
    let active = normalize_version(active_version);
    let used: BTreeSet<String> = used_versions.iter().map(|v| normalize_version(v)).collect();

    let mut newest_first = all.clone();
    newest_first.sort_by(|a, b| version_number(b).cmp(&version_number(a)).then_with(|| b.cmp(a)));
    let recent: BTreeSet<&String> = newest_first.iter().take(keep_count).collect();

    all.iter()
        .filter(|v| **v != active && !used.contains(*v) && !recent.contains(v))
        .cloned()
        .collect()
}

/// Check a removal set against every safety rule
pub fn validate_removal(
    all_versions: &[String],
    versions_to_remove: &[String],
    used_versions: &BTreeSet<String>,
    active_version: &str,
    keep_count: usize,
) -> Result<(), PlanValidationError> {
    if keep_count == 0 {
        return Err(PlanValidationError::KeepCountZero);
    }

    let all = normalized(all_versions);
    let remove = normalized(versions_to_remove);
    let active = normalize_version(active_version);

    if !all.contains(&active) {
        return Err(PlanValidationError::ActiveVersionUnknown(active));
    }

    let unknown: Vec<String> = remove.iter().filter(|v| !all.contains(v)).cloned().collect();
    if !unknown.is_empty() {
        return Err(PlanValidationError::UnknownVersions(unknown));
    }

    if remove.contains(&active) {
        return Err(PlanValidationError::ActiveVersionRemoved(active));
    }

    let used: Vec<String> = remove
        .iter()
        .filter(|v| used_versions.iter().any(|u| normalize_version(u) == **v))
        .cloned()
        .collect();
    if !used.is_empty() {
        return Err(PlanValidationError::UsedVersionRemoved(used));
    }

    let remaining = all.len() - remove.len();
    let required = keep_count.min(all.len());
    if remaining < required {
        return Err(PlanValidationError::TooFewRemaining { remaining, required });
    }

    Ok(())
}

/// Compute and verify the keep/remove split
pub fn plan_cleanup(
    all_versions: &[String],
    used_versions: &BTreeSet<String>,
    active_version: &str,
    keep_count: usize,
) -> Result<CleanupPlan, PlanValidationError> {
    if keep_count == 0 {
        return Err(PlanValidationError::KeepCountZero);
    }

    let all = normalized(all_versions);
    let active = normalize_version(active_version);
    if !all.contains(&active) {
        return Err(PlanValidationError::ActiveVersionUnknown(active));
    }

    let versions_to_remove = identify_removable_versions(&all, used_versions, &active, keep_count);
    validate_removal(&all, &versions_to_remove, used_versions, &active, keep_count)?;

    let versions_to_keep: Vec<String> = all
        .iter()
        .filter(|v| !versions_to_remove.contains(v))
        .cloned()
        .collect();
    if !versions_to_keep.contains(&active) {
        return Err(PlanValidationError::ActiveVersionRemoved(active));
    }

    let mut used: Vec<String> = used_versions.iter().map(|v| normalize_version(v)).collect();
    sort_versions(&mut used);
    used.dedup();

    Ok(CleanupPlan {
        all_versions: all,
        used_versions: used,
        active_version: active,
        keep_count,
        versions_to_keep,
        versions_to_remove,
    })
}
