//! Key retirement: analyze, plan, confirm, execute, roll back on failure

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::analysis::{analyze_key_usage, KeyUsageStats, UsageReport, DEFAULT_ANALYSIS_BATCH_SIZE};
use super::planner::{plan_cleanup, validate_removal, CleanupPlan, PlanValidationError, DEFAULT_KEEP_COUNT};
use crate::config_file::{
    backup_configuration, restore_configuration, validate_config_integrity, write_atomically,
    AtomicWriteError, BackupError, ConfigFileError, EnvFile, IntegrityError,
};
use crate::encryption::{normalize_version, EncryptedColumnCodec, SecretsError};
use crate::monitoring::AuditLogger;
use crate::storage::{EncryptedColumnSource, StorageError};

/// Audit event type of cleanup records
pub const CLEANUP_AUDIT_EVENT: &str = "key_cleanup";

/// Writer used for the key file rewrite
pub type AtomicWriter<'a> = Box<dyn Fn(&Path, &[u8]) -> Result<(), AtomicWriteError> + 'a>;

/// Parameters of one cleanup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    /// Key file to rewrite
    pub config_path: PathBuf,

    /// Most recent versions always kept (default: 3)
    pub keep_count: usize,

    /// Report what would be removed without touching the file
    pub dry_run: bool,

    /// Skip the confirmation step
    pub assume_yes: bool,

    /// Rows per analysis batch (default: 500)
    pub batch_size: usize,
}

impl Default for CleanupRequest {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(".env.crypto"),
            keep_count: DEFAULT_KEEP_COUNT,
            dry_run: false,
            assume_yes: false,
            batch_size: DEFAULT_ANALYSIS_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Pending,
    Success,
    NothingToRemove,
    DryRun,
    Cancelled,
    RolledBack,
    Failed,
}

impl fmt::Display for CleanupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupOutcome::Pending => "pending",
            CleanupOutcome::Success => "success",
            CleanupOutcome::NothingToRemove => "nothing_to_remove",
            CleanupOutcome::DryRun => "dry_run",
            CleanupOutcome::Cancelled => "cancelled",
            CleanupOutcome::RolledBack => "rolled_back",
            CleanupOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Audit trail of one key retirement attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupOperation {
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config_path: PathBuf,
    pub column: Option<String>,
    pub all_versions: Vec<String>,
    pub used_versions: Vec<String>,
    pub active_version: Option<String>,
    pub keep_count: usize,
    pub versions_to_keep: Vec<String>,
    pub versions_to_remove: Vec<String>,
    pub usage: Vec<KeyUsageStats>,
    pub backup_path: Option<PathBuf>,
    pub dry_run: bool,
    pub rolled_back: bool,
    pub outcome: CleanupOutcome,
    pub error: Option<String>,
    /// Key file lines the removal deletes; never written to the audit log
    #[serde(skip)]
    pub lines_to_remove: Vec<String>,
}

impl CleanupOperation {
    fn new(request: &CleanupRequest) -> Self {
        let started_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            operation_id: format!(
                "cleanup_{}_{}",
                started_at.format("%Y%m%d_%H%M%S"),
                &suffix[..8]
            ),
            started_at,
            finished_at: None,
            config_path: request.config_path.clone(),
            column: None,
            all_versions: Vec::new(),
            used_versions: Vec::new(),
            active_version: None,
            keep_count: request.keep_count,
            versions_to_keep: Vec::new(),
            versions_to_remove: Vec::new(),
            usage: Vec::new(),
            backup_path: None,
            dry_run: request.dry_run,
            rolled_back: false,
            outcome: CleanupOutcome::Pending,
            error: None,
            lines_to_remove: Vec::new(),
        }
    }

    fn apply_plan(&mut self, plan: CleanupPlan) {
        self.all_versions = plan.all_versions;
        self.used_versions = plan.used_versions;
        self.active_version = Some(plan.active_version);
        self.keep_count = plan.keep_count;
        self.versions_to_keep = plan.versions_to_keep;
        self.versions_to_remove = plan.versions_to_remove;
    }
}

/// Operator confirmation before the key file is rewritten
pub trait Confirm {
    fn confirm(&mut self, operation: &CleanupOperation) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(&CleanupOperation) -> bool,
{
    fn confirm(&mut self, operation: &CleanupOperation) -> bool {
        self(operation)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("invalid cleanup request: {0}")]
    InvalidRequest(String),

    #[error("key usage analysis failed: {0}")]
    Analysis(#[from] StorageError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("unsafe removal rejected: {0}")]
    Validation(#[from] PlanValidationError),

    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("rewriting the key file failed: {0}")]
    AtomicWrite(#[from] AtomicWriteError),

    #[error("key file failed integrity check after rewrite: {0}")]
    PostMutationIntegrity(#[from] IntegrityError),

    #[error("ROLLBACK FAILED: restore manually from {backup} ({restore_error}); original failure: {original}")]
    Rollback {
        backup: PathBuf,
        restore_error: String,
        original: String,
    },
}

/// A cleanup that ended in error, with its audit record
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CleanupFailure {
    pub operation: Box<CleanupOperation>,
    #[source]
    pub error: CleanupError,
}

/// Retires unused key versions from the key file and from the running manager.
///
/// The file is backed up before it is rewritten; any failure after the
/// backup other than the atomic write itself restores it.
pub struct KeyCleanupOrchestrator<'a> {
    codec: &'a EncryptedColumnCodec,
    audit: AuditLogger,
    writer: AtomicWriter<'a>,
}

impl<'a> KeyCleanupOrchestrator<'a> {
    pub fn new(codec: &'a EncryptedColumnCodec) -> Self {
        Self {
            codec,
            audit: AuditLogger::default(),
            writer: Box::new(write_atomically),
        }
    }

    pub fn with_audit_logger(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Replace the atomic writer used for the key file rewrite
    pub fn with_writer(mut self, writer: AtomicWriter<'a>) -> Self {
        self.writer = writer;
        self
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Analyze usage in `source`, then remove every version the plan allows
    pub fn run(
        &self,
        request: &CleanupRequest,
        source: &dyn EncryptedColumnSource,
        confirm: &mut dyn Confirm,
    ) -> Result<CleanupOperation, CleanupFailure> {
        let mut operation = CleanupOperation::new(request);
        operation.column = Some(source.describe());
        info!(operation_id = %operation.operation_id, column = %source.describe(), "Starting key cleanup");

        let planned = self.analyze_and_plan(request, source, &mut operation);
        if let Err(error) = planned {
            return Err(self.finish_failed(operation, error));
        }
        self.proceed(request, operation, confirm)
    }

    /// Remove explicit versions without usage analysis
    pub fn remove_versions(
        &self,
        request: &CleanupRequest,
        versions: &[String],
        confirm: &mut dyn Confirm,
    ) -> Result<CleanupOperation, CleanupFailure> {
        let mut operation = CleanupOperation::new(request);
        info!(operation_id = %operation.operation_id, versions = ?versions, "Starting manual version removal");

        let planned = self.plan_manual(request, versions, &mut operation);
        if let Err(error) = planned {
            return Err(self.finish_failed(operation, error));
        }
        self.proceed(request, operation, confirm)
    }

    /// Usage analysis only
    pub fn analyze(
        &self,
        source: &dyn EncryptedColumnSource,
        batch_size: usize,
    ) -> Result<UsageReport, StorageError> {
        analyze_key_usage(source, self.codec, batch_size)
    }

    fn configured_versions(&self, request: &CleanupRequest) -> Result<(EnvFile, Vec<String>, String), CleanupError> {
        let layout = self.codec.manager().layout();
        let file = EnvFile::load(&request.config_path)?;
        let all = file.versions(layout);
        let active = match file.active_version(layout) {
            Some(active) => active,
            None => self.codec.manager().get_active_version()?,
        };
        Ok((file, all, active))
    }

    fn analyze_and_plan(
        &self,
        request: &CleanupRequest,
        source: &dyn EncryptedColumnSource,
        operation: &mut CleanupOperation,
    ) -> Result<(), CleanupError> {
        if request.keep_count == 0 {
            return Err(PlanValidationError::KeepCountZero.into());
        }

        info!(operation_id = %operation.operation_id, "Phase 1: analyzing key usage");
        let report = analyze_key_usage(source, self.codec, request.batch_size)?;

        let (file, all, active) = self.configured_versions(request)?;
        operation.all_versions = all.clone();
        operation.active_version = Some(active.clone());
        operation.usage = report.stats(&all, &active);

        info!(operation_id = %operation.operation_id, "Phase 2: planning removal");
        let plan = plan_cleanup(&all, &report.used_versions(), &active, request.keep_count)?;
        operation.lines_to_remove = file.version_lines(&plan.versions_to_remove, self.codec.manager().layout());
        operation.apply_plan(plan);
        Ok(())
    }

    fn plan_manual(
        &self,
        request: &CleanupRequest,
        versions: &[String],
        operation: &mut CleanupOperation,
    ) -> Result<(), CleanupError> {
        if versions.is_empty() {
            return Err(CleanupError::InvalidRequest("no versions given".to_string()));
        }

        let (file, all, active) = self.configured_versions(request)?;
        operation.all_versions = all.clone();
        operation.active_version = Some(active.clone());

        validate_removal(&all, versions, &BTreeSet::new(), &active, request.keep_count)?;

        let remove: Vec<String> = all
            .iter()
            .filter(|v| versions.iter().any(|r| normalize_version(r) == **v))
            .cloned()
            .collect();
        operation.lines_to_remove = file.version_lines(&remove, self.codec.manager().layout());
        operation.versions_to_keep = all.iter().filter(|v| !remove.contains(v)).cloned().collect();
        operation.versions_to_remove = remove;
        Ok(())
    }

    fn proceed(
        &self,
        request: &CleanupRequest,
        mut operation: CleanupOperation,
        confirm: &mut dyn Confirm,
    ) -> Result<CleanupOperation, CleanupFailure> {
        if operation.versions_to_remove.is_empty() {
            info!(operation_id = %operation.operation_id, "No key versions to remove");
            return Ok(self.finish(operation, CleanupOutcome::NothingToRemove));
        }

        info!(
            operation_id = %operation.operation_id,
            remove = ?operation.versions_to_remove,
            keep = ?operation.versions_to_keep,
            "Phase 3: confirmation"
        );
        if request.dry_run {
            return Ok(self.finish(operation, CleanupOutcome::DryRun));
        }
        if !request.assume_yes && !confirm.confirm(&operation) {
            info!(operation_id = %operation.operation_id, "Cleanup cancelled by operator");
            return Ok(self.finish(operation, CleanupOutcome::Cancelled));
        }

        info!(operation_id = %operation.operation_id, "Phase 4: executing removal");
        let backup = match backup_configuration(&request.config_path) {
            Ok(backup) => backup,
            Err(e) => return Err(self.finish_failed(operation, e.into())),
        };
        operation.backup_path = Some(backup.path.clone());

        match self.execute(request, &operation.versions_to_remove) {
            Ok(removed) => {
                info!(operation_id = %operation.operation_id, removed = ?removed, "Key versions removed");
                Ok(self.finish(operation, CleanupOutcome::Success))
            }
            Err(error @ CleanupError::AtomicWrite(_)) => {
                warn!(operation_id = %operation.operation_id, "Atomic write failed; key file was not replaced");
                Err(self.finish_failed(operation, error))
            }
            Err(error) => self.roll_back(request, operation, &backup.path, error),
        }
    }

    fn execute(&self, request: &CleanupRequest, versions: &[String]) -> Result<Vec<String>, CleanupError> {
        let layout = self.codec.manager().layout();

        let mut file = EnvFile::load(&request.config_path)?;
        let removed_lines = file.remove_versions(versions, layout);
        file.touch_timestamp(Utc::now());
        (self.writer)(&request.config_path, file.render().as_bytes())?;
        info!(path = %request.config_path.display(), removed_lines, "Key file rewritten");

        let summary = validate_config_integrity(&request.config_path, layout)?;
        info!(active_version = %summary.active_version, versions = ?summary.versions, "Key file integrity verified");

        Ok(self.codec.manager().remove_versions(versions)?)
    }

    fn roll_back(
        &self,
        request: &CleanupRequest,
        mut operation: CleanupOperation,
        backup: &Path,
        error: CleanupError,
    ) -> Result<CleanupOperation, CleanupFailure> {
        warn!(operation_id = %operation.operation_id, error = %error, backup = %backup.display(), "Cleanup failed; restoring key file from backup");

        match restore_configuration(backup, &request.config_path) {
            Ok(()) => {
                operation.rolled_back = true;
                operation.error = Some(error.to_string());
                let operation = self.finish(operation, CleanupOutcome::RolledBack);
                Err(CleanupFailure {
                    operation: Box::new(operation),
                    error,
                })
            }
            Err(restore) => {
                error!(
                    operation_id = %operation.operation_id,
                    backup = %backup.display(),
                    error = %restore,
                    "Rollback failed; key file must be restored manually"
                );
                let error = CleanupError::Rollback {
                    backup: backup.to_path_buf(),
                    restore_error: restore.to_string(),
                    original: error.to_string(),
                };
                Err(self.finish_failed(operation, error))
            }
        }
    }

    fn finish(&self, mut operation: CleanupOperation, outcome: CleanupOutcome) -> CleanupOperation {
        operation.outcome = outcome;
        operation.finished_at = Some(Utc::now());
        self.audit.record(CLEANUP_AUDIT_EVENT, &operation);
        operation
    }

    fn finish_failed(&self, mut operation: CleanupOperation, error: CleanupError) -> CleanupFailure {
        operation.error = Some(error.to_string());
        let operation = self.finish(operation, CleanupOutcome::Failed);
        CleanupFailure {
            operation: Box::new(operation),
            error,
        }
    }
}
