//! Batch loop driving a re-encryption job

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, info, warn};

use super::job::{JobStatus, NewJob, ReencryptJob};
use super::job_store::JobStore;
use super::JobError;
use crate::encryption::{normalize_version, CodecError, EncryptedColumnCodec};
use crate::storage::{EncryptedColumnSource, PkValue, RawRecord, StorageError};

/// Re-encryption run options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptOptions {
    /// Rows fetched per batch (default: 500)
    pub batch_size: usize,

    /// Rows between intermediate commits inside a batch (default: 1000)
    pub commit_every: usize,

    /// Roll back every batch instead of committing
    pub dry_run: bool,
}

impl Default for ReencryptOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            commit_every: 1000,
            dry_run: false,
        }
    }
}

impl ReencryptOptions {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.batch_size == 0 {
            return Err(JobError::InvalidOptions("batch size must be at least 1".to_string()));
        }
        if self.commit_every == 0 {
            return Err(JobError::InvalidOptions("commit interval must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Which job a run works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSelector {
    /// Always start a new job
    New,
    /// Continue the latest unfinished job for the column, or start one
    Resume,
    /// Continue a specific job
    ById(i64),
}

/// Receives the job after every batch
pub trait ProgressObserver {
    fn on_progress(&mut self, job: &ReencryptJob);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ReencryptJob),
{
    fn on_progress(&mut self, job: &ReencryptJob) {
        self(job)
    }
}

/// Final state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: i64,
    pub target: String,
    pub target_version: String,
    pub status: JobStatus,
    pub total_records: u64,
    pub processed: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

impl JobSummary {
    fn new(job: &ReencryptJob, started: Instant) -> Self {
        Self {
            job_id: job.id,
            target: format!("{}.{}", job.model_path, job.column_name),
            target_version: job.target_version.clone(),
            status: job.status,
            total_records: job.total_records,
            processed: job.processed,
            migrated: job.migrated(),
            skipped: job.skipped,
            errors: job.errors,
            last_error: job.last_error.clone(),
            dry_run: job.dry_run,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Per-row outcome
enum RowOutcome {
    Skipped,
    Rewritten,
}

#[derive(Debug, thiserror::Error)]
enum RowError {
    #[error("{0}")]
    Codec(#[from] CodecError),

    #[error("write failed: {0}")]
    Write(#[from] StorageError),
}

/// Walks one column and rewrites every value not yet under the active version.
///
/// Checkpoints are written through `jobs`, which must share the source's
/// connection so a committed batch and its checkpoint land together.
pub struct ReencryptionRunner<'a> {
    codec: &'a EncryptedColumnCodec,
    source: &'a dyn EncryptedColumnSource,
    jobs: &'a JobStore<'a>,
    options: ReencryptOptions,
    observer: Option<Box<dyn ProgressObserver + 'a>>,
}

impl<'a> ReencryptionRunner<'a> {
    pub fn new(
        codec: &'a EncryptedColumnCodec,
        source: &'a dyn EncryptedColumnSource,
        jobs: &'a JobStore<'a>,
        options: ReencryptOptions,
    ) -> Self {
        Self {
            codec,
            source,
            jobs,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Pick or create the job described by `selector` without running it
    pub fn select_job(&self, selector: JobSelector) -> Result<ReencryptJob, JobError> {
        let (model, column) = (self.source.model(), self.source.column());

        match selector {
            JobSelector::New => self.create_job(),
            JobSelector::Resume => match self.jobs.find_resumable(model, column, self.options.dry_run)? {
                Some(job) => {
                    info!(job_id = job.id, status = %job.status, last_pk = ?job.last_pk, "Resuming re-encryption job");
                    Ok(job)
                }
                None => {
                    info!(column = %self.source.describe(), "No unfinished job to resume; starting a new one");
                    self.create_job()
                }
            },
            JobSelector::ById(id) => {
                let job = self.jobs.get(id)?;
                if job.model_path != model || job.column_name != column {
                    return Err(JobError::JobMismatch {
                        id,
                        model: job.model_path,
                        column: job.column_name,
                        requested: self.source.describe(),
                    });
                }
                if !job.status.is_resumable() {
                    return Err(JobError::NotResumable { id, status: job.status });
                }
                if job.dry_run != self.options.dry_run {
                    warn!(job_id = id, dry_run = job.dry_run, "Job keeps the dry-run mode it was created with");
                }
                Ok(job)
            }
        }
    }

    fn create_job(&self) -> Result<ReencryptJob, JobError> {
        let target_version = self.codec.manager().get_active_version()?;
        let total_records = self.source.count()?;

        self.jobs.create(&NewJob {
            model_path: self.source.model().to_string(),
            column_name: self.source.column().to_string(),
            pk_name: self.source.primary_key().to_string(),
            target_version,
            total_records,
            dry_run: self.options.dry_run,
        })
    }

    /// Run the selected job to completion
    pub fn run(&mut self, selector: JobSelector) -> Result<JobSummary, JobError> {
        self.options.validate()?;
        let mut job = self.select_job(selector)?;
        self.run_job(&mut job)
    }

    /// Run an already selected job
    pub fn run_job(&mut self, job: &mut ReencryptJob) -> Result<JobSummary, JobError> {
        let started = Instant::now();

        job.transition(JobStatus::Running)?;
        self.jobs.save(job)?;
        info!(
            job_id = job.id,
            column = %self.source.describe(),
            target_version = %job.target_version,
            dry_run = job.dry_run,
            "Starting re-encryption"
        );

        let mut cursor = match job.last_pk.clone() {
            Some(pk) => match self.source.parse_cursor(&pk) {
                Ok(cursor) => Some(cursor),
                Err(e) => {
                    let checkpoint = job.clone();
                    return Err(self.fail(job, checkpoint, e.to_string()));
                }
            },
            None => None,
        };

        loop {
            self.ensure_target_active(job)?;

            let mut checkpoint = job.clone();
            match self.run_batch(job, &mut checkpoint, cursor.as_ref()) {
                Ok(Some(next)) => cursor = Some(next),
                Ok(None) => break,
                Err(e) => return Err(self.fail(job, checkpoint, e.to_string())),
            }

            if let Some(observer) = self.observer.as_mut() {
                observer.on_progress(job);
            }
        }

        job.transition(JobStatus::Finished)?;
        self.jobs.save(job)?;

        let summary = JobSummary::new(job, started);
        info!(
            job_id = summary.job_id,
            processed = summary.processed,
            migrated = summary.migrated,
            skipped = summary.skipped,
            errors = summary.errors,
            duration_ms = summary.duration_ms,
            "Re-encryption finished"
        );
        Ok(summary)
    }

    /// Pause the job when the active version moved away from its target
    fn ensure_target_active(&self, job: &mut ReencryptJob) -> Result<(), JobError> {
        let active = match self.codec.manager().get_active_version() {
            Ok(active) => active,
            Err(e) => {
                let checkpoint = job.clone();
                return Err(self.fail(job, checkpoint, e.to_string()));
            }
        };
        if active == normalize_version(&job.target_version) {
            return Ok(());
        }

        let message = format!(
            "active version changed from {} to {}; start a new job for the new target",
            job.target_version, active
        );
        warn!(job_id = job.id, target_version = %job.target_version, active_version = %active, "Pausing re-encryption job");
        job.last_error = Some(message);
        job.transition(JobStatus::Paused)?;
        self.jobs.save(job)?;

        Err(JobError::TargetVersionChanged {
            id: job.id,
            target: job.target_version.clone(),
            active,
        })
    }

    /// Process one batch; returns the cursor for the next one, or `None` when the column is exhausted.
    ///
    /// `checkpoint` tracks the last job state made durable by a commit.
    fn run_batch(
        &self,
        job: &mut ReencryptJob,
        checkpoint: &mut ReencryptJob,
        after: Option<&PkValue>,
    ) -> Result<Option<PkValue>, JobError> {
        let rows = self.source.iterate_ordered_by_pk(after, self.options.batch_size)?;
        let Some(last) = rows.last().map(|r| r.pk.clone()) else {
            return Ok(None);
        };

        self.source.begin()?;
        if let Err(e) = self.process_rows(job, checkpoint, &rows) {
            if let Err(rollback) = self.source.rollback() {
                error!(job_id = job.id, error = %rollback, "Rollback after batch failure failed");
            }
            return Err(e);
        }

        if job.dry_run {
            self.source.rollback()?;
            self.jobs.save(job)?;
        } else {
            self.jobs.save(job)?;
            self.source.commit()?;
        }

        info!(
            job_id = job.id,
            processed = job.processed,
            total = job.total_records,
            last_pk = %last,
            "Batch complete"
        );
        Ok(Some(last))
    }

    fn process_rows(
        &self,
        job: &mut ReencryptJob,
        checkpoint: &mut ReencryptJob,
        rows: &[RawRecord],
    ) -> Result<(), JobError> {
        let mut since_commit = 0;

        for record in rows {
            let pk = record.pk.to_string();
            match self.process_row(job, record) {
                Ok(RowOutcome::Skipped) => job.skipped += 1,
                Ok(RowOutcome::Rewritten) => {}
                Err(e) => {
                    warn!(job_id = job.id, pk = %pk, error = %e, "Row could not be re-encrypted");
                    job.record_error(format!("pk {}: {}", pk, e));
                }
            }
            job.advance(&pk);

            since_commit += 1;
            if !job.dry_run && since_commit >= self.options.commit_every {
                self.jobs.save(job)?;
                self.source.commit()?;
                *checkpoint = job.clone();
                self.source.begin()?;
                since_commit = 0;
            }
        }
        Ok(())
    }

    fn process_row(&self, job: &ReencryptJob, record: &RawRecord) -> Result<RowOutcome, RowError> {
        let stored = match record.value.as_deref() {
            Some(stored) if !stored.is_empty() => stored,
            _ => return Ok(RowOutcome::Skipped),
        };

        let (version, plaintext) = self.codec.decode_with_version(stored)?;
        if version == normalize_version(&job.target_version) {
            return Ok(RowOutcome::Skipped);
        }

        let rewritten = self.codec.seal(&plaintext)?;
        if !job.dry_run {
            self.source.write_value(&record.pk, &rewritten)?;
        }
        Ok(RowOutcome::Rewritten)
    }

    /// Restore the last durable checkpoint, mark the job failed and persist it
    fn fail(&self, job: &mut ReencryptJob, checkpoint: ReencryptJob, message: String) -> JobError {
        *job = checkpoint;
        job.last_error = Some(message.clone());
        if let Err(e) = job.transition(JobStatus::Failed) {
            error!(job_id = job.id, error = %e, "Could not mark job failed");
        } else if let Err(e) = self.jobs.save(job) {
            error!(job_id = job.id, error = %e, "Could not persist failed job state");
        }
        error!(job_id = job.id, error = %message, "Re-encryption job failed");

        JobError::Failed { id: job.id, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{KeyEntry, KeyStore, MapEnv, SecretsManager, SecretsManagerConfig};
    use crate::storage::SqliteColumnSource;
    use rusqlite::{params, Connection};
    use std::cell::Cell;
    use std::sync::Arc;

    fn codec(active: &str) -> EncryptedColumnCodec {
        let mut store = KeyStore::new();
        for version in ["v1", "v2"] {
            store.insert(version, KeyEntry::new(format!("k-{}", version), format!("s-{}", version)));
        }
        store.set_active_version(active);
        let config = SecretsManagerConfig {
            kdf_iterations: 1_000,
            ..Default::default()
        };
        EncryptedColumnCodec::new(Arc::new(SecretsManager::install(config, store, Arc::new(MapEnv::new()))))
    }

    fn seed(conn: &Connection, codec: &EncryptedColumnCodec, rows: i64) {
        conn.execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, email TEXT)").unwrap();
        for id in 1..=rows {
            let stored = codec.encode(&format!("user{}@example.com", id)).unwrap();
            conn.execute("INSERT INTO people (id, email) VALUES (?1, ?2)", params![id, stored]).unwrap();
        }
    }

    fn emails(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT email FROM people WHERE email IS NOT NULL ORDER BY id").unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.collect::<Result<Vec<String>, _>>().unwrap()
    }

    #[test]
    fn test_migrates_every_row_to_active_version() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, &codec("v1"), 7);
        conn.execute("INSERT INTO people (id, email) VALUES (8, NULL)", []).unwrap();

        let codec = codec("v2");
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();
        let options = ReencryptOptions { batch_size: 3, commit_every: 2, dry_run: false };

        let mut batches = 0;
        let decrypted_before = codec.manager().statistics().decryptions;
        let summary = ReencryptionRunner::new(&codec, &source, &jobs, options)
            .with_observer(|_: &ReencryptJob| batches += 1)
            .run(JobSelector::New)
            .unwrap();
        // one decryption per migrated row
        assert_eq!(codec.manager().statistics().decryptions - decrypted_before, 7);

        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.processed, 8);
        assert_eq!(summary.migrated, 7);
        assert_eq!(summary.skipped, 1);
        assert_eq!(batches, 3);

        let stored = emails(&conn);
        assert!(stored.iter().all(|s| s.starts_with("v2:")));
        assert_eq!(codec.decode(&stored[0]).unwrap(), "user1@example.com");

        let job = jobs.get(summary.job_id).unwrap();
        assert_eq!(job.last_pk.as_deref(), Some("8"));
        assert_eq!(job.status, JobStatus::Finished);
    }

    #[test]
    fn test_second_run_skips_everything() {
        let conn = Connection::open_in_memory().unwrap();
        let codec = codec("v2");
        seed(&conn, &codec, 4);
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();

        let before = emails(&conn);
        let summary = ReencryptionRunner::new(&codec, &source, &jobs, ReencryptOptions::default())
            .run(JobSelector::New)
            .unwrap();

        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.migrated, 0);
        assert_eq!(emails(&conn), before);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, &codec("v1"), 5);
        let before = emails(&conn);

        let codec = codec("v2");
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();
        let options = ReencryptOptions { batch_size: 2, dry_run: true, ..Default::default() };

        let summary = ReencryptionRunner::new(&codec, &source, &jobs, options)
            .run(JobSelector::New)
            .unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.migrated, 5);
        assert_eq!(emails(&conn), before);
        assert_eq!(jobs.get(summary.job_id).unwrap().processed, 5);
    }

    #[test]
    fn test_bad_rows_are_counted_not_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, &codec("v1"), 3);
        conn.execute("UPDATE people SET email = 'v1:not-a-token' WHERE id = 2", []).unwrap();

        let codec = codec("v2");
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();

        let summary = ReencryptionRunner::new(&codec, &source, &jobs, ReencryptOptions::default())
            .run(JobSelector::New)
            .unwrap();

        assert_eq!(summary.status, JobStatus::Finished);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.migrated, 2);
        assert!(summary.last_error.unwrap().starts_with("pk 2:"));
    }

    /// Delegates to SQLite but fails the `fail_on`-th commit
    struct FailingCommit<'c> {
        inner: SqliteColumnSource<'c>,
        commits: Cell<usize>,
        fail_on: usize,
    }

    impl EncryptedColumnSource for FailingCommit<'_> {
        fn model(&self) -> &str {
            self.inner.model()
        }

        fn column(&self) -> &str {
            self.inner.column()
        }

        fn primary_key(&self) -> &str {
            self.inner.primary_key()
        }

        fn count(&self) -> Result<u64, StorageError> {
            self.inner.count()
        }

        fn parse_cursor(&self, cursor: &str) -> Result<PkValue, StorageError> {
            self.inner.parse_cursor(cursor)
        }

        fn iterate_ordered_by_pk(&self, after: Option<&PkValue>, batch_size: usize) -> Result<Vec<RawRecord>, StorageError> {
            self.inner.iterate_ordered_by_pk(after, batch_size)
        }

        fn write_value(&self, pk: &PkValue, stored: &str) -> Result<(), StorageError> {
            self.inner.write_value(pk, stored)
        }

        fn begin(&self) -> Result<(), StorageError> {
            self.inner.begin()
        }

        fn commit(&self) -> Result<(), StorageError> {
            let n = self.commits.get() + 1;
            self.commits.set(n);
            if n == self.fail_on {
                return Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                    Some("disk I/O error".to_string()),
                )));
            }
            self.inner.commit()
        }

        fn rollback(&self) -> Result<(), StorageError> {
            self.inner.rollback()
        }
    }

    #[test]
    fn test_failure_keeps_progress_of_intermediate_commit() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, &codec("v1"), 5);

        let codec = codec("v2");
        let source = FailingCommit {
            inner: SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap(),
            commits: Cell::new(0),
            fail_on: 2,
        };
        let jobs = JobStore::open(&conn).unwrap();
        let options = ReencryptOptions { batch_size: 5, commit_every: 2, dry_run: false };

        let result = ReencryptionRunner::new(&codec, &source, &jobs, options).run(JobSelector::New);
        assert!(matches!(result, Err(JobError::Failed { .. })));

        let job = jobs.list(None, 1).unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed, 2);
        assert_eq!(job.last_pk.as_deref(), Some("2"));
        assert!(job.last_error.unwrap().contains("disk I/O error"));

        let stored = emails(&conn);
        assert!(stored[..2].iter().all(|s| s.starts_with("v2:")));
        assert!(stored[2..].iter().all(|s| s.starts_with("v1:")));
    }

    #[test]
    fn test_rotation_mid_job_pauses() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, &codec("v1"), 4);

        let codec = codec("v2");
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();
        let options = ReencryptOptions { batch_size: 2, ..Default::default() };

        let manager = Arc::clone(codec.manager());
        let mut rotated = false;
        let result = ReencryptionRunner::new(&codec, &source, &jobs, options)
            .with_observer(move |_: &ReencryptJob| {
                if !rotated {
                    manager.rotate_to_new_version("v3", "k-v3", Some(b"s-v3"), None).unwrap();
                    rotated = true;
                }
            })
            .run(JobSelector::New);

        assert!(matches!(result, Err(JobError::TargetVersionChanged { ref active, .. }) if active == "v3"));
        let job = jobs.list(None, 1).unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.processed, 2);
        assert!(job.last_error.is_some());
    }

    #[test]
    fn test_job_selection_rules() {
        let conn = Connection::open_in_memory().unwrap();
        let codec = codec("v2");
        seed(&conn, &codec, 1);
        let source = SqliteColumnSource::for_table(&conn, "person", "people", "email").unwrap();
        let jobs = JobStore::open(&conn).unwrap();
        let mut runner = ReencryptionRunner::new(&codec, &source, &jobs, ReencryptOptions::default());

        let finished = runner.run(JobSelector::Resume).unwrap();
        assert!(matches!(
            runner.run(JobSelector::ById(finished.job_id)),
            Err(JobError::NotResumable { status: JobStatus::Finished, .. })
        ));
        assert!(matches!(runner.run(JobSelector::ById(404)), Err(JobError::NotFound(404))));

        let other = jobs
            .create(&NewJob {
                model_path: "movie".into(),
                column_name: "title".into(),
                pk_name: "id".into(),
                target_version: "v2".into(),
                total_records: 0,
                dry_run: false,
            })
            .unwrap();
        assert!(matches!(runner.run(JobSelector::ById(other.id)), Err(JobError::JobMismatch { .. })));

        let zero = ReencryptOptions { batch_size: 0, ..Default::default() };
        let mut invalid = ReencryptionRunner::new(&codec, &source, &jobs, zero);
        assert!(matches!(invalid.run(JobSelector::New), Err(JobError::InvalidOptions(_))));
    }
}
