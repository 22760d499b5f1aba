//! SQLite persistence for re-encryption jobs

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::job::{JobStatus, NewJob, ReencryptJob};
use super::JobError;

const JOB_COLUMNS: &str = "id, model_path, column_name, pk_name, last_pk, target_version, status, \
     total_records, processed, skipped, errors, last_error, dry_run, created_at, updated_at";

/// Default number of jobs returned by [`JobStore::list`]
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Default age in days after which [`JobStore::cleanup`] deletes jobs
pub const DEFAULT_CLEANUP_DAYS: i64 = 7;

/// What a job cleanup removed (or would remove)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCleanupReport {
    pub finished_removed: usize,
    pub stalled_removed: usize,
    pub dry_run: bool,
}

impl JobCleanupReport {
    pub fn total(&self) -> usize {
        self.finished_removed + self.stalled_removed
    }
}

/// Job table on a borrowed connection.
///
/// Sharing the connection with the data source puts checkpoint updates in
/// the same transaction as the rows they describe.
pub struct JobStore<'c> {
    conn: &'c Connection,
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

fn as_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<ReencryptJob> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(ReencryptJob {
        id: row.get(0)?,
        model_path: row.get(1)?,
        column_name: row.get(2)?,
        pk_name: row.get(3)?,
        last_pk: row.get(4)?,
        target_version: row.get(5)?,
        status,
        total_records: count(row.get(7)?),
        processed: count(row.get(8)?),
        skipped: count(row.get(9)?),
        errors: count(row.get(10)?),
        last_error: row.get(11)?,
        dry_run: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl<'c> JobStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Open the store, creating the job table when missing
    pub fn open(conn: &'c Connection) -> Result<Self, JobError> {
        let store = Self::new(conn);
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn ensure_schema(&self) -> Result<(), JobError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reencrypt_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_path TEXT NOT NULL,
                column_name TEXT NOT NULL,
                pk_name TEXT NOT NULL,
                last_pk TEXT,
                target_version TEXT NOT NULL,
                status TEXT NOT NULL,
                total_records INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                dry_run INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reencrypt_jobs_target
                ON reencrypt_jobs (model_path, column_name, status);",
        )?;
        Ok(())
    }

    pub fn create(&self, new: &NewJob) -> Result<ReencryptJob, JobError> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO reencrypt_jobs
                (model_path, column_name, pk_name, target_version, status, total_records, dry_run, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                new.model_path,
                new.column_name,
                new.pk_name,
                new.target_version,
                JobStatus::Pending.as_str(),
                as_sql_count(new.total_records),
                new.dry_run,
                now,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        info!(
            job_id = id,
            column = %format!("{}.{}", new.model_path, new.column_name),
            target_version = %new.target_version,
            total_records = new.total_records,
            "Created re-encryption job"
        );
        self.get(id)
    }

    pub fn get(&self, id: i64) -> Result<ReencryptJob, JobError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM reencrypt_jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                read_job,
            )
            .optional()?
            .ok_or(JobError::NotFound(id))
    }

    /// Most recently updated pending, running or paused job for `model.column`
    pub fn find_resumable(
        &self,
        model: &str,
        column: &str,
        dry_run: bool,
    ) -> Result<Option<ReencryptJob>, JobError> {
        let job = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM reencrypt_jobs
                     WHERE model_path = ?1 AND column_name = ?2 AND status IN (?3, ?4, ?5) AND dry_run = ?6
                     ORDER BY updated_at DESC, id DESC LIMIT 1",
                    JOB_COLUMNS
                ),
                params![
                    model,
                    column,
                    JobStatus::Pending.as_str(),
                    JobStatus::Running.as_str(),
                    JobStatus::Paused.as_str(),
                    dry_run,
                ],
                read_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Persist every mutable field and stamp `updated_at`
    pub fn save(&self, job: &mut ReencryptJob) -> Result<(), JobError> {
        job.updated_at = Utc::now();
        let changed = self.conn.execute(
            "UPDATE reencrypt_jobs SET
                last_pk = ?2, status = ?3, total_records = ?4, processed = ?5, skipped = ?6,
                errors = ?7, last_error = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                job.id,
                job.last_pk,
                job.status.as_str(),
                as_sql_count(job.total_records),
                as_sql_count(job.processed),
                as_sql_count(job.skipped),
                as_sql_count(job.errors),
                job.last_error,
                job.updated_at,
            ],
        )?;

        if changed == 0 {
            return Err(JobError::NotFound(job.id));
        }
        debug!(job_id = job.id, status = %job.status, processed = job.processed, last_pk = ?job.last_pk, "Saved job checkpoint");
        Ok(())
    }

    /// Jobs newest first, optionally filtered by status
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<ReencryptJob>, JobError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM reencrypt_jobs WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], read_job)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM reencrypt_jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], read_job)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(jobs)
    }

    /// Delete finished/failed jobs and stalled running/pending jobs; paused jobs are kept
    pub fn cleanup(
        &self,
        finished_older_than_days: i64,
        stalled_older_than_days: i64,
        dry_run: bool,
    ) -> Result<JobCleanupReport, JobError> {
        let now = Utc::now();
        let finished_cutoff = now - Duration::days(finished_older_than_days.max(0));
        let stalled_cutoff = now - Duration::days(stalled_older_than_days.max(0));

        let finished = self.cleanup_where(
            [JobStatus::Finished, JobStatus::Failed],
            finished_cutoff,
            dry_run,
        )?;
        let stalled = self.cleanup_where(
            [JobStatus::Running, JobStatus::Pending],
            stalled_cutoff,
            dry_run,
        )?;

        let report = JobCleanupReport {
            finished_removed: finished,
            stalled_removed: stalled,
            dry_run,
        };
        info!(
            finished = report.finished_removed,
            stalled = report.stalled_removed,
            dry_run,
            "Re-encryption job cleanup complete"
        );
        Ok(report)
    }

    fn cleanup_where(
        &self,
        statuses: [JobStatus; 2],
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize, JobError> {
        let filter = "FROM reencrypt_jobs WHERE status IN (?1, ?2) AND updated_at < ?3";
        let (first, second) = (statuses[0].as_str(), statuses[1].as_str());

        if dry_run {
            let matching: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) {}", filter),
                params![first, second, cutoff],
                |row| row.get(0),
            )?;
            Ok(count(matching) as usize)
        } else {
            Ok(self
                .conn
                .execute(&format!("DELETE {}", filter), params![first, second, cutoff])?)
        }
    }
}
