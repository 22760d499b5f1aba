//! Re-encryption job record and its state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JobError;

/// Job lifecycle state
///
/// `pending -> running -> {finished | failed}`, with `running <-> paused`.
/// A `running` job found after a crash may be resumed as `running` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// States a `--resume` lookup will pick up
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Paused)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
        )
    }

    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Paused,
    ];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| JobError::UnknownStatus(s.to_string()))
    }
}

/// Fields fixed when a job is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub model_path: String,
    pub column_name: String,
    pub pk_name: String,
    pub target_version: String,
    pub total_records: u64,
    pub dry_run: bool,
}

/// Durable progress of one re-encryption run over one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptJob {
    pub id: i64,
    pub model_path: String,
    pub column_name: String,
    pub pk_name: String,
    /// Last processed primary key; the scan resumes after it
    pub last_pk: Option<String>,
    pub target_version: String,
    pub status: JobStatus,
    pub total_records: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReencryptJob {
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Count a visited row and move the checkpoint past it
    pub fn advance(&mut self, pk: &str) {
        self.processed += 1;
        if self.processed > self.total_records {
            self.total_records = self.processed;
        }
        self.last_pk = Some(pk.to_string());
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(message.into());
    }

    /// Rows rewritten (or that would be, in a dry run)
    pub fn migrated(&self) -> u64 {
        self.processed.saturating_sub(self.skipped + self.errors)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_records == 0 {
            100.0
        } else {
            self.processed as f64 / self.total_records as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ReencryptJob {
        ReencryptJob {
            id: 1,
            model_path: "person".into(),
            column_name: "email".into(),
            pk_name: "id".into(),
            last_pk: None,
            target_version: "v2".into(),
            status: JobStatus::Pending,
            total_records: 2,
            processed: 0,
            skipped: 0,
            errors: 0,
            last_error: None,
            dry_run: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_machine() {
        let mut job = job();
        assert!(job.transition(JobStatus::Finished).is_err());
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Finished).unwrap();

        assert!(job.status.is_terminal());
        assert!(matches!(
            job.transition(JobStatus::Running),
            Err(JobError::InvalidTransition { from: JobStatus::Finished, .. })
        ));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("PAUSED".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("done".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::Running.to_string(), "running");
    }

    #[test]
    fn test_counters() {
        let mut job = job();
        job.advance("1");
        job.skipped += 1;
        job.advance("2");
        job.advance("3");
        job.record_error("bad row");

        assert_eq!(job.processed, 3);
        assert_eq!(job.total_records, 3);
        assert_eq!(job.last_pk.as_deref(), Some("3"));
        assert_eq!(job.migrated(), 1);
        assert_eq!(job.last_error.as_deref(), Some("bad row"));
        assert_eq!(job.progress_percent(), 100.0);
    }
}
