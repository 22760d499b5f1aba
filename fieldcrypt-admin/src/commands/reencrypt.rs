use anyhow::{Context, Result};
use clap::Args;
use fieldcrypt_core::{
    JobSelector, JobStatus, JobStore, ReencryptJob, ReencryptOptions, ReencryptionRunner,
    SqliteColumnSource, DEFAULT_CLEANUP_DAYS, DEFAULT_LIST_LIMIT,
};
use indicatif::{ProgressBar, ProgressStyle};

use crate::context::{confirm, AdminContext};

#[derive(Args)]
pub struct ReencryptArgs {
    /// Registered model name
    #[arg(long)]
    pub model: String,

    /// Encrypted column of the model
    #[arg(long)]
    pub column: String,

    /// Rows fetched per batch
    #[arg(long, default_value_t = 500)]
    pub batch_size: usize,

    /// Rows between intermediate commits
    #[arg(long, default_value_t = 1000)]
    pub commit_every: usize,

    /// Decrypt and re-encrypt without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Continue the latest unfinished job for this column
    #[arg(long, conflicts_with = "job_id")]
    pub resume: bool,

    /// Continue a specific job
    #[arg(long)]
    pub job_id: Option<i64>,
}

#[derive(Args)]
pub struct ListJobsArgs {
    /// Filter by status (pending, running, finished, failed, paused)
    #[arg(long)]
    pub status: Option<JobStatus>,

    /// Maximum number of jobs to show
    #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
    pub limit: usize,
}

#[derive(Args)]
pub struct CleanupJobsArgs {
    /// Remove finished and failed jobs older than this many days
    #[arg(long, default_value_t = DEFAULT_CLEANUP_DAYS)]
    pub finished_older_than: i64,

    /// Remove pending and running jobs not updated for this many days
    #[arg(long, default_value_t = DEFAULT_CLEANUP_DAYS)]
    pub stalled_older_than: i64,

    /// Only count what would be removed
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

fn progress_bar(job: &ReencryptJob) -> ProgressBar {
    let bar = ProgressBar::new(job.total_records);
    let style = ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} rows ({percent}%) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    bar.set_style(style);
    bar.set_position(job.processed);
    bar
}

pub fn execute_reencrypt(ctx: &AdminContext, args: ReencryptArgs) -> Result<()> {
    let conn = ctx.open_database()?;
    let registry = ctx.config.registry()?;
    let source = SqliteColumnSource::open(&conn, &registry, &args.model, &args.column)
        .with_context(|| format!("Cannot re-encrypt {}.{}", args.model, args.column))?;
    let jobs = JobStore::open(&conn)?;
    let codec = ctx.codec()?;

    let options = ReencryptOptions {
        batch_size: args.batch_size,
        commit_every: args.commit_every,
        dry_run: args.dry_run,
    };
    options.validate()?;

    let selector = match (args.job_id, args.resume) {
        (Some(id), _) => JobSelector::ById(id),
        (None, true) => JobSelector::Resume,
        (None, false) => JobSelector::New,
    };

    let runner = ReencryptionRunner::new(&codec, &source, &jobs, options);
    let mut job = runner.select_job(selector)?;

    println!("Job #{}: {}.{} -> {}", job.id, job.model_path, job.column_name, job.target_version);
    if job.dry_run {
        println!("[DRY RUN] No rows will be written");
    }
    if let Some(last_pk) = &job.last_pk {
        println!("Resuming after {} = {}", job.pk_name, last_pk);
    }

    let bar = progress_bar(&job);
    let observer = bar.clone();
    let mut runner = runner.with_observer(move |job: &ReencryptJob| {
        observer.set_length(job.total_records);
        observer.set_position(job.processed);
        observer.set_message(format!("{} errors", job.errors));
    });

    let summary = match runner.run_job(&mut job) {
        Ok(summary) => {
            bar.finish_and_clear();
            summary
        }
        Err(e) => {
            bar.abandon();
            return Err(e).with_context(|| format!("Job #{} stopped", job.id));
        }
    };

    println!("✓ Job #{} {}", summary.job_id, summary.status);
    println!("  Processed: {}/{}", summary.processed, summary.total_records);
    println!("  Migrated:  {}", summary.migrated);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Errors:    {}", summary.errors);
    if let Some(last_error) = &summary.last_error {
        println!("  Last error: {}", last_error);
    }
    println!("  Duration:  {:.2}s", summary.duration_ms as f64 / 1000.0);
    Ok(())
}

pub fn execute_list_jobs(ctx: &AdminContext, args: ListJobsArgs) -> Result<()> {
    let conn = ctx.open_database()?;
    let jobs = JobStore::open(&conn)?;
    let list = jobs.list(args.status, args.limit)?;

    if list.is_empty() {
        println!("No re-encryption jobs found.");
        return Ok(());
    }

    println!(
        "\n{:<6} {:<28} {:<8} {:<10} {:<18} {:<8} {:<20}",
        "ID", "TARGET", "VERSION", "STATUS", "PROGRESS", "ERRORS", "UPDATED"
    );
    println!("{}", "-".repeat(102));
    for job in list {
        let target = format!("{}.{}", job.model_path, job.column_name);
        let progress = format!("{}/{} ({:.0}%)", job.processed, job.total_records, job.progress_percent());
        let status = if job.dry_run {
            format!("{}*", job.status)
        } else {
            job.status.to_string()
        };
        println!(
            "{:<6} {:<28} {:<8} {:<10} {:<18} {:<8} {:<20}",
            job.id,
            target,
            job.target_version,
            status,
            progress,
            job.errors,
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n* dry run");
    Ok(())
}

pub fn execute_cleanup_jobs(ctx: &AdminContext, args: CleanupJobsArgs) -> Result<()> {
    let conn = ctx.open_database()?;
    let jobs = JobStore::open(&conn)?;

    let preview = jobs.cleanup(args.finished_older_than, args.stalled_older_than, true)?;
    println!("Finished/failed jobs older than {} days: {}", args.finished_older_than, preview.finished_removed);
    println!("Stalled jobs older than {} days: {}", args.stalled_older_than, preview.stalled_removed);

    if preview.total() == 0 {
        println!("Nothing to remove.");
        return Ok(());
    }
    if args.dry_run {
        println!("\n[DRY RUN] {} jobs would be removed", preview.total());
        return Ok(());
    }
    if !args.yes && !confirm(&format!("Remove {} jobs?", preview.total()))? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let report = jobs.cleanup(args.finished_older_than, args.stalled_older_than, false)?;
    ctx.audit.record("job_cleanup", &report);
    println!("✓ Removed {} jobs", report.total());
    Ok(())
}
