use anyhow::Result;
use clap::Args;
use fieldcrypt_core::{
    CleanupFailure, CleanupOperation, CleanupOutcome, CleanupRequest, KeyCleanupOrchestrator,
    SqliteColumnSource, DEFAULT_ANALYSIS_BATCH_SIZE, DEFAULT_KEEP_COUNT,
};

use crate::context::{confirm, AdminContext};

/// Versions that must survive a manual removal
const MANUAL_MIN_REMAINING: usize = 1;

#[derive(Args)]
pub struct CleanupKeysArgs {
    /// Registered model name
    #[arg(long)]
    pub model: String,

    /// Encrypted column to analyze
    #[arg(long)]
    pub column: String,

    /// Most recent versions always kept
    #[arg(long, default_value_t = DEFAULT_KEEP_COUNT)]
    pub keep_versions: usize,

    /// Rows per analysis batch
    #[arg(long, default_value_t = DEFAULT_ANALYSIS_BATCH_SIZE)]
    pub batch_size: usize,

    /// Show the lines that would be removed without touching the key file
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct RemoveVersionsArgs {
    /// Versions to remove, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub versions: Vec<String>,

    /// Show the lines that would be removed without touching the key file
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

fn print_plan(operation: &CleanupOperation) {
    println!("\nOperation: {}", operation.operation_id);
    if let Some(column) = &operation.column {
        println!("Column:    {}", column);
    }
    println!("Active:    {}", operation.active_version.as_deref().unwrap_or("(unknown)"));

    if !operation.usage.is_empty() {
        println!("\n{:<10} {:>10} {:>9}  {}", "VERSION", "RECORDS", "SHARE", "STATE");
        println!("{}", "-".repeat(45));
        for stats in &operation.usage {
            let state = match (stats.is_active, stats.in_use) {
                (true, _) => "active",
                (false, true) => "in use",
                (false, false) => "unused",
            };
            println!(
                "{:<10} {:>10} {:>8.1}%  {}",
                stats.version, stats.record_count, stats.percentage, state
            );
        }
    }

    println!("\nKeep:   {}", operation.versions_to_keep.join(", "));
    println!("Remove: {}", if operation.versions_to_remove.is_empty() {
        "(none)".to_string()
    } else {
        operation.versions_to_remove.join(", ")
    });
}

fn print_lines_to_remove(operation: &CleanupOperation) {
    println!("\n[DRY RUN] Lines that would be removed ({}):", operation.lines_to_remove.len());
    for line in &operation.lines_to_remove {
        println!("  - {}", line);
    }
}

/// Prompt once, after showing the plan
fn confirm_removal(operation: &CleanupOperation, shown: &mut bool) -> bool {
    print_plan(operation);
    *shown = true;
    let prompt = format!("\nRemove {} key versions from the key file?", operation.versions_to_remove.len());
    match confirm(&prompt) {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read confirmation; treating as declined");
            false
        }
    }
}

fn report(ctx: &AdminContext, result: Result<CleanupOperation, CleanupFailure>, shown: bool) -> Result<()> {
    let operation = match result {
        Ok(operation) => operation,
        Err(failure) => {
            if !shown {
                print_plan(&failure.operation);
            }
            if failure.operation.rolled_back {
                println!("\n✗ Cleanup failed; key file restored from backup");
            }
            if let Some(backup) = &failure.operation.backup_path {
                println!("  Backup: {}", backup.display());
            }
            return Err(failure.into());
        }
    };

    if !shown {
        print_plan(&operation);
    }

    match operation.outcome {
        CleanupOutcome::NothingToRemove => println!("\n✓ No key versions can be removed"),
        CleanupOutcome::DryRun => print_lines_to_remove(&operation),
        CleanupOutcome::Cancelled => println!("\nOperation cancelled."),
        CleanupOutcome::Success => {
            println!("\n✓ Removed {}", operation.versions_to_remove.join(", "));
            if let Some(backup) = &operation.backup_path {
                println!("  Backup: {}", backup.display());
            }
            println!("  Remaining versions: {}", operation.versions_to_keep.join(", "));
            println!("  Key file: {}", ctx.env_file.display());
        }
        other => println!("\nCleanup ended: {}", other),
    }
    Ok(())
}

pub fn execute_cleanup_keys(ctx: &AdminContext, args: CleanupKeysArgs) -> Result<()> {
    let conn = ctx.open_database()?;
    let registry = ctx.config.registry()?;
    let source = SqliteColumnSource::open(&conn, &registry, &args.model, &args.column)?;
    let codec = ctx.codec()?;

    let request = CleanupRequest {
        config_path: ctx.env_file.clone(),
        keep_count: args.keep_versions,
        dry_run: args.dry_run,
        assume_yes: args.yes,
        batch_size: args.batch_size,
    };

    println!("Analyzing key usage in {}.{}...", args.model, args.column);
    let orchestrator = KeyCleanupOrchestrator::new(&codec).with_audit_logger(ctx.audit.clone());
    let mut shown = false;
    let result = orchestrator.run(&request, &source, &mut |operation: &CleanupOperation| {
        confirm_removal(operation, &mut shown)
    });
    report(ctx, result, shown)
}

pub fn execute_remove_versions(ctx: &AdminContext, args: RemoveVersionsArgs) -> Result<()> {
    let versions: Vec<String> = args
        .versions
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    println!("⚠️  Manual removal skips usage analysis: data encrypted with a removed version becomes unreadable.");
    println!("Key file: {}", ctx.env_file.display());
    println!("Versions to remove: {}", versions.join(", "));

    let codec = ctx.codec()?;
    let request = CleanupRequest {
        config_path: ctx.env_file.clone(),
        keep_count: MANUAL_MIN_REMAINING,
        dry_run: args.dry_run,
        assume_yes: args.yes,
        ..Default::default()
    };

    let orchestrator = KeyCleanupOrchestrator::new(&codec).with_audit_logger(ctx.audit.clone());
    let mut shown = false;
    let result = orchestrator.remove_versions(&request, &versions, &mut |operation: &CleanupOperation| {
        confirm_removal(operation, &mut shown)
    });
    report(ctx, result, shown)
}
