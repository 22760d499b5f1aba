use anyhow::{anyhow, Context, Result};
use clap::Args;
use fieldcrypt_core::{
    backup_configuration, cleanup_old_backups, list_backups, restore_configuration,
    validate_backup_integrity, validate_config_integrity,
};
use serde_json::json;
use std::path::PathBuf;

use crate::context::{confirm, AdminContext};

#[derive(Args)]
pub struct BackupConfigArgs {
    /// Delete older backups after creating this one
    #[arg(long)]
    pub cleanup_old: bool,

    /// Backups kept by --cleanup-old
    #[arg(long, default_value_t = 5)]
    pub keep_backups: usize,
}

#[derive(Args)]
pub struct RestoreConfigArgs {
    /// Backup file to restore
    #[arg(long)]
    pub backup: PathBuf,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

pub fn execute_backup_config(ctx: &AdminContext, args: BackupConfigArgs) -> Result<()> {
    println!("Creating backup of {}", ctx.env_file.display());

    let backup = backup_configuration(&ctx.env_file)?;
    println!("✓ Backup created: {}", backup.path.display());
    println!("  Size: {} bytes", backup.size_bytes);
    println!("  Timestamp: {}", backup.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

    match validate_backup_integrity(&backup.path) {
        Ok(()) => println!("✓ Backup integrity verified"),
        Err(e) => println!("⚠️  Backup integrity check failed: {}", e),
    }

    if args.cleanup_old {
        let removed = cleanup_old_backups(&ctx.env_file, args.keep_backups)?;
        if removed.is_empty() {
            println!("No old backups to remove");
        } else {
            println!("✓ Removed {} old backups", removed.len());
        }
    }

    let backups = list_backups(&ctx.env_file)?;
    println!("\n{:<50} {:<20} {:>8}", "BACKUP", "CREATED", "SIZE");
    println!("{}", "-".repeat(80));
    for info in backups {
        let name = info
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!(
            "{:<50} {:<20} {:>8}",
            name,
            info.created_at.format("%Y-%m-%d %H:%M:%S"),
            info.size_bytes
        );
    }
    Ok(())
}

pub fn execute_restore_config(ctx: &AdminContext, args: RestoreConfigArgs) -> Result<()> {
    println!("Restoring from: {}", args.backup.display());
    println!("To:             {}", ctx.env_file.display());

    validate_backup_integrity(&args.backup).context("Backup failed the integrity check")?;
    println!("✓ Backup integrity verified");

    if !args.yes && !confirm("⚠️  This overwrites the current key file. Continue?")? {
        println!("Operation cancelled.");
        return Ok(());
    }

    restore_configuration(&args.backup, &ctx.env_file)?;
    ctx.audit.record(
        "config_restore",
        &json!({ "backup": args.backup, "config": ctx.env_file }),
    );
    println!("✓ Key file restored");
    Ok(())
}

pub fn execute_validate_config(ctx: &AdminContext) -> Result<()> {
    println!("Validating {}", ctx.env_file.display());

    let layout = ctx.manager_config().layout;
    let summary = validate_config_integrity(&ctx.env_file, &layout)
        .map_err(|e| anyhow!("Key file is invalid: {}", e))?;

    println!("✓ Key file is valid");
    println!("  Versions: {}", summary.versions.join(", "));
    println!("  Active version: {}", summary.active_version);
    println!("  Total versions: {}", summary.versions.len());

    // Every version must also derive a usable key
    let manager = ctx.load_manager()?;
    manager.validate().context("Key material failed validation")?;
    println!("✓ All key versions load");
    Ok(())
}
