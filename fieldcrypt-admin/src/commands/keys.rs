use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use clap::Args;
use fieldcrypt_core::{decode_salt, version_number, write_initial};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::context::{confirm, AdminContext};

#[derive(Args)]
pub struct GenerateArgs {
    /// Name of the first key version
    #[arg(long, default_value = "v1")]
    pub version: String,

    /// Key material size in bytes
    #[arg(long, default_value_t = 32)]
    pub key_bytes: usize,

    /// Salt size in bytes
    #[arg(long, default_value_t = 16)]
    pub salt_bytes: usize,

    /// Overwrite an existing key file without asking
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct RotateArgs {
    /// New version name (default: v<highest + 1>)
    #[arg(long)]
    pub new_version: Option<String>,

    /// Key material (default: random)
    #[arg(long)]
    pub key: Option<String>,

    /// Salt as hex, base64url or text (default: salt of the oldest version)
    #[arg(long)]
    pub salt: Option<String>,

    /// Random key size in bytes when --key is not given
    #[arg(long, default_value_t = 32)]
    pub key_bytes: usize,

    /// Only rotate in memory; the key file is left untouched
    #[arg(long)]
    pub no_persist: bool,

    /// Show what would happen without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

fn random_bytes(len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        return Err(anyhow!("Size must be at least 1 byte"));
    }
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    Ok(bytes)
}

/// `v<n+1>` for the highest numbered version
pub fn next_version(existing: &[String]) -> String {
    let max = existing.iter().map(|v| version_number(v)).max().unwrap_or(0);
    format!("v{}", max + 1)
}

pub fn execute_generate(ctx: &AdminContext, args: GenerateArgs) -> Result<()> {
    let path = &ctx.env_file;

    if path.exists() && !args.yes && !confirm(&format!("File '{}' exists. Overwrite?", path.display()))? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let key = URL_SAFE.encode(random_bytes(args.key_bytes)?);
    let salt = random_bytes(args.salt_bytes)?;
    let layout = ctx.manager_config().layout;

    write_initial(path, &layout, &args.version, &key, &salt, true)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    ctx.audit.record(
        "key_file_generated",
        &serde_json::json!({ "path": path, "version": args.version }),
    );

    println!("✓ Key configuration written to {}", path.display());
    println!("  Version: {}", args.version);
    println!("  Permissions: owner read/write only");
    println!();
    println!("Next steps:");
    println!("  1. Keep this file out of version control");
    println!("  2. Back it up: fieldcrypt-admin backup-config");
    println!("  3. In production, move the keys to a secret store");
    Ok(())
}

pub fn execute_rotate(ctx: &AdminContext, args: RotateArgs) -> Result<()> {
    let manager = ctx.load_manager()?;
    let new_version = args
        .new_version
        .clone()
        .unwrap_or_else(|| next_version(&manager.get_all_versions()));
    let persist = !args.no_persist;

    println!("New version: {}", new_version);
    println!("Persist:     {}", if persist { "yes" } else { "no" });
    println!("Dry run:     {}", if args.dry_run { "yes" } else { "no" });

    if args.dry_run {
        println!("\n[DRY RUN] Nothing was changed");
        return Ok(());
    }

    if !args.yes && !confirm(&format!("Create version '{}' and make it active?", new_version))? {
        println!("Operation cancelled.");
        return Ok(());
    }

    let key = match args.key {
        Some(key) => key,
        None => URL_SAFE.encode(random_bytes(args.key_bytes)?),
    };
    let salt = args.salt.as_deref().map(decode_salt);
    let persist_to = persist.then_some(ctx.env_file.as_path());

    manager
        .rotate_to_new_version(&new_version, &key, salt.as_deref(), persist_to)
        .context("Rotation failed")?;

    println!("\n✓ Version '{}' created and active", new_version);
    if persist {
        println!("✓ Updated {}", ctx.env_file.display());
    }
    println!();
    println!("Existing data is still encrypted with older versions.");
    println!("Run `fieldcrypt-admin reencrypt --model <model> --column <column>` to migrate it.");
    Ok(())
}

pub fn execute_list(ctx: &AdminContext) -> Result<()> {
    let manager = ctx.load_manager()?;
    let versions = manager.get_all_versions();
    let active = manager.get_active_version().ok();

    println!("Active version: {}", active.as_deref().unwrap_or("(none)"));
    println!("\nAvailable versions ({}):", versions.len());
    if versions.is_empty() {
        println!("  (no versions found)");
    }
    for version in &versions {
        let marker = if Some(version) == active.as_ref() { " [ACTIVE]" } else { "" };
        println!("  - {}{}", version, marker);
    }

    println!("\nConfiguration loaded from:");
    if ctx.env_file.exists() {
        println!("  - {}", ctx.env_file.display());
    }
    println!("  - environment variables");

    let stats = manager.statistics();
    tracing::debug!(
        cache_hits = stats.cache_hits,
        cache_misses = stats.cache_misses,
        "Manager statistics"
    );
    Ok(())
}
