use anyhow::Result;
use clap::{Parser, Subcommand};
use fieldcrypt_core::init_logging;
use std::path::PathBuf;
use tracing::{debug, error};

mod commands;
mod config;
mod context;

use commands::*;
use config::AdminConfig;
use context::AdminContext;

#[derive(Parser)]
#[command(name = "fieldcrypt-admin")]
#[command(about = "Fieldcrypt key management CLI")]
#[command(version)]
struct Cli {
    /// Admin configuration file
    #[arg(short, long, global = true, default_value = "fieldcrypt.toml")]
    config: PathBuf,

    /// Key file (overrides `env_file` from the admin configuration)
    #[arg(long, global = true, env = "FIELDCRYPT_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// SQLite database holding the encrypted data and the job table
    #[arg(long, global = true, env = "FIELDCRYPT_DATABASE")]
    database: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the first key version and write the key file
    Generate(GenerateArgs),
    /// Add a new key version and make it active
    Rotate(RotateArgs),
    /// Show configured key versions
    List,
    /// Re-encrypt a column under the active version
    Reencrypt(ReencryptArgs),
    /// Show re-encryption jobs
    ListJobs(ListJobsArgs),
    /// Delete old finished and stalled re-encryption jobs
    CleanupJobs(CleanupJobsArgs),
    /// Remove key versions no stored value depends on
    CleanupKeys(CleanupKeysArgs),
    /// Remove explicit key versions without usage analysis (expert use)
    RemoveVersions(RemoveVersionsArgs),
    /// Back up the key file
    BackupConfig(BackupConfigArgs),
    /// Restore the key file from a backup
    RestoreConfig(RestoreConfigArgs),
    /// Check the key file structure and key material
    ValidateConfig,
}

fn run(cli: Cli) -> Result<()> {
    let config = AdminConfig::load(&cli.config)?;

    let mut logging = config.logging_config();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    logging.json_format |= cli.json_logs;
    if cli.log_file.is_some() {
        logging.log_file = cli.log_file.clone();
    }
    init_logging(&logging)?;
    debug!(config = %cli.config.display(), "Fieldcrypt admin starting");

    let ctx = AdminContext::new(config, cli.env_file, cli.database);

    match cli.command {
        Commands::Generate(args) => execute_generate(&ctx, args),
        Commands::Rotate(args) => execute_rotate(&ctx, args),
        Commands::List => execute_list(&ctx),
        Commands::Reencrypt(args) => execute_reencrypt(&ctx, args),
        Commands::ListJobs(args) => execute_list_jobs(&ctx, args),
        Commands::CleanupJobs(args) => execute_cleanup_jobs(&ctx, args),
        Commands::CleanupKeys(args) => execute_cleanup_keys(&ctx, args),
        Commands::RemoveVersions(args) => execute_remove_versions(&ctx, args),
        Commands::BackupConfig(args) => execute_backup_config(&ctx, args),
        Commands::RestoreConfig(args) => execute_restore_config(&ctx, args),
        Commands::ValidateConfig => execute_validate_config(&ctx),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("Command failed: {:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from([
            "fieldcrypt-admin",
            "--database",
            "app.db",
            "reencrypt",
            "--model",
            "person",
            "--column",
            "email",
            "--resume",
        ])
        .unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("app.db")));
        match cli.command {
            Commands::Reencrypt(args) => {
                assert!(args.resume);
                assert_eq!(args.batch_size, 500);
                assert_eq!(args.commit_every, 1000);
            }
            _ => panic!("expected reencrypt"),
        }

        let cli = Cli::try_parse_from(["fieldcrypt-admin", "remove-versions", "--versions", "v1,v2", "--yes"]).unwrap();
        match cli.command {
            Commands::RemoveVersions(args) => assert_eq!(args.versions, vec!["v1", "v2"]),
            _ => panic!("expected remove-versions"),
        }

        let cli = Cli::try_parse_from(["fieldcrypt-admin", "list-jobs", "--status", "paused"]).unwrap();
        match cli.command {
            Commands::ListJobs(args) => assert_eq!(args.status, Some(fieldcrypt_core::JobStatus::Paused)),
            _ => panic!("expected list-jobs"),
        }

        assert!(Cli::try_parse_from(["fieldcrypt-admin", "reencrypt", "--model", "m", "--column", "c", "--resume", "--job-id", "3"]).is_err());
    }
}
