//! The command-line surface (SPEC_FULL.md §6): a thin adapter over
//! [`crate::engine::Engine`]. Out of the core transaction engine's
//! scope per spec, but every teacher-style binary needs one, so this
//! crate carries it as the ambient stack.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::config::InstallerConfig;
use crate::engine::Engine;
use crate::errors::InstallerError;
use crate::manifest::Manifest;

#[derive(Parser, Debug)]
#[command(name = "installer", version, about = "Atomic, rollback-capable package installer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit debug-level logs.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress all but warnings and errors.
    #[arg(long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate and execute a manifest as a single transaction.
    Install {
        manifest_file: PathBuf,
        /// Validate only; do not mutate the host.
        #[arg(long)]
        dry_run: bool,
        /// Bypass precondition failures (not schema failures).
        #[arg(long)]
        force: bool,
    },
    /// Reverse a non-completed transaction.
    Rollback { transaction_id: i64 },
    /// List recent transactions.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Purge terminal transactions older than a retention window.
    Cleanup {
        #[arg(long = "older-than", default_value_t = 30)]
        older_than: i64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Emit a minimal valid manifest.
    CreateTemplate {
        name: String,
        version: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a manifest file and print a step summary.
    Validate { manifest_file: PathBuf },
    /// Report journal connectivity, required directories, and privilege status.
    Status,
}

/// Exit codes per SPEC_FULL.md §6.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_OPERATIONAL_FAILURE: i32 = 1;
pub const EXIT_PRECONDITION_FAILURE: i32 = 2;

pub async fn run(cli: Cli, config: InstallerConfig) -> i32 {
    let result = match cli.command {
        Command::Install { manifest_file, dry_run, force } => {
            install(&config, &manifest_file, dry_run, force).await
        }
        Command::Rollback { transaction_id } => rollback(&config, transaction_id).await,
        Command::List { limit } => list(&config, limit).await,
        Command::Cleanup { older_than, dry_run } => cleanup(&config, older_than, dry_run).await,
        Command::CreateTemplate { name, version, output } => create_template(&name, &version, output.as_deref()),
        Command::Validate { manifest_file } => validate(&manifest_file),
        Command::Status => status(&config).await,
    };

    match result {
        Ok(()) => {
            println!("{}", "ok".green());
            EXIT_SUCCESS
        }
        Err(CliError::Precondition(msg)) => {
            eprintln!("{} {msg}", "precondition failed:".red().bold());
            EXIT_PRECONDITION_FAILURE
        }
        Err(CliError::Operational(err)) => {
            eprintln!("{} {err}", "failed:".red().bold());
            EXIT_OPERATIONAL_FAILURE
        }
    }
}

enum CliError {
    Precondition(String),
    Operational(InstallerError),
}

impl From<InstallerError> for CliError {
    fn from(err: InstallerError) -> Self {
        CliError::Operational(err)
    }
}

async fn install(config: &InstallerConfig, manifest_file: &std::path::Path, dry_run: bool, force: bool) -> Result<(), CliError> {
    let content = std::fs::read_to_string(manifest_file)
        .map_err(|e| CliError::Operational(InstallerError::IoError(e)))?;
    let manifest = Manifest::parse(&content)?;

    if !force && !privilege_ok() {
        return Err(CliError::Precondition(
            "mutating commands require elevated privilege".to_string(),
        ));
    }

    if dry_run {
        tracing::info!(package = %manifest.package.name, "dry run: manifest is valid");
        return Ok(());
    }

    let engine = Engine::connect(config.clone()).await?;
    let tx = engine.begin_transaction(&manifest.package.name, &manifest).await?;
    let mut steps = manifest.pre_install.clone();
    steps.extend(manifest.install_steps.clone());
    steps.extend(manifest.post_install.clone());
    tx.execute_steps(&steps, None).await?;
    tx.commit().await?;
    Ok(())
}

async fn rollback(config: &InstallerConfig, transaction_id: i64) -> Result<(), CliError> {
    let engine = Engine::connect(config.clone()).await?;
    let report = engine.rollback_transaction_by_id(transaction_id).await?;
    for step in &report.steps {
        println!("  step {} -> {:?}", step.step_order, step.outcome);
    }
    if report.final_status == crate::journal::TransactionStatus::RollbackFailed {
        return Err(CliError::Operational(InstallerError::TransactionError(
            "one or more steps were unrecoverable".to_string(),
        )));
    }
    Ok(())
}

async fn list(config: &InstallerConfig, limit: u64) -> Result<(), CliError> {
    let engine = Engine::connect(config.clone()).await?;
    for tx in engine.list_transactions(limit).await? {
        println!("{}, {}, {}, {}", tx.id, tx.package_name, tx.status, tx.created_at);
    }
    Ok(())
}

async fn cleanup(config: &InstallerConfig, older_than: i64, dry_run: bool) -> Result<(), CliError> {
    if dry_run {
        println!("dry run: would purge terminal transactions older than {older_than} days");
        return Ok(());
    }
    let engine = Engine::connect(config.clone()).await?;
    let purged = engine.cleanup_old_transactions(older_than).await?;
    println!("purged {purged} transaction(s)");
    Ok(())
}

fn create_template(name: &str, version: &str, output: Option<&std::path::Path>) -> Result<(), CliError> {
    let manifest = Manifest::template(name, version);
    let rendered = manifest.to_yaml()?;
    match output {
        Some(path) => std::fs::write(path, rendered).map_err(|e| CliError::Operational(InstallerError::IoError(e)))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn validate(manifest_file: &std::path::Path) -> Result<(), CliError> {
    let content = std::fs::read_to_string(manifest_file)
        .map_err(|e| CliError::Operational(InstallerError::IoError(e)))?;
    let manifest = Manifest::parse(&content)?;
    println!(
        "{} v{}: {} pre-install, {} install, {} post-install step(s)",
        manifest.package.name,
        manifest.package.version,
        manifest.pre_install.len(),
        manifest.install_steps.len(),
        manifest.post_install.len(),
    );
    Ok(())
}

async fn status(config: &InstallerConfig) -> Result<(), CliError> {
    let journal_ok = crate::journal::Journal::connect(&config.connection_string()).await.is_ok();
    println!("journal reachable: {journal_ok}");
    println!("state dir exists: {}", config.state_dir.exists());
    println!("snapshot dir exists: {}", config.snapshot_dir.exists());
    println!("privileged: {}", privilege_ok());
    Ok(())
}

/// Best-effort privilege check; detailed enforcement is out of the
/// transaction engine's scope (SPEC_FULL.md §1), so this is
/// feature-gated to Linux and deliberately simple.
#[cfg(target_os = "linux")]
fn privilege_ok() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("Uid:"))
                .and_then(|line| line.split_whitespace().nth(1).map(str::to_string))
        })
        .is_some_and(|uid| uid == "0")
}

#[cfg(not(target_os = "linux"))]
fn privilege_ok() -> bool {
    true
}
