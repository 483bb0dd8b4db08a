//! CLI entry point for sealkeep.
//!
//! This binary provides the `sealkeep` command with subcommands for running
//! the vault's background sweeps, checking status and inspecting policy.

mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use sealkeep_core::{Sealkeep, SealkeepConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, PolicyAction};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Status => cmd_status(config).await,
        Commands::Sweep => cmd_sweep(config).await,
        Commands::Policy { action } => cmd_policy(config, action).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: SealkeepConfig) -> Result<()> {
    info!("starting sealkeep");
    let vault = open_vault(config).await?;

    let handle = vault.sweeper().spawn(CancellationToken::new());
    info!("background sweeps running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    handle.shutdown().await;
    info!("sealkeep stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: SealkeepConfig) -> Result<()> {
    let db_path = config.database.path.clone();
    let vault = open_vault(config).await?;

    let schema = vault
        .db
        .schema_version()
        .await
        .context("failed to read schema version")?;
    let (live, deleted, pending, approved) = vault
        .db
        .execute(|conn| {
            let live: i64 = conn.query_row(
                "SELECT COUNT(*) FROM secrets WHERE deleted_at IS NULL",
                [],
                |row| row.get(0),
            )?;
            let deleted: i64 = conn.query_row(
                "SELECT COUNT(*) FROM secrets WHERE deleted_at IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM access_grants WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            let approved: i64 = conn.query_row(
                "SELECT COUNT(*) FROM access_grants WHERE status = 'approved'",
                [],
                |row| row.get(0),
            )?;
            Ok((live, deleted, pending, approved))
        })
        .await
        .context("failed to count records")?;
    let backend = vault.sealer.active_backend().await;

    println!();
    println!("  sealkeep v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Database:        {} (schema v{schema})", db_path.display());
    println!("  Encryption:      {backend}");
    println!("  Super role:      {}", vault.policy.super_role());
    println!("  Roles:           {}", vault.policy.known_roles().join(", "));
    println!("  Secrets:         {live} live, {deleted} deleted");
    println!("  Access grants:   {pending} pending, {approved} approved");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: sweep
// ---------------------------------------------------------------------------

async fn cmd_sweep(config: SealkeepConfig) -> Result<()> {
    let vault = open_vault(config).await?;
    let report = vault
        .sweeper()
        .run_once()
        .await
        .context("sweep failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: policy
// ---------------------------------------------------------------------------

async fn cmd_policy(config: SealkeepConfig, action: PolicyAction) -> Result<()> {
    let vault = open_vault(config).await?;
    let policy = &vault.policy;

    match action {
        PolicyAction::Check {
            role,
            resource,
            action,
        } => {
            let allowed = policy.check(&role, &resource, &action);
            println!(
                "{role} {} {action} {resource}",
                if allowed { "may" } else { "may not" }
            );
        }
        PolicyAction::List { role } => {
            for rule in policy.list_rules(role.as_deref()) {
                println!("{:<16} {:<16} {}", rule.role, rule.resource, rule.action);
            }
            if role.is_none() {
                for edge in policy.list_edges() {
                    println!("{:<16} inherits {}", edge.subject, edge.role);
                }
            }
        }
        PolicyAction::Permissions { role } => {
            let summary = serde_json::json!({
                "role": role,
                "inherits": policy.implicit_roles_of(&role),
                "permissions": policy.permissions_of(&role),
                "matrix": policy.permission_matrix(&role),
                "menus": policy.menus_for(&role),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<SealkeepConfig> {
    SealkeepConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

async fn open_vault(config: SealkeepConfig) -> Result<Sealkeep> {
    let path = config.database.path.clone();
    Sealkeep::open(config)
        .await
        .with_context(|| format!("failed to open vault at {}", path.display()))
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
