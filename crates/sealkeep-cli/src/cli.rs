//! CLI argument definitions for sealkeep.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// sealkeep -- secrets vault with approval-gated access.
#[derive(Parser)]
#[command(
    name = "sealkeep",
    version,
    about = "sealkeep -- secrets vault with approval-gated access",
    long_about = "Stores credentials sealed at rest, releases them under time-boxed access \
                  grants, and keeps an append-only history of every change."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "config/sealkeep.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open the vault and run the background sweeps until interrupted.
    Run,

    /// Show database, encryption backend and record counts.
    Status,

    /// Run every sweep once and print the report.
    Sweep,

    /// Inspect the role policy.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
pub enum PolicyAction {
    /// Check whether a role may perform an action on a resource.
    Check {
        role: String,
        resource: String,
        action: String,
    },

    /// List stored rules, optionally for one role.
    List {
        #[arg(long, short)]
        role: Option<String>,
    },

    /// Show the effective permissions, menus and inherited roles of a role.
    Permissions { role: String },
}
