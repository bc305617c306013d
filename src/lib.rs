//! rlsguard: security governance for row-level-security multi-tenant Postgres.
//!
//! Five components guard tenant isolation from migration text to live state:
//!
//! - `lint`: static rules over migration scripts, before they are applied
//! - `invariants`: a fixed battery of assertions against the live catalog
//! - `drift`: normalized hashes of policies and privileged functions, diffed
//!   against a committed baseline
//! - `registry`: reconciliation of live security-definer functions against a
//!   human-maintained registry
//! - `attack`: scripted cross-tenant attacks run as an impersonated tenant
//!   inside always-rolled-back transactions
//!
//! Every component produces a [`core::finding::Report`]. Exit status is 0 when
//! the report carries no error findings, 1 otherwise or on a tool failure
//! (unreachable database, unreadable document, bad configuration).
//!
//! # Examples
//!
//! ```bash
//! rlsguard lint --staged
//! rlsguard invariants --format json
//! rlsguard drift --snapshot
//! rlsguard registry --discover
//! rlsguard attack
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: configuration, errors, findings, SQL scanner, catalog loader
//! - [`plugins`]: the five components

pub mod core;
pub mod plugins;

use core::{
    catalog,
    config::GuardConfig,
    db,
    error::GuardError,
    finding::Report,
    output::{self, OutputFormat},
};
use plugins::{attack, drift, invariants, lint, registry};

use clap::{Parser, Subcommand};
use sqlx::PgPool;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "rlsguard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Tenant-isolation governance for row-level-security Postgres"
)]
struct Cli {
    /// Configuration file (defaults to ./rlsguard.toml when present).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lint migration scripts for RLS and privilege anti-patterns
    Lint {
        /// Only lint migration files staged for commit
        #[clap(long, conflicts_with = "files")]
        staged: bool,
        /// Specific scripts to lint (defaults to the whole migrations directory)
        files: Vec<PathBuf>,
    },
    /// Assert security invariants against the live database
    Invariants,
    /// Compare live policies and privileged functions against the baseline
    Drift {
        /// Write a new baseline instead of comparing
        #[clap(long)]
        snapshot: bool,
    },
    /// Reconcile live security-definer functions with the registry
    Registry {
        /// Print registry scaffolds for unregistered functions; never fails
        #[clap(long)]
        discover: bool,
    },
    /// Run destructive cross-tenant attack scenarios (always rolled back)
    Attack,
}

/// Connect, run `body` against the pool, then close the pool.
fn with_pool<T, F, Fut>(config: &GuardConfig, body: F) -> Result<T, GuardError>
where
    F: FnOnce(PgPool) -> Fut,
    Fut: std::future::Future<Output = Result<T, GuardError>>,
{
    let runtime = db::runtime()?;
    runtime.block_on(async {
        let pool = db::connect(&config.database).await?;
        let result = body(pool.clone()).await;
        pool.close().await;
        result
    })
}

fn run_drift(config: &GuardConfig, snapshot: bool) -> Result<Report, GuardError> {
    let path = config.paths.snapshot.clone();
    if snapshot {
        let state = with_pool(config, |pool| async move {
            catalog::load(&pool, &config.schema.schemas).await
        })?;
        return drift::write_baseline(&path, &drift::Snapshot::from_catalog(&state));
    }
    // a missing or unreadable baseline fails before any connection is made
    let baseline = drift::read_baseline(&path)?;
    let state = with_pool(config, |pool| async move {
        catalog::load(&pool, &config.schema.schemas).await
    })?;
    Ok(drift::compare(&baseline, &state))
}

fn run_registry(config: &GuardConfig, discover: bool) -> Result<Report, GuardError> {
    let entries = registry::read_registry(&config.paths.registry, discover)?;
    let state = with_pool(config, |pool| async move {
        catalog::load(&pool, &config.schema.schemas).await
    })?;
    Ok(registry::reconcile(&state, &entries, config, discover))
}

pub fn run() -> Result<(), GuardError> {
    let cli = Cli::parse();
    let root = std::env::current_dir()?;
    let config = GuardConfig::load(&root, cli.config.as_deref())?;
    let config = &config;

    let report = match cli.command {
        Command::Lint { staged, files } => {
            let selection = if staged {
                lint::InputSelection::Staged
            } else if files.is_empty() {
                lint::InputSelection::Corpus
            } else {
                lint::InputSelection::Files(files)
            };
            lint::run_lint(config, &selection, &root)?
        }
        Command::Invariants => with_pool(config, |pool| async move {
            invariants::run_invariants(&pool, config).await
        })?,
        Command::Drift { snapshot } => run_drift(config, snapshot)?,
        Command::Registry { discover } => run_registry(config, discover)?,
        Command::Attack => with_pool(config, |pool| async move {
            attack::run_attacks(&pool, config).await
        })?,
    };

    output::print_report(&report, cli.format)?;
    report.verdict()
}
