//! Command surface for running migration plans against a SQLite database.
//!
//! Hosts can embed the CLI through [`run_cli`], or drive a single
//! [`Command`] against an open store with [`run_command`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use migration_kernel_core::{
    Dialect, ExecutedMigrationPlan, PlanDocument, TableDefinition, UpgradeStatus,
};
use migration_kernel_store_sqlite::{
    HistoryEntry, SchemaCheck, SchemaIssueSeverity, SqliteMigrationStore, StoreOptions,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mk")]
#[command(about = "Migration Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./migration_kernel.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// Raise log verbosity (-v info, -vv debug). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    Upgrade(PlanFileArgs),
    Status(PlanFileArgs),
    History(HistoryArgs),
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    Validate(PlanFileArgs),
    Script(ScriptArgs),
}

#[derive(Debug, Args)]
pub struct PlanFileArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ScriptArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long, value_enum, default_value_t = DialectArg::Sqlite)]
    dialect: DialectArg,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    plan: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    Get {
        #[arg(long)]
        key: String,
    },
    Set {
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Check(SchemaCheckArgs),
}

#[derive(Debug, Args)]
pub struct SchemaCheckArgs {
    /// JSON array of expected table definitions.
    #[arg(long)]
    expected: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DialectArg {
    Sqlite,
    Sqlserver,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Sqlite => Dialect::Sqlite,
            DialectArg::Sqlserver => Dialect::SqlServer,
        }
    }
}

#[derive(Debug, Serialize)]
struct ContractPayload<'a, T: Serialize> {
    contract_version: &'static str,
    #[serde(flatten)]
    payload: &'a T,
}

#[derive(Debug, Serialize)]
struct PlanValidation<'a> {
    plan: &'a str,
    final_state: &'a str,
    states: &'a [String],
}

/// Installs the stderr log subscriber. Safe to call more than once.
pub fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when a command fails, an upgrade does not complete, or a
/// schema check is unhealthy.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose);

    // Plan-only commands never touch the database.
    let command = match cli.command {
        Command::Plan { command } => return run_plan(command),
        other => other,
    };

    let options = StoreOptions {
        busy_timeout_ms: cli.busy_timeout_ms,
    };
    let mut store = SqliteMigrationStore::open_with(&cli.db, &options)?;
    run_command(command, &mut store)
}

/// Runs one command against an open store.
///
/// # Errors
/// See [`run_cli`].
pub fn run_command(command: Command, store: &mut SqliteMigrationStore) -> Result<()> {
    match command {
        Command::Plan { command } => run_plan(command),
        Command::Upgrade(args) => {
            let plan = read_plan(&args.plan)?.into_plan()?;
            let report = store.upgrade(plan)?;
            if args.json {
                print_contract("executed_plan.v1", &report)?;
            } else {
                print_executed_plan(&report);
            }
            if !report.successful {
                return Err(anyhow!(
                    "upgrade of plan {} stopped at state {:?}: {}",
                    report.plan,
                    report.final_state,
                    report.error.as_deref().unwrap_or("unknown error")
                ));
            }
            Ok(())
        }
        Command::Status(args) => {
            let plan = read_plan(&args.plan)?.into_plan()?;
            let status = store.upgrade_status(plan)?;
            if args.json {
                print_contract("upgrade_status.v1", &status)?;
            } else {
                print_upgrade_status(&status);
            }
            Ok(())
        }
        Command::History(args) => {
            let entries = store.history(args.plan.as_deref(), args.limit)?;
            print_history(&entries)
        }
        Command::State { command } => run_state(command, store),
        Command::Schema { command } => match command {
            SchemaCommand::Check(args) => {
                let expected = read_expected_tables(&args.expected)?;
                let check = store.schema_check(&expected)?;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&check)?);
                } else {
                    print_schema_check(&check);
                }
                if !check.healthy {
                    return Err(anyhow!(
                        "schema check failed with {} error(s)",
                        check
                            .issues
                            .iter()
                            .filter(|issue| issue.severity == SchemaIssueSeverity::Error)
                            .count()
                    ));
                }
                Ok(())
            }
        },
    }
}

fn run_plan(command: PlanCommand) -> Result<()> {
    match command {
        PlanCommand::Validate(args) => {
            let plan = read_plan(&args.plan)?.into_plan()?;
            let final_state = plan.validate()?;
            if args.json {
                let validation = PlanValidation {
                    plan: plan.name(),
                    final_state: &final_state,
                    states: plan.states(),
                };
                print_contract("plan_validation.v1", &validation)?;
            } else {
                println!(
                    "plan {} is valid: {} states, final state {}",
                    plan.name(),
                    plan.states().len(),
                    final_state
                );
            }
            Ok(())
        }
        PlanCommand::Script(args) => {
            let document = read_plan(&args.plan)?;
            let script = document.script(
                args.dialect.into(),
                args.from.as_deref(),
                args.to.as_deref(),
            )?;
            print!("{script}");
            Ok(())
        }
    }
}

fn run_state(command: StateCommand, store: &SqliteMigrationStore) -> Result<()> {
    match command {
        StateCommand::Get { key } => match store.get_value(&key)? {
            Some(value) => {
                println!("{value}");
                Ok(())
            }
            None => Err(anyhow!("no value stored for key {key}")),
        },
        StateCommand::Set { key, value } => {
            store.set_value(&key, &value)?;
            debug!(key = %key, value = %value, "stored key value");
            Ok(())
        }
        StateCommand::List => {
            let entries = store.key_values()?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
    }
}

fn read_plan(path: &Path) -> Result<PlanDocument> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    let document = PlanDocument::from_json(&raw)
        .with_context(|| format!("failed to load plan file {}", path.display()))?;
    Ok(document)
}

fn read_expected_tables(path: &Path) -> Result<Vec<TableDefinition>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read expected schema {}", path.display()))?;
    let tables: Vec<TableDefinition> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid expected schema {}", path.display()))?;
    for table in &tables {
        table
            .validate()
            .with_context(|| format!("invalid expected table {}", table.name))?;
    }
    Ok(tables)
}

fn print_contract<T: Serialize>(contract_version: &'static str, payload: &T) -> Result<()> {
    let wrapped = ContractPayload {
        contract_version,
        payload,
    };
    println!("{}", serde_json::to_string_pretty(&wrapped)?);
    Ok(())
}

fn print_executed_plan(report: &ExecutedMigrationPlan) {
    println!(
        "plan {}: {} -> {} ({} transition(s))",
        report.plan,
        display_state(&report.initial_state),
        display_state(&report.final_state),
        report.completed_transitions.len()
    );
    for transition in &report.completed_transitions {
        println!(
            "  {} -> {}  {}  statements={} skipped={}",
            display_state(&transition.source),
            transition.target,
            transition.migration,
            transition.statements.len(),
            transition.skipped.len()
        );
    }
    if !report.post_migrations.is_empty() {
        println!("post-migrations: {}", report.post_migrations.join(", "));
    }
    if let Some(error) = &report.error {
        println!("error: {error}");
    }
}

fn print_upgrade_status(status: &UpgradeStatus) {
    println!(
        "plan {}: current={} final={} requires_upgrade={}",
        status.plan,
        display_state(&status.current_state),
        status.final_state,
        status.requires_upgrade
    );
    for pending in &status.pending {
        println!(
            "  pending {} -> {}  {}",
            display_state(&pending.source),
            pending.target,
            pending.migration
        );
    }
    for name in &status.pending_post_migrations {
        println!("  pending post-migration {name}");
    }
}

fn print_history(entries: &[HistoryEntry]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(entries)?);
    Ok(())
}

fn print_schema_check(check: &SchemaCheck) {
    println!(
        "schema check: healthy={} tables_checked={} issues={}",
        check.healthy,
        check.tables_checked,
        check.issues.len()
    );
    for issue in &check.issues {
        let severity = match issue.severity {
            SchemaIssueSeverity::Error => "error",
            SchemaIssueSeverity::Warning => "warning",
        };
        println!("  [{severity}] {} {}: {}", issue.code, issue.table, issue.message);
    }
}

fn display_state(state: &str) -> &str {
    if state.is_empty() {
        "(initial)"
    } else {
        state
    }
}
