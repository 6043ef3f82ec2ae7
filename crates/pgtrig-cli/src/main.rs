//! `pgtrig`: keep the triggers declared in `pgtrig.toml` in sync with the
//! configured databases.
//!
//! # Usage
//!
//! ```
//! pgtrig ls
//! pgtrig install --database default
//! pgtrig install public.accounts:protect --dry-run
//! pgtrig disable --schema billing
//! pgtrig prune
//! ```

mod config;

use std::path::PathBuf;

use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use pgtrig_core::Registry;
use pgtrig_postgres::{Action, Change, Database, Error, Filter, Reconciler};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pgtrig", version, about = "Postgres trigger reconciliation")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "pgtrig.toml", global = true)]
  config: PathBuf,

  /// Only work on this database label. Repeatable; defaults to all.
  #[arg(short, long = "database", value_name = "LABEL", global = true)]
  databases: Vec<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// List registered and orphaned triggers with their state.
  Ls(Target),
  /// Install missing or outdated triggers, pruning orphans.
  Install(Target),
  /// Drop installed triggers, pruning orphans.
  Uninstall(Target),
  /// Enable installed triggers.
  Enable(Target),
  /// Disable installed triggers.
  Disable(Target),
  /// Drop managed triggers nothing is registered for.
  Prune {
    #[arg(long)]
    schema:  Option<String>,
    /// Print the SQL instead of running it.
    #[arg(long)]
    dry_run: bool,
  },
}

#[derive(Args)]
struct Target {
  /// Trigger URIs (`schema.table:name`). Given URIs are acted on regardless
  /// of their state and nothing is pruned.
  uris:    Vec<String>,
  /// Only consider tables in this schema.
  #[arg(long)]
  schema:  Option<String>,
  /// Print the SQL instead of running it.
  #[arg(long)]
  dry_run: bool,
}

impl Target {
  fn filter(&self) -> Filter {
    Filter { schema: self.schema.clone(), uris: self.uris.clone() }
  }
}

// ─── Entry point ──────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let settings: Settings = ::config::Config::builder()
    .add_source(::config::File::from(cli.config.as_path()).required(false))
    .add_source(
      ::config::Environment::with_prefix("PGTRIG")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()
    .context("failed to read config file")?
    .try_deserialize()
    .context("failed to deserialise config")?;

  let registry = settings.registry()?;
  let (action, filter, dry_run) = match &cli.command {
    Command::Ls(target) => (None, target.filter(), false),
    Command::Install(target) => (Some(Action::Install), target.filter(), target.dry_run),
    Command::Uninstall(target) => {
      (Some(Action::Uninstall), target.filter(), target.dry_run)
    }
    Command::Enable(target) => (Some(Action::Enable), target.filter(), target.dry_run),
    Command::Disable(target) => (Some(Action::Disable), target.filter(), target.dry_run),
    Command::Prune { schema, dry_run } => (
      Some(Action::Prune),
      Filter { schema: schema.clone(), uris: Vec::new() },
      *dry_run,
    ),
  };

  // Unknown URIs are a usage error, whichever database they belong to.
  registry.resolve(&filter.uris)?;

  let mut failed = 0;
  for (label, db_cfg) in settings.select(&cli.databases)? {
    let Some(filter) = filter_for(&registry, label, &filter) else { continue };
    let mut db = db_cfg.open(label)?;
    tracing::info!(database = label, "connected");
    let result = match action {
      None => list(&registry, db.as_mut(), &filter),
      Some(action) => run(&registry, db.as_mut(), action, &filter, dry_run),
    };
    if let Err(err) = result {
      report(&err);
      failed += 1;
    }
  }

  if failed > 0 {
    bail!("{failed} database(s) failed");
  }
  Ok(())
}

/// Narrow URIs to those routed to `label`. `None` when URIs were given
/// and none of them live there.
fn filter_for(registry: &Registry, label: &str, filter: &Filter) -> Option<Filter> {
  if filter.uris.is_empty() {
    return Some(filter.clone());
  }
  let uris: Vec<String> = filter
    .uris
    .iter()
    .filter(|uri| registry.get_in(label, uri).is_ok())
    .cloned()
    .collect();
  (!uris.is_empty()).then(|| Filter { schema: filter.schema.clone(), uris })
}

fn list(
  registry: &Registry,
  db: &mut dyn Database,
  filter: &Filter,
) -> pgtrig_postgres::Result<()> {
  let label = db.label().to_owned();
  for status in Reconciler::new(registry).status(db, filter)? {
    let enabled = match status.enabled {
      Some(true) => "enabled",
      Some(false) => "disabled",
      None => "-",
    };
    println!("{label}\t{}\t{enabled}\t{}", status.state, status.uri);
  }
  Ok(())
}

fn run(
  registry: &Registry,
  db: &mut dyn Database,
  action: Action,
  filter: &Filter,
  dry_run: bool,
) -> pgtrig_postgres::Result<()> {
  let reconciler = Reconciler::new(registry);
  let changes = reconciler.plan(db, action, filter)?;
  if dry_run {
    for change in &changes {
      println!(
        "-- {} {} on {}\n{}\n",
        change.action, change.trigger, change.table, change.sql
      );
    }
    return Ok(());
  }
  let applied = reconciler.apply(db, changes)?;
  print_applied(db.label(), &applied);
  Ok(())
}

fn print_applied(label: &str, changes: &[Change]) {
  if changes.is_empty() {
    println!("{label}\tup to date");
  }
  for change in changes {
    println!("{label}\t{}\t{}", change.action, change.uri);
  }
}

fn report(err: &Error) {
  match err {
    Error::Reconcile { database, applied, failures } => {
      print_applied(database, applied);
      for failure in failures {
        eprintln!("{database}\terror\t{failure}");
      }
    }
    other => eprintln!("error: {other}"),
  }
}
