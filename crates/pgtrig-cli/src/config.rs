//! The `pgtrig.toml` file.
//!
//! ```toml
//! [databases.default]
//! url = "postgres://localhost/app"
//!
//! [databases.cache]
//! sqlite = "cache.db"
//!
//! [[tables]]
//! name        = "accounts"
//! fields      = ["id", "balance", "status"]
//! primary_key = ["id"]
//!
//! [[tables.triggers]]
//! kind       = "protect"
//! name       = "protect"
//! operations = ["delete"]
//! ```

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context as _, bail};
use pgtrig_core::{Registry, TableMeta, TriggerDef};
use pgtrig_postgres::{Database, PgDatabase, SqliteDatabase};
use serde::Deserialize;

fn default_database() -> String { "default".to_owned() }

/// Where a labelled database lives. Exactly one of `url` and `sqlite`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
  /// Postgres connection string.
  pub url:    Option<String>,
  /// Path to a SQLite file; reconciliation skips these.
  pub sqlite: Option<PathBuf>,
}

impl DatabaseConfig {
  pub fn open(&self, label: &str) -> anyhow::Result<Box<dyn Database>> {
    match (&self.url, &self.sqlite) {
      (Some(url), None) => {
        let db = PgDatabase::connect(label, url)
          .with_context(|| format!("failed to connect to database {label}"))?;
        Ok(Box::new(db))
      }
      (None, Some(path)) => {
        let db = SqliteDatabase::open(label, path)
          .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Box::new(db))
      }
      _ => bail!("database {label} needs exactly one of `url` or `sqlite`"),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
  #[serde(default = "default_database")]
  pub database: String,
  #[serde(flatten)]
  pub table:    TableMeta,
  #[serde(default)]
  pub triggers: Vec<TriggerDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
  #[serde(default)]
  pub databases: BTreeMap<String, DatabaseConfig>,
  #[serde(default)]
  pub tables:    Vec<TableConfig>,
}

impl Settings {
  /// Compile every configured trigger.
  pub fn registry(&self) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    for table in &self.tables {
      if !self.databases.contains_key(&table.database) {
        bail!(
          "table {} is routed to unknown database {}",
          table.table.display_name(),
          table.database
        );
      }
      for def in &table.triggers {
        registry
          .register(&table.database, &table.table, def.clone())
          .with_context(|| {
            format!(
              "invalid trigger {} on {}",
              def.name(),
              table.table.display_name()
            )
          })?;
      }
    }
    Ok(registry)
  }

  /// The databases to work on: `only` if given, otherwise all of them.
  pub fn select(
    &self,
    only: &[String],
  ) -> anyhow::Result<Vec<(&str, &DatabaseConfig)>> {
    if only.is_empty() {
      return Ok(self.databases.iter().map(|(k, v)| (k.as_str(), v)).collect());
    }
    only
      .iter()
      .map(|label| match self.databases.get_key_value(label) {
        Some((label, cfg)) => Ok((label.as_str(), cfg)),
        None => bail!("no database named {label} in the config file"),
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use ::config::{Config, File, FileFormat};
  use pgtrig_core::Operation;

  use super::*;

  const SAMPLE: &str = r#"
[databases.default]
url = "postgres://localhost/app"

[databases.cache]
sqlite = "cache.db"

[[tables]]
name        = "accounts"
fields      = ["id", "balance", { name = "state", column = "status" }]
primary_key = ["id"]

[[tables.triggers]]
kind       = "protect"
name       = "protect"
operations = ["delete"]

[[tables.triggers]]
kind   = "read_only"
name   = "read_only"
fields = ["balance"]

[[tables]]
schema   = "billing"
name     = "ledger"
database = "default"
fields   = ["id", "state"]

[[tables.triggers]]
kind        = "fsm"
name        = "state_fsm"
field       = "state"
transitions = [["open", "closed"]]
"#;

  fn parse(toml: &str) -> Settings {
    Config::builder()
      .add_source(File::from_str(toml, FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn sample_config_compiles() {
    let settings = parse(SAMPLE);
    assert_eq!(settings.databases.len(), 2);
    assert_eq!(settings.tables[1].table.schema, "billing");
    assert_eq!(settings.tables[0].table.fields[2].column, "status");

    let registry = settings.registry().unwrap();
    let uris: Vec<_> = registry.compiled("default").map(|c| c.uri.as_str()).collect();
    assert_eq!(
      uris,
      [
        "public.accounts:protect",
        "public.accounts:read_only",
        "billing.ledger:state_fsm",
      ]
    );

    let protect = &registry.get("public.accounts:protect").unwrap().trigger;
    assert!(protect.operations.contains(Operation::Delete));
    assert!(!protect.operations.contains(Operation::Update));
  }

  #[test]
  fn tables_must_name_a_known_database() {
    let mut settings = parse(SAMPLE);
    settings.tables[0].database = "replica".into();
    let err = settings.registry().unwrap_err();
    assert!(err.to_string().contains("unknown database replica"));
  }

  #[test]
  fn select_filters_by_label() {
    let settings = parse(SAMPLE);
    let all = settings.select(&[]).unwrap();
    assert_eq!(all.iter().map(|(l, _)| *l).collect::<Vec<_>>(), ["cache", "default"]);

    let one = settings.select(&["default".to_owned()]).unwrap();
    assert_eq!(one.len(), 1);
    assert!(settings.select(&["nope".to_owned()]).is_err());
  }

  #[test]
  fn databases_need_one_location() {
    let cfg = DatabaseConfig { url: None, sqlite: None };
    assert!(cfg.open("x").is_err());
  }
}
