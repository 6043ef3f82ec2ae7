//! The `Database` trait and supporting types.
//!
//! Reconciliation and the ignore mechanism depend on this abstraction, not
//! on a concrete driver. Every call blocks on the caller's connection.

use serde::Serialize;

use crate::Result;

/// What kind of server sits behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Vendor {
  Postgres,
  Sqlite,
}

/// Transaction state as observed by the connection wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TxState {
  /// Autocommit; no explicit transaction is open.
  Idle,
  Active,
  /// A statement failed inside the open transaction. Postgres rejects
  /// everything but `ROLLBACK` until it ends.
  Failed,
}

/// A managed trigger as found in the live catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledTrigger {
  pub schema:          String,
  pub table:           String,
  /// `pg_trigger.tgname`
  pub name:            String,
  pub enabled:         bool,
  pub function_schema: String,
  pub function:        String,
  /// Hash embedded in the function body, if one could be found.
  pub hash:            Option<String>,
}

impl InstalledTrigger {
  pub fn table_display(&self) -> String { format!("{}.{}", self.schema, self.table) }
}

/// A connection the reconciliation engine can drive.
pub trait Database {
  /// Name of the database in configuration and the registry.
  fn label(&self) -> &str;

  fn vendor(&self) -> Vendor;

  /// Run one or more statements as a single simple-query batch.
  fn batch_execute(&mut self, sql: &str) -> Result<()>;

  /// Managed triggers on parent tables, optionally limited to one schema.
  fn installed_triggers(
    &mut self,
    schema: Option<&str>,
  ) -> Result<Vec<InstalledTrigger>>;

  /// Current value of a run-time parameter such as `search_path`.
  fn current_setting(&mut self, name: &str) -> Result<String>;

  fn transaction_state(&self) -> TxState;

  fn begin(&mut self) -> Result<()>;

  fn commit(&mut self) -> Result<()>;

  fn rollback(&mut self) -> Result<()>;
}

impl<D: Database + ?Sized> Database for &mut D {
  fn label(&self) -> &str { (**self).label() }

  fn vendor(&self) -> Vendor { (**self).vendor() }

  fn batch_execute(&mut self, sql: &str) -> Result<()> {
    (**self).batch_execute(sql)
  }

  fn installed_triggers(
    &mut self,
    schema: Option<&str>,
  ) -> Result<Vec<InstalledTrigger>> {
    (**self).installed_triggers(schema)
  }

  fn current_setting(&mut self, name: &str) -> Result<String> {
    (**self).current_setting(name)
  }

  fn transaction_state(&self) -> TxState { (**self).transaction_state() }

  fn begin(&mut self) -> Result<()> { (**self).begin() }

  fn commit(&mut self) -> Result<()> { (**self).commit() }

  fn rollback(&mut self) -> Result<()> { (**self).rollback() }
}
