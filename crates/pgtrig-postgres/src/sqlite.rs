//! [`SqliteDatabase`], a non-Postgres connection.
//!
//! Projects that route some tables to SQLite register those connections
//! too; reconciliation and ignore scopes skip them.

use std::path::Path;

use rusqlite::Connection;

use crate::{
  Error, Result,
  database::{Database, InstalledTrigger, TxState, Vendor},
};

pub struct SqliteDatabase {
  label: String,
  conn:  Connection,
}

impl SqliteDatabase {
  pub fn open(label: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self { label: label.into(), conn: Connection::open(path)? })
  }

  /// Open an in-memory database. Useful for testing.
  pub fn open_in_memory(label: impl Into<String>) -> Result<Self> {
    Ok(Self { label: label.into(), conn: Connection::open_in_memory()? })
  }
}

impl Database for SqliteDatabase {
  fn label(&self) -> &str { &self.label }

  fn vendor(&self) -> Vendor { Vendor::Sqlite }

  fn batch_execute(&mut self, sql: &str) -> Result<()> {
    self.conn.execute_batch(sql)?;
    Ok(())
  }

  fn installed_triggers(
    &mut self,
    _schema: Option<&str>,
  ) -> Result<Vec<InstalledTrigger>> {
    Ok(Vec::new())
  }

  fn current_setting(&mut self, _name: &str) -> Result<String> {
    Err(Error::Unsupported {
      database: self.label.clone(),
      what:     "run-time parameters",
    })
  }

  fn transaction_state(&self) -> TxState {
    if self.conn.is_autocommit() {
      TxState::Idle
    } else {
      TxState::Active
    }
  }

  fn begin(&mut self) -> Result<()> { self.batch_execute("BEGIN") }

  fn commit(&mut self) -> Result<()> { self.batch_execute("COMMIT") }

  fn rollback(&mut self) -> Result<()> { self.batch_execute("ROLLBACK") }
}
