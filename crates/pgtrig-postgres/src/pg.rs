//! [`PgDatabase`], the Postgres implementation of [`Database`].

use postgres::{Client, NoTls, Row, types::ToSql};

use crate::{
  Result, catalog,
  database::{Database, InstalledTrigger, TxState, Vendor},
};

/// A blocking Postgres connection.
///
/// Transactions are opened with plain `BEGIN`/`COMMIT` so the wrapper can
/// hand out `&mut self` freely; it tracks the resulting state itself. All
/// statements go through the wrapper so a failure inside a transaction is
/// always noticed.
pub struct PgDatabase {
  label:  String,
  client: Client,
  state:  TxState,
}

/// Parameters for [`PgDatabase::execute`] and friends.
pub type Params<'a> = [&'a (dyn ToSql + Sync)];

impl PgDatabase {
  pub fn connect(label: impl Into<String>, url: &str) -> Result<Self> {
    let client = Client::connect(url, NoTls)?;
    Ok(Self::from_client(label, client))
  }

  pub fn from_client(label: impl Into<String>, client: Client) -> Self {
    Self { label: label.into(), client, state: TxState::Idle }
  }

  /// Run one statement, returning the number of rows it touched.
  ///
  /// `BEGIN`, `COMMIT` and friends issued here are tracked like the trait
  /// methods.
  pub fn execute(&mut self, sql: &str, params: &Params<'_>) -> Result<u64> {
    let result = self.client.execute(sql, params).map_err(Into::into);
    let result = self.track(result);
    if result.is_ok() {
      if let Some(state) = control_statement(sql) {
        self.state = state;
      }
    }
    result
  }

  pub fn query(&mut self, sql: &str, params: &Params<'_>) -> Result<Vec<Row>> {
    let result = self.client.query(sql, params).map_err(Into::into);
    self.track(result)
  }

  pub fn query_one(&mut self, sql: &str, params: &Params<'_>) -> Result<Row> {
    let result = self.client.query_one(sql, params).map_err(Into::into);
    self.track(result)
  }

  fn track<T>(&mut self, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
      if self.state == TxState::Active || err.is_transaction_aborted() {
        self.state = TxState::Failed;
      }
    }
    result
  }
}

/// The state a transaction-control statement leaves the session in.
fn control_statement(sql: &str) -> Option<TxState> {
  let keyword = sql
    .trim_start()
    .split(|c: char| !c.is_ascii_alphabetic())
    .next()?
    .to_ascii_uppercase();
  match keyword.as_str() {
    "BEGIN" | "START" => Some(TxState::Active),
    "COMMIT" | "END" | "ROLLBACK" | "ABORT" => Some(TxState::Idle),
    _ => None,
  }
}

impl Database for PgDatabase {
  fn label(&self) -> &str { &self.label }

  fn vendor(&self) -> Vendor { Vendor::Postgres }

  fn batch_execute(&mut self, sql: &str) -> Result<()> {
    let result = self.client.batch_execute(sql).map_err(Into::into);
    self.track(result)
  }

  fn installed_triggers(
    &mut self,
    schema: Option<&str>,
  ) -> Result<Vec<InstalledTrigger>> {
    let rows = self.query(catalog::INSTALLED_TRIGGERS, &[&schema])?;
    rows.iter().map(catalog::decode).collect()
  }

  fn current_setting(&mut self, name: &str) -> Result<String> {
    let row = self.query_one("SELECT current_setting($1)", &[&name])?;
    Ok(row.try_get(0)?)
  }

  fn transaction_state(&self) -> TxState { self.state }

  fn begin(&mut self) -> Result<()> {
    self.client.batch_execute("BEGIN")?;
    self.state = TxState::Active;
    Ok(())
  }

  fn commit(&mut self) -> Result<()> {
    // COMMIT of an aborted transaction rolls back; either way it ends.
    let result = self.client.batch_execute("COMMIT");
    self.state = TxState::Idle;
    Ok(result?)
  }

  fn rollback(&mut self) -> Result<()> {
    let result = self.client.batch_execute("ROLLBACK");
    self.state = TxState::Idle;
    Ok(result?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transaction_control_is_recognised() {
    assert_eq!(control_statement("BEGIN"), Some(TxState::Active));
    assert_eq!(
      control_statement("  start transaction isolation level serializable"),
      Some(TxState::Active)
    );
    assert_eq!(control_statement("commit;"), Some(TxState::Idle));
    assert_eq!(control_statement("ROLLBACK"), Some(TxState::Idle));
    assert_eq!(control_statement("SELECT 1"), None);
    assert_eq!(control_statement("BEGINNING"), None);
    assert_eq!(control_statement(""), None);
  }
}
