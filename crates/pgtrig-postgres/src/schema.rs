//! SQL for the session-scoped ignore table.
//!
//! The table lives in `pg_temp`, so each session sees its own. Rows are
//! reference counts per trigger URI and are discarded when the enclosing
//! transaction ends, whether it commits or rolls back.

use pgtrig_core::{compiler::IGNORE_TABLE, sql::quote_literal};

/// Idempotent; safe to run at the start of every scope.
pub fn create_ignore_table() -> String {
  format!(
    "CREATE TEMP TABLE IF NOT EXISTS {IGNORE_TABLE} (
    uri  TEXT PRIMARY KEY,
    refs INTEGER NOT NULL
) ON COMMIT DELETE ROWS;"
  )
}

fn literal_list(uris: &[String]) -> String {
  uris.iter().map(|u| quote_literal(u)).collect::<Vec<_>>().join(", ")
}

/// Take one reference on each URI. `uris` must be free of duplicates.
pub fn acquire(uris: &[String]) -> String {
  let values = uris
    .iter()
    .map(|u| format!("({}, 1)", quote_literal(u)))
    .collect::<Vec<_>>()
    .join(", ");
  format!(
    "INSERT INTO pg_temp.{IGNORE_TABLE} AS i (uri, refs) VALUES {values}
ON CONFLICT (uri) DO UPDATE SET refs = i.refs + 1;"
  )
}

/// Drop one reference on each URI and forget any that reach zero.
pub fn release(uris: &[String]) -> String {
  format!(
    "UPDATE pg_temp.{IGNORE_TABLE} SET refs = refs - 1 WHERE uri IN ({});
DELETE FROM pg_temp.{IGNORE_TABLE} WHERE refs <= 0;",
    literal_list(uris)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_increments_on_conflict() {
    let sql = acquire(&["public.accounts:p".into(), "*".into()]);
    assert!(sql.contains("VALUES ('public.accounts:p', 1), ('*', 1)"));
    assert!(sql.contains("ON CONFLICT (uri) DO UPDATE SET refs = i.refs + 1"));
  }

  #[test]
  fn release_decrements_then_deletes() {
    let sql = release(&["it's".into()]);
    assert!(sql.contains("WHERE uri IN ('it''s')"));
    assert!(sql.ends_with("WHERE refs <= 0;"));
  }
}
