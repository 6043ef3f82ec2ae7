//! Schema scopes: resolve unqualified names against chosen schemas for a
//! unit of work.
//!
//! Entering a scope puts its schemas at the front of the session's
//! `search_path` with `set_config(.., true)`, the function form of
//! `SET LOCAL`, so the change never outlives the transaction. Schemas
//! already on the path keep their place. Leaving the scope restores the
//! path it found; nested scopes unwind in order.

use std::ops::{Deref, DerefMut};

use pgtrig_core::sql::{quote_ident, quote_literal};
use tracing::{debug, warn};

use crate::{
  Error, Result,
  database::{Database, Vendor},
  scope,
};

/// What one schema scope changed on one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaHandle {
  pub database:         String,
  /// The path in effect inside the scope.
  pub search_path:      String,
  /// The path the scope replaced, restored on exit.
  pub previous:         String,
  pub owns_transaction: bool,
}

/// A guard over a connection with a modified `search_path`.
///
/// Derefs to the connection so work inside the scope goes through it.
pub struct SchemaScope<'d, D: Database + ?Sized> {
  db:     &'d mut D,
  handle: Option<SchemaHandle>,
}

/// Enter a schema scope on one database.
///
/// Non-Postgres databases, and an empty schema list, yield an inert scope.
pub fn enter_schema<'d, D, S>(
  db: &'d mut D,
  schemas: &[S],
) -> Result<SchemaScope<'d, D>>
where
  D: Database + ?Sized,
  S: AsRef<str>,
{
  if let Some(bad) = schemas.iter().find(|s| s.as_ref().trim().is_empty()) {
    return Err(Error::InvalidSchema(bad.as_ref().to_owned()));
  }
  if db.vendor() != Vendor::Postgres || schemas.is_empty() {
    debug!(database = db.label(), "schema scope is a no-op on this database");
    return Ok(SchemaScope { db, handle: None });
  }

  let previous = db.current_setting("search_path")?;
  let search_path = prefixed(schemas, &previous);
  let owns_transaction = scope::open(db)?;
  scope::setup(db, owns_transaction, &set_search_path(&search_path))?;

  debug!(database = db.label(), search_path = %search_path, "entered schema scope");
  let handle = SchemaHandle {
    database: db.label().to_owned(),
    search_path,
    previous,
    owns_transaction,
  };
  Ok(SchemaScope { db, handle: Some(handle) })
}

fn prefixed<S: AsRef<str>>(schemas: &[S], previous: &str) -> String {
  let existing: Vec<&str> = previous
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .collect();
  let mut path: Vec<String> = Vec::new();
  for schema in schemas {
    let quoted = quote_ident(schema.as_ref());
    if !path.contains(&quoted) && !existing.contains(&quoted.as_str()) {
      path.push(quoted);
    }
  }
  path.extend(existing.into_iter().map(str::to_owned));
  path.join(", ")
}

fn set_search_path(path: &str) -> String {
  format!("SELECT set_config('search_path', {}, true);", quote_literal(path))
}

impl<D: Database + ?Sized> SchemaScope<'_, D> {
  /// `None` for inert scopes.
  pub fn handle(&self) -> Option<&SchemaHandle> { self.handle.as_ref() }

  /// Restore the previous search path, committing the transaction if the
  /// scope opened it.
  pub fn exit(mut self) -> Result<()> {
    match self.handle.take() {
      Some(handle) => restore(&mut *self.db, &handle, true),
      None => Ok(()),
    }
  }
}

impl<D: Database + ?Sized> Deref for SchemaScope<'_, D> {
  type Target = D;

  fn deref(&self) -> &D { &*self.db }
}

impl<D: Database + ?Sized> DerefMut for SchemaScope<'_, D> {
  fn deref_mut(&mut self) -> &mut D { &mut *self.db }
}

impl<D: Database + ?Sized> Drop for SchemaScope<'_, D> {
  fn drop(&mut self) {
    let Some(handle) = self.handle.take() else { return };
    if let Err(source) = restore(&mut *self.db, &handle, false) {
      let err = Error::SchemaCleanup {
        database: handle.database.clone(),
        source:   Box::new(source),
      };
      warn!(error = %err, "schema scope cleanup failed");
    }
  }
}

fn restore<D: Database + ?Sized>(
  db: &mut D,
  handle: &SchemaHandle,
  commit: bool,
) -> Result<()> {
  let cleanup = set_search_path(&handle.previous);
  scope::close(db, handle.owns_transaction, commit, &cleanup)?;
  debug!(database = %handle.database, search_path = %handle.previous, "left schema scope");
  Ok(())
}
