//! Ignore scopes: suppress managed triggers for a unit of work.
//!
//! Entering a scope takes one reference per trigger URI (or on the `*`
//! sentinel) in the session's `pg_temp._pgtrig_ignore` table. Every managed
//! function checks that table first and passes the row through untouched
//! when its URI or the sentinel is present. Nested scopes on the same URI
//! stack; a URI stays ignored until its last holder leaves.
//!
//! Rows never outlive the enclosing transaction: the table is
//! `ON COMMIT DELETE ROWS`, and a rollback discards them with everything
//! else. A scope entered outside a transaction opens one and owns it:
//! [`IgnoreScope::exit`] commits it, dropping the scope without exiting
//! rolls it back.

use std::ops::{Deref, DerefMut};

use pgtrig_core::{Registry, compiler::IGNORE_ALL};
use tracing::{debug, warn};

use crate::{
  Error, Result,
  database::{Database, Vendor},
  schema, scope,
};

/// What a scope suppresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreTarget {
  /// Every managed trigger in the session.
  All,
  /// The listed trigger URIs; each must be registered.
  Uris(Vec<String>),
}

impl IgnoreTarget {
  pub fn uris<I, S>(uris: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    IgnoreTarget::Uris(uris.into_iter().map(Into::into).collect())
  }

  fn resolve(&self, registry: &Registry) -> Result<Vec<String>> {
    match self {
      IgnoreTarget::All => Ok(vec![IGNORE_ALL.to_owned()]),
      IgnoreTarget::Uris(uris) => {
        let mut resolved = registry.resolve(uris)?;
        resolved.sort();
        resolved.dedup();
        Ok(resolved)
      }
    }
  }
}

/// The references one scope holds on one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreHandle {
  pub database:         String,
  /// Each URI carries exactly one reference from this scope.
  pub uris:             Vec<String>,
  /// Whether the scope began the enclosing transaction.
  pub owns_transaction: bool,
}

/// A guard over a connection with some triggers ignored.
///
/// Derefs to the connection so work inside the scope goes through it.
pub struct IgnoreScope<'d, D: Database + ?Sized> {
  db:     &'d mut D,
  handle: Option<IgnoreHandle>,
}

/// Enter an ignore scope on one database.
///
/// Non-Postgres databases yield an inert scope.
pub fn enter<'d, D: Database + ?Sized>(
  db: &'d mut D,
  registry: &Registry,
  target: &IgnoreTarget,
) -> Result<IgnoreScope<'d, D>> {
  let uris = target.resolve(registry)?;
  if db.vendor() != Vendor::Postgres || uris.is_empty() {
    debug!(database = db.label(), "ignore scope is a no-op on this database");
    return Ok(IgnoreScope { db, handle: None });
  }

  let owns_transaction = scope::open(db)?;
  let sql = format!("{}\n{}", schema::create_ignore_table(), schema::acquire(&uris));
  scope::setup(db, owns_transaction, &sql)?;

  debug!(database = db.label(), uris = ?uris, "entered ignore scope");
  let handle = IgnoreHandle {
    database: db.label().to_owned(),
    uris,
    owns_transaction,
  };
  Ok(IgnoreScope { db, handle: Some(handle) })
}

impl<'d, D: Database + ?Sized> IgnoreScope<'d, D> {
  /// `None` for inert scopes.
  pub fn handle(&self) -> Option<&IgnoreHandle> { self.handle.as_ref() }

  /// Release this scope's references, committing the transaction if the
  /// scope opened it.
  pub fn exit(mut self) -> Result<()> {
    match self.handle.take() {
      Some(handle) => release(&mut *self.db, &handle, true),
      None => Ok(()),
    }
  }
}

impl<D: Database + ?Sized> Deref for IgnoreScope<'_, D> {
  type Target = D;

  fn deref(&self) -> &D { &*self.db }
}

impl<D: Database + ?Sized> DerefMut for IgnoreScope<'_, D> {
  fn deref_mut(&mut self) -> &mut D { &mut *self.db }
}

impl<D: Database + ?Sized> Drop for IgnoreScope<'_, D> {
  fn drop(&mut self) {
    let Some(handle) = self.handle.take() else { return };
    if let Err(source) = release(&mut *self.db, &handle, false) {
      let err = Error::IgnoreCleanup {
        database: handle.database.clone(),
        source:   Box::new(source),
      };
      warn!(error = %err, "ignore scope cleanup failed");
    }
  }
}

fn release<D: Database + ?Sized>(
  db: &mut D,
  handle: &IgnoreHandle,
  commit: bool,
) -> Result<()> {
  let cleanup = schema::release(&handle.uris);
  scope::close(db, handle.owns_transaction, commit, &cleanup)?;
  debug!(database = %handle.database, uris = ?handle.uris, "left ignore scope");
  Ok(())
}

// ─── Multiple databases ──────────────────────────────────────────────────────

/// One ignore scope per database, entered and left together.
pub struct IgnoreSet<'d> {
  scopes: Vec<IgnoreScope<'d, dyn Database + 'd>>,
}

/// Enter the same ignore scope on each of `databases`.
///
/// If entering fails part-way, scopes already entered are released before
/// the error is returned.
pub fn enter_all<'d, I>(
  databases: I,
  registry: &Registry,
  target: &IgnoreTarget,
) -> Result<IgnoreSet<'d>>
where
  I: IntoIterator<Item = &'d mut (dyn Database + 'd)>,
{
  let mut scopes = Vec::new();
  for db in databases {
    scopes.push(enter(db, registry, target)?);
  }
  Ok(IgnoreSet { scopes })
}

impl<'d> IgnoreSet<'d> {
  /// The connection labelled `label`, for work inside the scope.
  pub fn get_mut(&mut self, label: &str) -> Option<&mut (dyn Database + 'd)> {
    self
      .scopes
      .iter_mut()
      .find(|scope| scope.label() == label)
      .map(|scope| &mut **scope)
  }

  pub fn handles(&self) -> impl Iterator<Item = &IgnoreHandle> {
    self.scopes.iter().filter_map(|s| s.handle())
  }

  /// Exit every scope, returning the first failure after trying them all.
  pub fn exit(self) -> Result<()> {
    let mut first = None;
    for scope in self.scopes {
      if let Err(err) = scope.exit() {
        first.get_or_insert(err);
      }
    }
    first.map_or(Ok(()), Err)
  }
}
