//! `SET CONSTRAINTS` for deferrable triggers.

use pgtrig_core::{Registry, Timing};

use crate::{
  Error, Result,
  database::{Database, TxState, Vendor},
};

/// Switch deferrable triggers to `timing` for the rest of the current
/// transaction.
///
/// With no URIs every deferrable trigger registered on the database is
/// switched.
pub fn set_constraints<D: Database + ?Sized, S: AsRef<str>>(
  db: &mut D,
  registry: &Registry,
  timing: Timing,
  uris: &[S],
) -> Result<()> {
  if db.vendor() != Vendor::Postgres {
    return Ok(());
  }
  if db.transaction_state() != TxState::Active {
    return Err(Error::NotInTransaction(db.label().to_owned()));
  }

  let label = db.label().to_owned();
  let names = if uris.is_empty() {
    registry
      .compiled(&label)
      .filter(|c| c.timing.is_some())
      .map(|c| c.constraint_name())
      .collect::<Vec<_>>()
  } else {
    uris
      .iter()
      .map(|uri| {
        let compiled = &registry.get_in(&label, uri.as_ref())?.compiled;
        match compiled.timing {
          Some(_) => Ok(compiled.constraint_name()),
          None => Err(Error::NotDeferrable(compiled.uri.clone())),
        }
      })
      .collect::<Result<Vec<_>>>()?
  };

  if names.is_empty() {
    return Ok(());
  }
  db.batch_execute(&format!("SET CONSTRAINTS {} {timing};", names.join(", ")))
}
