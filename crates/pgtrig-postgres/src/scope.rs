//! Transaction bookkeeping shared by the scope guards.
//!
//! A scope entered outside a transaction opens one and owns it. Leaving
//! the scope runs its cleanup SQL and commits an owned transaction;
//! abandoning it (dropping without exiting) rolls an owned transaction
//! back instead. Nothing but `ROLLBACK` is sent into an aborted
//! transaction.

use tracing::{debug, warn};

use crate::{
  Error, Result,
  database::{Database, TxState},
};

/// Make sure a transaction is open. `true` if this call opened it.
pub(crate) fn open<D: Database + ?Sized>(db: &mut D) -> Result<bool> {
  match db.transaction_state() {
    TxState::Failed => Err(Error::TransactionAborted(db.label().to_owned())),
    TxState::Active => Ok(false),
    TxState::Idle => {
      db.begin()?;
      Ok(true)
    }
  }
}

/// Run a scope's setup SQL, rolling back an owned transaction on failure.
pub(crate) fn setup<D: Database + ?Sized>(
  db: &mut D,
  owns_transaction: bool,
  sql: &str,
) -> Result<()> {
  let Err(err) = db.batch_execute(sql) else { return Ok(()) };
  if owns_transaction {
    if let Err(rollback) = db.rollback() {
      warn!(
        database = db.label(),
        error = %rollback,
        "rollback after failed scope entry failed"
      );
    }
  }
  Err(err)
}

/// Leave a scope. `commit` is false when the scope is being dropped.
pub(crate) fn close<D: Database + ?Sized>(
  db: &mut D,
  owns_transaction: bool,
  commit: bool,
  cleanup: &str,
) -> Result<()> {
  match db.transaction_state() {
    TxState::Idle => {
      // The transaction already ended and took the scope's state with it.
      debug!(database = db.label(), "scope outlived its transaction");
      return Ok(());
    }
    TxState::Failed => return abandon(db, owns_transaction),
    TxState::Active => {}
  }

  if owns_transaction && !commit {
    return db.rollback();
  }

  let cleaned = match db.batch_execute(cleanup) {
    // Aborted by a statement the wrapper never saw.
    Err(err) if err.is_transaction_aborted() => {
      return abandon(db, owns_transaction);
    }
    cleaned => cleaned,
  };
  if owns_transaction {
    if cleaned.is_ok() {
      db.commit()?;
    } else {
      db.rollback()?;
    }
  }
  cleaned
}

/// Leave cleanup to the rollback that must follow an aborted transaction.
fn abandon<D: Database + ?Sized>(db: &mut D, owns_transaction: bool) -> Result<()> {
  debug!(
    database = db.label(),
    "transaction aborted, leaving scope cleanup to the rollback"
  );
  if owns_transaction {
    db.rollback()?;
  }
  Ok(())
}
