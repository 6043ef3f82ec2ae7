//! Error type for `pgtrig-postgres`.

use std::{error::Error as _, fmt::Write as _};

use postgres::error::{DbError, SqlState};
use thiserror::Error;

use crate::reconcile::{Action, Change};

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] pgtrig_core::Error),

  #[error("postgres error: {}", describe_postgres(.0))]
  Postgres(#[from] postgres::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  /// DDL for one trigger failed; carries the driver's error untouched.
  #[error("failed to {action} trigger {trigger} on {table}: {source}")]
  Install {
    action:  Action,
    table:   String,
    trigger: String,
    #[source]
    source:  Box<Error>,
  },

  /// At least one change in a reconciliation pass failed.
  #[error(
    "{} of {} changes failed on database {database}",
    failures.len(),
    failures.len() + applied.len()
  )]
  Reconcile {
    database: String,
    applied:  Vec<Change>,
    failures: Vec<Error>,
  },

  /// Releasing an ignore scope failed. Only ever logged.
  #[error("failed to clean up ignore scope on database {database}: {source}")]
  IgnoreCleanup {
    database: String,
    #[source]
    source:   Box<Error>,
  },

  /// Restoring a schema scope's search path failed. Only ever logged.
  #[error("failed to restore search path on database {database}: {source}")]
  SchemaCleanup {
    database: String,
    #[source]
    source:   Box<Error>,
  },

  #[error("invalid schema name {0:?}")]
  InvalidSchema(String),

  #[error("database {database} does not support {what}")]
  Unsupported { database: String, what: &'static str },

  #[error("database {0} has an aborted transaction")]
  TransactionAborted(String),

  #[error("database {0} is not inside a transaction")]
  NotInTransaction(String),

  #[error("trigger {0} is not deferrable")]
  NotDeferrable(String),

  #[error("could not decode catalog row: {0}")]
  Decode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// The server-side error behind this one, if any.
  pub fn as_db_error(&self) -> Option<&DbError> {
    match self {
      Error::Postgres(err) => err.as_db_error(),
      Error::Install { source, .. }
      | Error::IgnoreCleanup { source, .. }
      | Error::SchemaCleanup { source, .. } => source.as_db_error(),
      _ => None,
    }
  }

  /// Whether the statement was refused because the transaction had
  /// already failed.
  pub fn is_transaction_aborted(&self) -> bool {
    match self {
      Error::TransactionAborted(_) => true,
      _ => self
        .as_db_error()
        .is_some_and(|db| *db.code() == SqlState::IN_FAILED_SQL_TRANSACTION),
    }
  }
}

/// `postgres::Error` only says "db error"; spell out what the server sent.
fn describe_postgres(err: &postgres::Error) -> String {
  let Some(db) = err.as_db_error() else {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
      let _ = write!(out, ": {cause}");
      source = cause.source();
    }
    return out;
  };

  let mut out = format!("{}: {} ({})", db.severity(), db.message(), db.code().code());
  if let Some(detail) = db.detail() {
    let _ = write!(out, "; detail: {detail}");
  }
  if let Some(hint) = db.hint() {
    let _ = write!(out, "; hint: {hint}");
  }
  if let Some(context) = db.where_() {
    let _ = write!(out, "; context: {}", context.replace('\n', " / "));
  }
  out
}
