//! Applying compiled triggers to live databases.
//!
//! Everything here is synchronous and works on a caller-supplied
//! connection through the [`Database`] trait. Pooling, timeouts and
//! transactions spanning a whole pass are the caller's business.

mod catalog;
mod schema;
mod scope;

pub mod constraints;
pub mod database;
pub mod error;
pub mod ignore;
pub mod pg;
pub mod reconcile;
pub mod search_path;
pub mod sqlite;

pub use constraints::set_constraints;
pub use database::{Database, InstalledTrigger, TxState, Vendor};
pub use error::{Error, Result};
pub use ignore::{IgnoreHandle, IgnoreScope, IgnoreSet, IgnoreTarget, enter, enter_all};
pub use pg::PgDatabase;
pub use reconcile::{Action, Change, Filter, Reconciler, State, Status};
pub use search_path::{SchemaHandle, SchemaScope, enter_schema};
pub use sqlite::SqliteDatabase;
