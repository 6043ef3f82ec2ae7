//! Reconciliation of installed triggers against the registry.
//!
//! Each registered trigger is in one of four states relative to a database,
//! decided purely by comparing content hashes:
//!
//! ```text
//!   Missing ──install──▶ Current ◀──install── Outdated
//!      ▲                    │                    │
//!      └────uninstall───────┴────────────────────┘
//!   Orphaned ──prune──▶ (gone)
//! ```
//!
//! Changes are planned in registry order (tables in registration order,
//! triggers in insertion order), then orphans sorted by table and name, so
//! an unchanged registry always yields the same DDL sequence.

use std::collections::{BTreeMap, HashSet};

use pgtrig_core::{CompiledTrigger, Registry, compiler::drop_sql};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  Error, Result,
  database::{Database, InstalledTrigger, TxState, Vendor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE")]
pub enum State {
  Missing,
  Current,
  Outdated,
  Orphaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
  Install,
  Uninstall,
  Enable,
  Disable,
  Prune,
}

/// One row of `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
  /// `schema.table:name` for registered triggers; `schema.table:tgname`
  /// for orphans.
  pub uri:     String,
  pub table:   String,
  pub trigger: String,
  pub state:   State,
  /// `None` when the trigger is not installed.
  pub enabled: Option<bool>,
}

/// One DDL batch a pass will run (or ran).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
  pub action:  Action,
  pub uri:     String,
  pub table:   String,
  pub trigger: String,
  pub sql:     String,
}

/// Which triggers an operation considers.
///
/// With `uris`, the operation targets exactly those triggers regardless of
/// their state and never prunes.
#[derive(Debug, Clone, Default)]
pub struct Filter {
  pub schema: Option<String>,
  pub uris:   Vec<String>,
}

impl Filter {
  pub fn schema(schema: impl Into<String>) -> Self {
    Self { schema: Some(schema.into()), uris: Vec::new() }
  }

  pub fn uris<I, S>(uris: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self { schema: None, uris: uris.into_iter().map(Into::into).collect() }
  }
}

type Key = (String, String, String);

fn key(schema: &str, table: &str, name: &str) -> Key {
  (schema.to_owned(), table.to_owned(), name.to_owned())
}

/// Desired and actual state for one database.
struct Snapshot<'r> {
  desired:  Vec<(&'r CompiledTrigger, Option<InstalledTrigger>)>,
  orphans:  Vec<InstalledTrigger>,
  targeted: bool,
}

fn state(compiled: &CompiledTrigger, installed: Option<&InstalledTrigger>) -> State {
  match installed {
    None => State::Missing,
    Some(i) if i.hash.as_deref() == Some(compiled.hash.as_str()) => State::Current,
    Some(_) => State::Outdated,
  }
}

/// Drives one [`Database`] towards the state described by a [`Registry`].
pub struct Reconciler<'r> {
  registry: &'r Registry,
}

impl<'r> Reconciler<'r> {
  pub fn new(registry: &'r Registry) -> Self { Self { registry } }

  fn skip<D: Database + ?Sized>(&self, db: &D, what: &str) -> bool {
    if db.vendor() == Vendor::Postgres {
      return false;
    }
    debug!(
      database = db.label(),
      vendor = %db.vendor(),
      "skipping {what} on non-postgres database"
    );
    true
  }

  fn snapshot<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Snapshot<'r>> {
    let label = db.label().to_owned();
    let schema = filter.schema.as_deref();

    let desired: Vec<&'r CompiledTrigger> = if filter.uris.is_empty() {
      self
        .registry
        .compiled(&label)
        .filter(|c| schema.is_none_or(|s| c.schema == s))
        .collect::<Vec<_>>()
    } else {
      let mut seen = HashSet::new();
      let mut targeted = Vec::new();
      for uri in &filter.uris {
        let entry = self.registry.get_in(&label, uri)?;
        if seen.insert(&entry.compiled.uri) {
          targeted.push(&entry.compiled);
        }
      }
      targeted
    };

    let mut installed: BTreeMap<Key, InstalledTrigger> = db
      .installed_triggers(schema)?
      .into_iter()
      .map(|i| (key(&i.schema, &i.table, &i.name), i))
      .collect();

    let desired = desired
      .into_iter()
      .map(|c| {
        let found = installed.remove(&key(&c.schema, &c.table, &c.pgid));
        (c, found)
      })
      .collect();

    // Registered triggers outside the filter are not orphans.
    for c in self.registry.compiled(&label) {
      installed.remove(&key(&c.schema, &c.table, &c.pgid));
    }

    Ok(Snapshot {
      desired,
      orphans: installed.into_values().collect(),
      targeted: !filter.uris.is_empty(),
    })
  }

  /// Report the state of every registered trigger, then every orphan.
  pub fn status<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Vec<Status>> {
    if self.skip(db, "status") {
      return Ok(Vec::new());
    }
    let snapshot = self.snapshot(db, filter)?;

    let mut out: Vec<Status> = snapshot
      .desired
      .iter()
      .map(|(c, installed)| Status {
        uri:     c.uri.clone(),
        table:   c.table_display(),
        trigger: c.name.clone(),
        state:   state(c, installed.as_ref()),
        enabled: installed.as_ref().map(|i| i.enabled),
      })
      .collect();

    if !snapshot.targeted {
      out.extend(snapshot.orphans.iter().map(|o| Status {
        uri:     format!("{}:{}", o.table_display(), o.name),
        table:   o.table_display(),
        trigger: o.name.clone(),
        state:   State::Orphaned,
        enabled: Some(o.enabled),
      }));
    }
    Ok(out)
  }

  /// The ordered changes `action` would apply, without running them.
  pub fn plan<D: Database + ?Sized>(
    &self,
    db: &mut D,
    action: Action,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    if self.skip(db, "planning") {
      return Ok(Vec::new());
    }
    let snapshot = self.snapshot(db, filter)?;
    let forced = snapshot.targeted;

    let mut changes = Vec::new();
    for (compiled, installed) in &snapshot.desired {
      let state = state(compiled, installed.as_ref());
      let sql = match action {
        Action::Install if forced || state != State::Current => {
          Some(compiled.install_sql())
        }
        Action::Uninstall if forced || state != State::Missing => {
          Some(compiled.uninstall_sql())
        }
        Action::Enable | Action::Disable => {
          let enable = action == Action::Enable;
          let toggle = match installed {
            Some(i) => i.enabled != enable,
            None => false,
          };
          (forced || toggle).then(|| compiled.enable_sql(enable))
        }
        _ => None,
      };
      if let Some(sql) = sql {
        changes.push(Change {
          action,
          uri: compiled.uri.clone(),
          table: compiled.table_display(),
          trigger: compiled.name.clone(),
          sql,
        });
      }
    }

    let prunes = matches!(action, Action::Install | Action::Uninstall | Action::Prune);
    if prunes && !forced {
      changes.extend(snapshot.orphans.iter().map(prune_change));
    }
    Ok(changes)
  }

  /// Run planned changes in order, continuing past individual failures.
  ///
  /// Stops early only once the connection's transaction has aborted, since
  /// every later statement would fail with the same error.
  pub fn apply<D: Database + ?Sized>(
    &self,
    db: &mut D,
    changes: Vec<Change>,
  ) -> Result<Vec<Change>> {
    let label = db.label().to_owned();
    let total = changes.len();
    let mut applied = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for change in changes {
      if db.transaction_state() == TxState::Failed {
        warn!(
          database = %label,
          remaining = total - applied.len() - failures.len(),
          "transaction aborted, skipping remaining changes"
        );
        break;
      }
      match db.batch_execute(&change.sql) {
        Ok(()) => {
          info!(
            database = %label,
            action = %change.action,
            table = %change.table,
            trigger = %change.trigger,
            "applied trigger change"
          );
          applied.push(change);
        }
        Err(source) => {
          warn!(
            database = %label,
            action = %change.action,
            table = %change.table,
            trigger = %change.trigger,
            error = %source,
            "trigger change failed"
          );
          failures.push(Error::Install {
            action:  change.action,
            table:   change.table,
            trigger: change.trigger,
            source:  Box::new(source),
          });
        }
      }
    }

    if failures.is_empty() {
      Ok(applied)
    } else {
      Err(Error::Reconcile { database: label, applied, failures })
    }
  }

  fn run<D: Database + ?Sized>(
    &self,
    db: &mut D,
    action: Action,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    let changes = self.plan(db, action, filter)?;
    self.apply(db, changes)
  }

  /// Install missing and outdated triggers. Without URIs, orphans are
  /// pruned as well.
  pub fn install<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    self.run(db, Action::Install, filter)
  }

  /// Drop installed triggers. Without URIs, orphans are pruned as well.
  pub fn uninstall<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    self.run(db, Action::Uninstall, filter)
  }

  pub fn enable<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    self.run(db, Action::Enable, filter)
  }

  pub fn disable<D: Database + ?Sized>(
    &self,
    db: &mut D,
    filter: &Filter,
  ) -> Result<Vec<Change>> {
    self.run(db, Action::Disable, filter)
  }

  /// Drop installed managed triggers that nothing in the registry wants.
  pub fn prune<D: Database + ?Sized>(
    &self,
    db: &mut D,
    schema: Option<&str>,
  ) -> Result<Vec<Change>> {
    let filter = Filter { schema: schema.map(str::to_owned), uris: Vec::new() };
    self.run(db, Action::Prune, &filter)
  }
}

fn prune_change(orphan: &InstalledTrigger) -> Change {
  Change {
    action:  Action::Prune,
    uri:     format!("{}:{}", orphan.table_display(), orphan.name),
    table:   orphan.table_display(),
    trigger: orphan.name.clone(),
    sql:     drop_sql(
      &orphan.schema,
      &orphan.table,
      &orphan.name,
      Some((&orphan.function_schema, &orphan.function)),
    ),
  }
}
