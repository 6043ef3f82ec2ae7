//! End-to-end checks against a real server.
//!
//! Set `PGTRIG_TEST_DATABASE_URL` to run them; each test works in its own
//! schema and drops it afterwards.

use pgtrig_core::{
  Func, Level, Operation, Registry, TableMeta, Trigger, When,
  contrib::{Fsm, Protect, SoftDelete},
  new, old,
};
use pgtrig_postgres::{
  Database, Error, Filter, IgnoreTarget, PgDatabase, Reconciler, State,
  TxState, enter, enter_schema,
};

fn connect() -> Option<PgDatabase> {
  let url = std::env::var("PGTRIG_TEST_DATABASE_URL").ok()?;
  Some(PgDatabase::connect("default", &url).expect("failed to connect"))
}

/// Creates `schema.accounts` and drops the schema when done.
struct Fixture {
  db:     PgDatabase,
  schema: &'static str,
}

impl Fixture {
  fn new(schema: &'static str) -> Option<Self> {
    let mut db = connect()?;
    db.batch_execute(&format!(
      "DROP SCHEMA IF EXISTS {schema} CASCADE;
CREATE SCHEMA {schema};
CREATE TABLE {schema}.accounts (
  id      INTEGER PRIMARY KEY,
  balance INTEGER NOT NULL DEFAULT 0,
  status  TEXT NOT NULL DEFAULT 'open',
  deleted BOOLEAN NOT NULL DEFAULT FALSE
);
INSERT INTO {schema}.accounts (id) VALUES (1), (2);"
    ))
    .unwrap();
    Some(Self { db, schema })
  }

  fn table(&self) -> TableMeta {
    TableMeta::new("accounts")
      .in_schema(self.schema)
      .field("id")
      .field("balance")
      .field("status")
      .field("deleted")
      .primary_key(["id"])
  }

  fn uri(&self, name: &str) -> String { format!("{}.accounts:{name}", self.schema) }

  fn sql(&self, sql: &str) -> String { sql.replace("{schema}", self.schema) }

  fn execute(&mut self, sql: &str) -> Result<u64, Error> {
    let sql = self.sql(sql);
    self.db.execute(&sql, &[])
  }

  fn count(&mut self, filter: &str) -> i64 {
    let sql = format!("SELECT count(*) FROM {}.accounts WHERE {filter}", self.schema);
    self.db.query_one(&sql, &[]).unwrap().get(0)
  }

  fn install(&mut self, registry: &Registry) -> Result<(), Error> {
    Reconciler::new(registry)
      .install(&mut self.db, &Filter::schema(self.schema))
      .map(drop)
  }
}

impl Drop for Fixture {
  fn drop(&mut self) {
    if self.db.transaction_state() != TxState::Idle {
      let _ = self.db.rollback();
    }
    let _ = self
      .db
      .batch_execute(&format!("DROP SCHEMA IF EXISTS {} CASCADE;", self.schema));
  }
}

fn server_message(err: &Error) -> &str {
  err.as_db_error().expect("expected a server error").message()
}

#[test]
fn protect_blocks_deletes_outside_ignore_scopes() {
  let Some(mut fx) = Fixture::new("pgtrig_live_protect") else { return };
  let mut registry = Registry::new();
  registry
    .register("default", &fx.table(), Protect::new("protect").operation(Operation::Delete))
    .unwrap();
  fx.install(&registry).unwrap();

  let err = fx.execute("DELETE FROM {schema}.accounts WHERE id = 1").unwrap_err();
  assert!(server_message(&err).contains("Cannot delete rows"));
  assert!(err.to_string().contains("Cannot delete rows"));

  let uri = fx.uri("protect");
  let sql = fx.sql("DELETE FROM {schema}.accounts WHERE id = 1");
  let mut scope = enter(&mut fx.db, &registry, &IgnoreTarget::uris([uri])).unwrap();
  assert_eq!(scope.execute(&sql, &[]).unwrap(), 1);
  scope.exit().unwrap();

  // Protection is back once the scope commits.
  assert!(fx.execute("DELETE FROM {schema}.accounts WHERE id = 2").is_err());
  assert_eq!(fx.count("TRUE"), 1);
}

#[test]
fn install_errors_carry_the_server_message() {
  let Some(mut fx) = Fixture::new("pgtrig_live_bad_func") else { return };
  let bad = Trigger::builder("bad")
    .when(When::Before)
    .operation(Operation::Insert)
    .func("THIS IS NOT PLPGSQL;")
    .build()
    .unwrap();
  let mut registry = Registry::new();
  registry.register("default", &fx.table(), bad).unwrap();

  let Err(Error::Reconcile { failures, .. }) = fx.install(&registry) else {
    panic!("expected the install to fail");
  };
  assert_eq!(failures.len(), 1);
  assert!(failures[0].to_string().contains("syntax error"));
  assert!(server_message(&failures[0]).contains("syntax error"));
}

#[test]
fn failed_statements_inside_a_scope_skip_cleanup() {
  let Some(mut fx) = Fixture::new("pgtrig_live_abort") else { return };
  let registry = Registry::new();

  let mut scope = enter(&mut fx.db, &registry, &IgnoreTarget::All).unwrap();
  assert!(scope.execute("SELECT 1/0", &[]).is_err());
  assert_eq!(scope.transaction_state(), TxState::Failed);
  scope.exit().unwrap();
  assert_eq!(fx.db.transaction_state(), TxState::Idle);

  // A transaction the caller opened stays open and uncommitted.
  fx.db.execute("BEGIN", &[]).unwrap();
  let scope = enter(&mut fx.db, &registry, &IgnoreTarget::All).unwrap();
  assert!(!scope.handle().unwrap().owns_transaction);
  scope.exit().unwrap();
  assert_eq!(fx.db.transaction_state(), TxState::Active);
  fx.db.execute("ROLLBACK", &[]).unwrap();
  assert_eq!(fx.count("TRUE"), 2);
}

#[test]
fn fsm_rejects_unlisted_transitions() {
  let Some(mut fx) = Fixture::new("pgtrig_live_fsm") else { return };
  let mut registry = Registry::new();
  registry
    .register(
      "default",
      &fx.table(),
      Fsm::new("status_fsm", "status", [("open", "closed")]),
    )
    .unwrap();
  fx.install(&registry).unwrap();

  fx.execute("UPDATE {schema}.accounts SET status = 'closed' WHERE id = 1").unwrap();
  let err = fx
    .execute("UPDATE {schema}.accounts SET status = 'open' WHERE id = 1")
    .unwrap_err();
  assert!(server_message(&err).contains("Invalid transition"));
  assert!(
    fx.execute("UPDATE {schema}.accounts SET status = 'open' WHERE id = 2")
      .is_err()
  );
}

#[test]
fn statement_triggers_install_with_transition_tables() {
  let Some(mut fx) = Fixture::new("pgtrig_live_statement") else { return };
  let status_guard = Trigger::builder("status_guard")
    .when(When::After)
    .level(Level::Statement)
    .operation(Operation::Update)
    .condition(old("status").is_distinct_from(new("status")))
    .func(Func::template(
      "IF EXISTS (SELECT 1 FROM {cond_joined_values}) THEN\n  RAISE EXCEPTION \
       'pgtrig: status changed';\nEND IF;\nRETURN NULL;",
    ))
    .build()
    .unwrap();
  let audit = Trigger::builder("audit")
    .when(When::After)
    .level(Level::Statement)
    .operation(Operation::Update | Operation::Delete)
    .func("RETURN NULL;")
    .build()
    .unwrap();
  assert!(audit.referencing.is_none());

  let mut registry = Registry::new();
  registry.register("default", &fx.table(), status_guard).unwrap();
  registry.register("default", &fx.table(), audit).unwrap();
  fx.install(&registry).unwrap();

  let status = Reconciler::new(&registry)
    .status(&mut fx.db, &Filter::schema(fx.schema))
    .unwrap();
  assert!(status.iter().all(|s| s.state == State::Current));

  let err = fx
    .execute("UPDATE {schema}.accounts SET status = 'closed' WHERE id = 1")
    .unwrap_err();
  assert!(server_message(&err).contains("status changed"));
  fx.execute("UPDATE {schema}.accounts SET balance = 5").unwrap();

  // Rows are matched by primary key; a row whose key changes has no
  // partner and the join comes back empty.
  fx.execute("UPDATE {schema}.accounts SET id = id + 10, status = 'closed' WHERE id = 1")
    .unwrap();
  assert_eq!(fx.count("id = 11 AND status = 'closed'"), 1);
}

#[test]
fn changed_definitions_are_outdated_until_reinstalled() {
  let Some(mut fx) = Fixture::new("pgtrig_live_outdated") else { return };
  let filter = Filter::schema(fx.schema);

  let mut v1 = Registry::new();
  v1.register("default", &fx.table(), Protect::new("protect").operation(Operation::Delete))
    .unwrap();
  fx.install(&v1).unwrap();

  let mut v2 = Registry::new();
  v2.register("default", &fx.table(), Protect::new("protect")).unwrap();
  let reconciler = Reconciler::new(&v2);

  let status = reconciler.status(&mut fx.db, &filter).unwrap();
  assert_eq!(status[0].state, State::Outdated);

  reconciler.install(&mut fx.db, &filter).unwrap();
  let status = reconciler.status(&mut fx.db, &filter).unwrap();
  assert_eq!(status[0].state, State::Current);
  assert!(fx.execute("UPDATE {schema}.accounts SET balance = 5").is_err());

  reconciler.disable(&mut fx.db, &filter).unwrap();
  assert_eq!(fx.execute("UPDATE {schema}.accounts SET balance = 5").unwrap(), 2);
  let status = reconciler.status(&mut fx.db, &filter).unwrap();
  assert_eq!(status[0].enabled, Some(false));

  reconciler.uninstall(&mut fx.db, &filter).unwrap();
  let status = reconciler.status(&mut fx.db, &filter).unwrap();
  assert_eq!(status[0].state, State::Missing);
}

#[test]
fn ignore_all_bypasses_soft_delete() {
  let Some(mut fx) = Fixture::new("pgtrig_live_soft_delete") else { return };
  let mut registry = Registry::new();
  registry
    .register(
      "default",
      &fx.table(),
      SoftDelete::new("soft_delete", "deleted").value(true),
    )
    .unwrap();
  fx.install(&registry).unwrap();

  fx.execute("DELETE FROM {schema}.accounts WHERE id = 1").unwrap();
  assert_eq!(fx.count("deleted"), 1);
  assert_eq!(fx.count("TRUE"), 2);

  let sql = fx.sql("DELETE FROM {schema}.accounts WHERE id = 2");
  let mut scope = enter(&mut fx.db, &registry, &IgnoreTarget::All).unwrap();
  scope.execute(&sql, &[]).unwrap();
  scope.exit().unwrap();

  assert_eq!(fx.count("TRUE"), 1);
}

#[test]
fn schema_scopes_resolve_unqualified_names() {
  let Some(mut fx) = Fixture::new("pgtrig_live_search_path") else { return };
  let before = fx.db.current_setting("search_path").unwrap();

  let mut scope = enter_schema(&mut fx.db, &[fx.schema]).unwrap();
  let row = scope.query_one("SELECT count(*) FROM accounts", &[]).unwrap();
  assert_eq!(row.get::<_, i64>(0), 2);
  scope.exit().unwrap();

  let after = fx.db.current_setting("search_path").unwrap();
  assert_eq!(after, before);
  assert!(!after.contains(fx.schema));
}
