//! Compilation of a [`Trigger`] against [`TableMeta`] into install and
//! uninstall DDL plus a content hash.
//!
//! Compilation is a pure function of its inputs. The hash covers the
//! generated function and trigger SQL, so anything that changes generated
//! SQL changes the hash. The enabled flag is applied with a separate
//! `ALTER TABLE` and is not hashed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
  composer,
  condition::RowAliases,
  error::{CompileError, Error, Result},
  sql::{quote_ident, quote_literal, quote_qualified},
  table::TableMeta,
  trigger::{Level, Operation, Timing, Trigger},
};

/// Prefix of every managed trigger and function name.
pub const PREFIX: &str = "pgtrig";

/// Session-scoped table consulted by every managed trigger function.
pub const IGNORE_TABLE: &str = "_pgtrig_ignore";

/// Row in [`IGNORE_TABLE`] that suppresses every managed trigger.
pub const IGNORE_ALL: &str = "*";

/// Per-schema helper function that consults [`IGNORE_TABLE`].
pub const IGNORE_FUNCTION: &str = "_pgtrig_should_ignore";

/// Marker preceding the content hash inside a function body.
pub const HASH_MARKER: &str = "-- pgtrig:hash ";

const MAX_IDENTIFIER_LEN: usize = 63;
const DOLLAR_TAG: &str = "$pgtrig$";

// ─── Naming ──────────────────────────────────────────────────────────────────

/// `schema.table:name`
pub fn trigger_uri(table: &TableMeta, name: &str) -> String {
  format!("{}:{name}", table.display_name())
}

/// Managed identifier shared by the trigger and its function.
///
/// The suffix hashes the trigger URI so identically named triggers on
/// different tables do not collide in the schema's function namespace.
pub fn pgid(uri: &str, name: &str) -> Result<String, CompileError> {
  let digest = hex::encode(Sha256::digest(uri.as_bytes()));
  let id = format!("{PREFIX}_{name}_{}", &digest[..5]).to_lowercase();
  if id.len() > MAX_IDENTIFIER_LEN {
    return Err(CompileError::IdentifierTooLong(id));
  }
  Ok(id)
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

fn content_hash(function_sql: &str, trigger_sql: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(function_sql.as_bytes());
  hasher.update(b"\n");
  hasher.update(trigger_sql.as_bytes());
  hex::encode(hasher.finalize())
}

/// Pull the embedded content hash out of a function body.
pub fn extract_hash(source: &str) -> Option<&str> {
  source.lines().find_map(|line| {
    let hash = line.trim().strip_prefix(HASH_MARKER.trim_start())?.trim();
    (!hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()))
      .then_some(hash)
  })
}

/// Place the marker on the first line of the function body so it is part of
/// `pg_proc.prosrc`.
fn insert_hash(function_sql: &str, hash: &str) -> String {
  let open = format!("AS {DOLLAR_TAG}\n");
  match function_sql.find(&open) {
    Some(at) => {
      let (head, rest) = function_sql.split_at(at + open.len());
      format!("{head}{HASH_MARKER}{hash}\n{rest}")
    }
    None => format!("{function_sql}\n{HASH_MARKER}{hash}"),
  }
}

fn strip_hash(function_sql: &str) -> String {
  function_sql
    .split_inclusive('\n')
    .filter(|line| !line.trim_start().starts_with(HASH_MARKER.trim_start()))
    .collect()
}

// ─── CompiledTrigger ─────────────────────────────────────────────────────────

/// The immutable output of [`compile`].
///
/// Serializes to a self-contained form: [`CompiledTrigger::from_json`]
/// restores it and verifies the hash, so persisted SQL is enough to
/// recreate the trigger without the original model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTrigger {
  pub uri:          String,
  pub name:         String,
  pub pgid:         String,
  pub schema:       String,
  pub table:        String,
  /// `CREATE OR REPLACE FUNCTION`, with the hash marker embedded.
  pub function_sql: String,
  /// `DROP TRIGGER IF EXISTS` + `CREATE [CONSTRAINT] TRIGGER`.
  pub trigger_sql:  String,
  pub hash:         String,
  pub enabled:      bool,
  #[serde(default)]
  pub timing:       Option<Timing>,
}

impl CompiledTrigger {
  pub fn qualified_table(&self) -> String {
    quote_qualified(&self.schema, &self.table)
  }

  pub fn table_display(&self) -> String { format!("{}.{}", self.schema, self.table) }

  /// Everything needed to create or replace the trigger, as one batch.
  pub fn install_sql(&self) -> String {
    let mut sql = ignore_helper_sql(&self.schema);
    sql.push('\n');
    sql.push_str(&self.function_sql);
    sql.push('\n');
    sql.push_str(&self.trigger_sql);
    if !self.enabled {
      sql.push('\n');
      sql.push_str(&self.enable_sql(false));
    }
    sql
  }

  pub fn uninstall_sql(&self) -> String {
    drop_sql(&self.schema, &self.table, &self.pgid, Some((&self.schema, &self.pgid)))
  }

  pub fn enable_sql(&self, enabled: bool) -> String {
    toggle_sql(&self.schema, &self.table, &self.pgid, enabled)
  }

  /// `SET CONSTRAINTS` target for deferrable triggers.
  pub fn constraint_name(&self) -> String {
    quote_qualified(&self.schema, &self.pgid)
  }

  pub fn to_json(&self) -> Result<String> { Ok(serde_json::to_string(self)?) }

  pub fn from_json(json: &str) -> Result<Self> {
    let compiled: Self = serde_json::from_str(json)?;
    compiled.verify()?;
    Ok(compiled)
  }

  /// Recompute the hash from the stored SQL and compare it to both the
  /// stored field and the embedded marker.
  pub fn verify(&self) -> Result<()> {
    let embedded = extract_hash(&self.function_sql).ok_or(Error::MissingHash)?;
    let computed = content_hash(&strip_hash(&self.function_sql), &self.trigger_sql);
    for stored in [embedded, self.hash.as_str()] {
      if stored != computed {
        return Err(Error::HashMismatch {
          stored: stored.to_owned(),
          computed,
        });
      }
    }
    Ok(())
  }
}

/// Drop a trigger and, when known, its function.
pub fn drop_sql(
  schema: &str,
  table: &str,
  trigger: &str,
  function: Option<(&str, &str)>,
) -> String {
  let mut sql = format!(
    "DROP TRIGGER IF EXISTS {} ON {};",
    quote_ident(trigger),
    quote_qualified(schema, table)
  );
  if let Some((fn_schema, fn_name)) = function {
    sql.push_str(&format!(
      "\nDROP FUNCTION IF EXISTS {}();",
      quote_qualified(fn_schema, fn_name)
    ));
  }
  sql
}

pub fn toggle_sql(schema: &str, table: &str, trigger: &str, enabled: bool) -> String {
  format!(
    "ALTER TABLE {} {} TRIGGER {};",
    quote_qualified(schema, table),
    if enabled { "ENABLE" } else { "DISABLE" },
    quote_ident(trigger)
  )
}

/// The per-schema function every managed trigger calls first.
///
/// It tolerates a session that never created the ignore table.
pub fn ignore_helper_sql(schema: &str) -> String {
  let function = quote_qualified(schema, IGNORE_FUNCTION);
  let table = format!("pg_temp.{IGNORE_TABLE}");
  let all = quote_literal(IGNORE_ALL).replace('\'', "''");
  format!(
    "CREATE OR REPLACE FUNCTION {function}(trigger_uri TEXT)
RETURNS BOOLEAN AS {DOLLAR_TAG}
DECLARE
  _result BOOLEAN;
BEGIN
  IF to_regclass('{table}') IS NULL THEN
    RETURN FALSE;
  END IF;
  EXECUTE 'SELECT EXISTS (SELECT 1 FROM {table} WHERE uri = $1 OR uri = {all})'
    INTO _result USING trigger_uri;
  RETURN _result;
END;
{DOLLAR_TAG} LANGUAGE plpgsql;"
  )
}

// ─── Compile ─────────────────────────────────────────────────────────────────

pub fn compile(
  trigger: &Trigger,
  table: &TableMeta,
) -> Result<CompiledTrigger, CompileError> {
  trigger.validate()?;

  let uri = trigger_uri(table, &trigger.name);
  let pgid = pgid(&uri, &trigger.name)?;
  let function_name = quote_qualified(&table.schema, &pgid);

  let function_sql = function_sql(trigger, table, &uri, &function_name)?;
  let trigger_sql = trigger_sql(trigger, table, &pgid, &function_name)?;
  let hash = content_hash(&function_sql, &trigger_sql);

  Ok(CompiledTrigger {
    function_sql: insert_hash(&function_sql, &hash),
    uri,
    name: trigger.name.clone(),
    pgid,
    schema: table.schema.clone(),
    table: table.name.clone(),
    trigger_sql,
    hash,
    enabled: trigger.enabled,
    timing: trigger.timing,
  })
}

fn function_sql(
  trigger: &Trigger,
  table: &TableMeta,
  uri: &str,
  function_name: &str,
) -> Result<String, CompileError> {
  let body = composer::expand(trigger, table)?;
  let helper = quote_qualified(&table.schema, IGNORE_FUNCTION);
  let passthrough = match trigger.level {
    Level::Row => {
      "IF (TG_OP = 'DELETE') THEN\n      RETURN OLD;\n    ELSE\n      RETURN \
       NEW;\n    END IF;"
    }
    Level::Statement => "RETURN NULL;",
  };

  let mut sql =
    format!("CREATE OR REPLACE FUNCTION {function_name}()\nRETURNS TRIGGER AS {DOLLAR_TAG}\n");
  if !trigger.declare.is_empty() {
    sql.push_str("DECLARE\n");
    for (var, ty) in &trigger.declare {
      sql.push_str(&format!("  {} {};\n", var.trim(), ty.trim()));
    }
  }
  sql.push_str(&format!(
    "BEGIN\n  IF ({helper}({}) IS TRUE) THEN\n    {passthrough}\n  END IF;\n",
    quote_literal(uri)
  ));
  for line in body.trim().lines() {
    sql.push_str("  ");
    sql.push_str(line.trim_end());
    sql.push('\n');
  }
  sql.push_str(&format!("END;\n{DOLLAR_TAG} LANGUAGE plpgsql;"));
  Ok(sql)
}

fn trigger_sql(
  trigger: &Trigger,
  table: &TableMeta,
  pgid: &str,
  function_name: &str,
) -> Result<String, CompileError> {
  let qualified = table.qualified();
  let ident = quote_ident(pgid);

  let mut events = Vec::new();
  for op in trigger.operations.iter() {
    let update_of = trigger.operations.update_of_fields();
    if op == Operation::Update && !update_of.is_empty() {
      let cols = update_of
        .iter()
        .map(|f| table.quoted_column(f))
        .collect::<Result<Vec<_>, _>>()?;
      events.push(format!("UPDATE OF {}", cols.join(", ")));
    } else {
      events.push(op.to_string());
    }
  }

  let constraint = if trigger.timing.is_some() { "CONSTRAINT " } else { "" };
  let mut sql = format!(
    "DROP TRIGGER IF EXISTS {ident} ON {qualified};\nCREATE {constraint}TRIGGER \
     {ident}\n  {} {} ON {qualified}\n",
    trigger.when,
    events.join(" OR ")
  );
  if let Some(timing) = trigger.timing {
    sql.push_str(&format!("  DEFERRABLE INITIALLY {timing}\n"));
  }
  if let Some(refs) = trigger.effective_referencing() {
    sql.push_str("  REFERENCING");
    if let Some(old) = &refs.old {
      sql.push_str(&format!(" OLD TABLE AS {old}"));
    }
    if let Some(new) = &refs.new {
      sql.push_str(&format!(" NEW TABLE AS {new}"));
    }
    sql.push('\n');
  }
  sql.push_str(&format!("  FOR EACH {}\n", trigger.level));

  let native = trigger
    .condition
    .as_ref()
    .filter(|_| !composer::lowers_condition(trigger));
  if let Some(cond) = native {
    let aliases = RowAliases::row(
      trigger.operations.has_old(),
      trigger.operations.has_new(),
    );
    sql.push_str(&format!("  WHEN ({})\n", cond.render(table, &aliases)?));
  }
  sql.push_str(&format!("  EXECUTE FUNCTION {function_name}();"));
  Ok(sql)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    condition::{new, old},
    trigger::{Func, Operations, When},
  };

  fn accounts() -> TableMeta {
    TableMeta::new("accounts")
      .field("id")
      .field("balance")
      .field("status")
      .primary_key(["id"])
  }

  fn guard() -> crate::trigger::TriggerBuilder {
    Trigger::builder("guard")
      .when(When::Before)
      .operation(Operation::Update | Operation::Delete)
      .func("RAISE EXCEPTION 'no';")
  }

  #[test]
  fn pgid_is_prefixed_and_table_scoped() {
    let a = pgid("public.accounts:guard", "guard").unwrap();
    let b = pgid("public.ledger:guard", "guard").unwrap();
    assert!(a.starts_with("pgtrig_guard_"));
    assert_eq!(a.len(), "pgtrig_guard_".len() + 5);
    assert_ne!(a, b);
  }

  #[test]
  fn compilation_is_pure() {
    let t = guard().condition(old("balance").gt(0)).build().unwrap();
    let a = compile(&t, &accounts()).unwrap();
    let b = compile(&t.clone(), &accounts()).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn hash_changes_with_semantics() {
    let base = compile(&guard().build().unwrap(), &accounts()).unwrap().hash;
    let variants = [
      guard().condition(old("balance").gt(0)).build().unwrap(),
      guard().operation(Operation::Delete).build().unwrap(),
      guard().func("RAISE EXCEPTION 'other';").build().unwrap(),
      guard().declare("n", "INTEGER").build().unwrap(),
      guard()
        .when(When::After)
        .level(Level::Statement)
        .func("RETURN NULL;")
        .build()
        .unwrap(),
    ];
    for variant in variants {
      let hash = compile(&variant, &accounts()).unwrap().hash;
      assert_ne!(hash, base, "{variant:?}");
    }
  }

  #[test]
  fn enabled_flag_is_not_hashed() {
    let on = compile(&guard().build().unwrap(), &accounts()).unwrap();
    let off = compile(&guard().enabled(false).build().unwrap(), &accounts()).unwrap();
    assert_eq!(on.hash, off.hash);
    assert!(off.install_sql().ends_with(&off.enable_sql(false)));
  }

  #[test]
  fn row_condition_renders_when_clause() {
    let t = guard()
      .operation(Operation::Update)
      .condition(old("status").is_distinct_from(new("status")))
      .build()
      .unwrap();
    let c = compile(&t, &accounts()).unwrap();
    assert!(c.trigger_sql.contains(
      r#"WHEN (OLD."status" IS DISTINCT FROM NEW."status")"#
    ));
    assert!(c.trigger_sql.contains("BEFORE UPDATE ON \"public\".\"accounts\""));
    assert!(c.trigger_sql.contains("FOR EACH ROW"));
  }

  #[test]
  fn update_of_resolves_columns() {
    let table = TableMeta::new("docs")
      .field("id")
      .mapped_field("title", "title_text")
      .primary_key(["id"]);
    let t = Trigger::builder("touch")
      .when(When::Before)
      .operation(Operation::Insert | Operations::update_of(["title"]))
      .func("RETURN NEW;")
      .build()
      .unwrap();
    let c = compile(&t, &table).unwrap();
    assert!(c.trigger_sql.contains(r#"BEFORE INSERT OR UPDATE OF "title_text" ON"#));
  }

  #[test]
  fn deferrable_triggers_are_constraint_triggers() {
    let t = guard()
      .when(When::After)
      .func("RETURN NULL;")
      .timing(Timing::Deferred)
      .build()
      .unwrap();
    let c = compile(&t, &accounts()).unwrap();
    assert!(c.trigger_sql.contains("CREATE CONSTRAINT TRIGGER"));
    assert!(c.trigger_sql.contains("DEFERRABLE INITIALLY DEFERRED"));
  }

  #[test]
  fn statement_condition_is_lowered_not_rendered_as_when() {
    let t = Trigger::builder("audit")
      .when(When::After)
      .level(Level::Statement)
      .operation(Operation::Update)
      .condition(new("balance").lt(0))
      .func(Func::template(
        "IF EXISTS (SELECT 1 FROM {cond_new_values} AS n) THEN\n  RAISE EXCEPTION 'neg';\nEND IF;\nRETURN NULL;",
      ))
      .build()
      .unwrap();
    let c = compile(&t, &accounts()).unwrap();
    assert!(!c.trigger_sql.contains("WHEN ("));
    assert!(c.trigger_sql.contains(
      "REFERENCING OLD TABLE AS old_values NEW TABLE AS new_values"
    ));
    assert!(c.function_sql.contains("WHERE new_values.\"balance\" < 0"));
  }

  #[test]
  fn function_checks_ignore_helper_first() {
    let c = compile(&guard().build().unwrap(), &accounts()).unwrap();
    let begin = c.function_sql.find("BEGIN").unwrap();
    let check = c
      .function_sql
      .find("\"public\".\"_pgtrig_should_ignore\"('public.accounts:guard')")
      .unwrap();
    let body = c.function_sql.find("RAISE EXCEPTION").unwrap();
    assert!(begin < check && check < body);
  }

  #[test]
  fn embedded_hash_is_extractable() {
    let c = compile(&guard().build().unwrap(), &accounts()).unwrap();
    assert_eq!(extract_hash(&c.function_sql), Some(c.hash.as_str()));
  }

  #[test]
  fn persisted_form_round_trips_and_detects_tampering() {
    let c = compile(&guard().build().unwrap(), &accounts()).unwrap();
    let restored = CompiledTrigger::from_json(&c.to_json().unwrap()).unwrap();
    assert_eq!(restored.hash, c.hash);
    assert_eq!(restored, c);

    let mut tampered = c.clone();
    tampered.trigger_sql = tampered.trigger_sql.replace("BEFORE", "AFTER");
    let json = tampered.to_json().unwrap();
    assert!(matches!(
      CompiledTrigger::from_json(&json),
      Err(Error::HashMismatch { .. })
    ));

    let mut unmarked = c;
    unmarked.function_sql = strip_hash(&unmarked.function_sql);
    assert!(matches!(unmarked.verify(), Err(Error::MissingHash)));
  }

  #[test]
  fn uninstall_drops_trigger_and_function() {
    let c = compile(&guard().build().unwrap(), &accounts()).unwrap();
    let sql = c.uninstall_sql();
    assert!(sql.starts_with(&format!("DROP TRIGGER IF EXISTS \"{}\"", c.pgid)));
    assert!(sql.contains(&format!("DROP FUNCTION IF EXISTS \"public\".\"{}\"()", c.pgid)));
  }
}
