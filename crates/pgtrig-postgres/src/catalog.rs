//! Introspection of managed triggers from `pg_trigger` and `pg_proc`.
//!
//! Only parent-level triggers are listed: clones that Postgres propagates to
//! partitions carry a non-zero `tgparentid` and are never inspected on their
//! own.

use pgtrig_core::compiler::extract_hash;

use crate::{Error, Result, database::InstalledTrigger};

/// `$1` is an optional schema filter.
pub const INSTALLED_TRIGGERS: &str = "
SELECT tn.nspname       AS table_schema,
       c.relname        AS table_name,
       t.tgname         AS trigger_name,
       t.tgenabled::text AS enabled,
       pn.nspname       AS function_schema,
       p.proname        AS function_name,
       p.prosrc         AS source
  FROM pg_trigger t
  JOIN pg_class c      ON c.oid  = t.tgrelid
  JOIN pg_namespace tn ON tn.oid = c.relnamespace
  JOIN pg_proc p       ON p.oid  = t.tgfoid
  JOIN pg_namespace pn ON pn.oid = p.pronamespace
 WHERE t.tgname LIKE 'pgtrig\\_%'
   AND NOT t.tgisinternal
   AND t.tgparentid = 0
   AND ($1::text IS NULL OR tn.nspname = $1::text)
 ORDER BY tn.nspname, c.relname, t.tgname
";

/// Decode one row of [`INSTALLED_TRIGGERS`].
pub fn decode(row: &postgres::Row) -> Result<InstalledTrigger> {
  let enabled: String = row.try_get("enabled")?;
  let source: String = row.try_get("source")?;
  Ok(InstalledTrigger {
    schema:          row.try_get("table_schema")?,
    table:           row.try_get("table_name")?,
    name:            row.try_get("trigger_name")?,
    enabled:         decode_enabled(&enabled)?,
    function_schema: row.try_get("function_schema")?,
    function:        row.try_get("function_name")?,
    hash:            extract_hash(&source).map(str::to_owned),
  })
}

/// `pg_trigger.tgenabled`: `O`, `R` and `A` fire, `D` does not.
fn decode_enabled(flag: &str) -> Result<bool> {
  match flag {
    "O" | "R" | "A" => Ok(true),
    "D" => Ok(false),
    other => Err(Error::Decode(format!("unknown tgenabled value {other:?}"))),
  }
}
