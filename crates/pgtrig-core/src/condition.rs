//! Condition IR, a small expression tree over `OLD`/`NEW` row values that
//! renders to a SQL boolean expression.
//!
//! Conditions name logical fields; rendering resolves them to physical
//! columns through [`TableMeta`] and qualifies them with whatever alias the
//! caller supplies: `OLD`/`NEW` inside a row-level `WHEN` clause, or the
//! transition-table aliases when lowered into a statement-level function.
//!
//! Rendering is deterministic: the same tree and table always produce
//! byte-identical SQL, which the content hash depends on.

use std::ops::{BitAnd, BitOr, Not};

use serde::{Deserialize, Serialize};

use crate::{
  error::ConditionError,
  sql::{quote_ident, quote_literal},
  table::TableMeta,
};

// ─── Operands ────────────────────────────────────────────────────────────────

/// Which side of a change a field reference reads from.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RowSide {
  Old,
  New,
}

/// A logical field on the old or new row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
  pub row:   RowSide,
  pub field: String,
}

/// Reference a field on the old row.
pub fn old(field: impl Into<String>) -> FieldRef {
  FieldRef { row: RowSide::Old, field: field.into() }
}

/// Reference a field on the new row.
pub fn new(field: impl Into<String>) -> FieldRef {
  FieldRef { row: RowSide::New, field: field.into() }
}

/// A literal compared against a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Text(String),
}

impl Value {
  pub fn to_sql(&self) -> String {
    match self {
      Value::Null => "NULL".to_owned(),
      Value::Bool(true) => "TRUE".to_owned(),
      Value::Bool(false) => "FALSE".to_owned(),
      Value::Int(i) => i.to_string(),
      Value::Float(f) if f.is_nan() => "'NaN'::float8".to_owned(),
      Value::Float(f) if f.is_infinite() => {
        let sign = if f.is_sign_negative() { "-" } else { "" };
        format!("'{sign}Infinity'::float8")
      }
      Value::Float(f) => f.to_string(),
      Value::Text(s) => quote_literal(s),
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self { Value::Int(v.into()) }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self { Value::Text(v.to_owned()) }
}

impl From<String> for Value {
  fn from(v: String) -> Self { Value::Text(v) }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
  Field(FieldRef),
  Value(Value),
}

impl From<FieldRef> for Operand {
  fn from(f: FieldRef) -> Self { Operand::Field(f) }
}

macro_rules! impl_value_operand {
  ($($ty:ty),* $(,)?) => {
    $(
      impl From<$ty> for Operand {
        fn from(v: $ty) -> Self { Operand::Value(v.into()) }
      }
    )*
  };
}

impl_value_operand!(Value, bool, i64, i32, f64, &str, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  DistinctFrom,
  NotDistinctFrom,
}

impl CmpOp {
  fn as_sql(self) -> &'static str {
    match self {
      CmpOp::Eq => "=",
      CmpOp::Ne => "<>",
      CmpOp::Lt => "<",
      CmpOp::Le => "<=",
      CmpOp::Gt => ">",
      CmpOp::Ge => ">=",
      CmpOp::DistinctFrom => "IS DISTINCT FROM",
      CmpOp::NotDistinctFrom => "IS NOT DISTINCT FROM",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantifier {
  Any,
  All,
}

/// The fields a change-detection condition compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSet {
  /// Every field on the table except `exclude`.
  All { exclude: Vec<String> },
  Only(Vec<String>),
}

// ─── Condition ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
  Compare {
    lhs: FieldRef,
    cmp: CmpOp,
    rhs: Operand,
  },
  IsNull {
    field:   FieldRef,
    #[serde(default)]
    negated: bool,
  },
  /// Compare a set of fields between the old and new row.
  Changed {
    quantifier: Quantifier,
    /// `true` matches fields that differ, `false` fields that are equal.
    changed:    bool,
    fields:     FieldSet,
  },
  /// `OLD.* IS [NOT] DISTINCT FROM NEW.*`
  RowsDistinct {
    #[serde(default)]
    negated: bool,
  },
  And {
    conditions: Vec<Condition>,
  },
  Or {
    conditions: Vec<Condition>,
  },
  Not {
    condition: Box<Condition>,
  },
  /// Free-form SQL, spliced verbatim into a row-level `WHEN` clause.
  Raw {
    sql: String,
  },
}

impl FieldRef {
  fn compare(self, cmp: CmpOp, rhs: impl Into<Operand>) -> Condition {
    Condition::Compare { lhs: self, cmp, rhs: rhs.into() }
  }

  pub fn eq(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Eq, rhs)
  }

  pub fn ne(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Ne, rhs)
  }

  pub fn lt(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Lt, rhs)
  }

  pub fn le(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Le, rhs)
  }

  pub fn gt(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Gt, rhs)
  }

  pub fn ge(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::Ge, rhs)
  }

  pub fn is_distinct_from(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::DistinctFrom, rhs)
  }

  pub fn is_not_distinct_from(self, rhs: impl Into<Operand>) -> Condition {
    self.compare(CmpOp::NotDistinctFrom, rhs)
  }

  pub fn is_null(self) -> Condition {
    Condition::IsNull { field: self, negated: false }
  }

  pub fn is_not_null(self) -> Condition {
    Condition::IsNull { field: self, negated: true }
  }
}

impl Condition {
  pub fn raw(sql: impl Into<String>) -> Self { Condition::Raw { sql: sql.into() } }

  /// Conjunction of every condition yielded by `conditions`.
  pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
    Condition::And { conditions: conditions.into_iter().collect() }
  }

  /// Disjunction of every condition yielded by `conditions`.
  pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
    Condition::Or { conditions: conditions.into_iter().collect() }
  }

  /// Which row sides the condition reads. Raw SQL reports neither since its
  /// references cannot be inspected.
  pub fn sides(&self) -> (bool, bool) {
    fn operand_side(op: &Operand) -> Option<RowSide> {
      match op {
        Operand::Field(f) => Some(f.row),
        Operand::Value(_) => None,
      }
    }

    match self {
      Condition::Compare { lhs, rhs, .. } => {
        let mut old = lhs.row == RowSide::Old;
        let mut new = lhs.row == RowSide::New;
        match operand_side(rhs) {
          Some(RowSide::Old) => old = true,
          Some(RowSide::New) => new = true,
          None => {}
        }
        (old, new)
      }
      Condition::IsNull { field, .. } => {
        (field.row == RowSide::Old, field.row == RowSide::New)
      }
      Condition::Changed { .. } | Condition::RowsDistinct { .. } => (true, true),
      Condition::And { conditions } | Condition::Or { conditions } => conditions
        .iter()
        .map(Condition::sides)
        .fold((false, false), |(ao, an), (o, n)| (ao || o, an || n)),
      Condition::Not { condition } => condition.sides(),
      Condition::Raw { .. } => (false, false),
    }
  }

  /// Render to a SQL boolean expression.
  pub fn render(
    &self,
    table: &TableMeta,
    aliases: &RowAliases<'_>,
  ) -> Result<String, ConditionError> {
    match self {
      Condition::Compare { lhs, cmp, rhs } => {
        let lhs = aliases.column(table, lhs)?;
        let rhs = match rhs {
          Operand::Field(f) => aliases.column(table, f)?,
          Operand::Value(v) => v.to_sql(),
        };
        Ok(format!("{lhs} {} {rhs}", cmp.as_sql()))
      }
      Condition::IsNull { field, negated } => {
        let col = aliases.column(table, field)?;
        let not = if *negated { " NOT" } else { "" };
        Ok(format!("{col} IS{not} NULL"))
      }
      Condition::Changed { quantifier, changed, fields } => {
        render_changed(table, aliases, *quantifier, *changed, fields)
      }
      Condition::RowsDistinct { negated } => {
        let old = aliases.alias(RowSide::Old)?;
        let new = aliases.alias(RowSide::New)?;
        let not = if *negated { " NOT" } else { "" };
        Ok(format!("{old}.* IS{not} DISTINCT FROM {new}.*"))
      }
      Condition::And { conditions } => {
        render_combinator(table, aliases, conditions, "AND")
      }
      Condition::Or { conditions } => {
        render_combinator(table, aliases, conditions, "OR")
      }
      Condition::Not { condition } => {
        Ok(format!("NOT ({})", condition.render(table, aliases)?))
      }
      Condition::Raw { sql } => {
        if aliases.transition {
          Err(ConditionError::RawInStatement)
        } else {
          Ok(sql.trim().to_owned())
        }
      }
    }
  }
}

fn render_combinator(
  table: &TableMeta,
  aliases: &RowAliases<'_>,
  conditions: &[Condition],
  joiner: &'static str,
) -> Result<String, ConditionError> {
  match conditions {
    [] => Err(ConditionError::EmptyCombinator(joiner)),
    [only] => only.render(table, aliases),
    many => {
      let parts = many
        .iter()
        .map(|c| c.render(table, aliases))
        .collect::<Result<Vec<_>, _>>()?;
      Ok(format!("({})", parts.join(&format!(" {joiner} "))))
    }
  }
}

fn render_changed(
  table: &TableMeta,
  aliases: &RowAliases<'_>,
  quantifier: Quantifier,
  changed: bool,
  fields: &FieldSet,
) -> Result<String, ConditionError> {
  let names: Vec<&str> = match fields {
    FieldSet::Only(names) => names.iter().map(String::as_str).collect(),
    FieldSet::All { exclude } => {
      for field in exclude {
        table.column(field)?;
      }
      table
        .field_names()
        .filter(|name| !exclude.iter().any(|e| e == name))
        .collect()
    }
  };
  if names.is_empty() {
    return Err(ConditionError::NoFields(table.display_name()));
  }

  let cmp = if changed { CmpOp::DistinctFrom } else { CmpOp::NotDistinctFrom };
  let parts = names
    .into_iter()
    .map(|name| {
      old(name).compare(cmp, new(name)).render(table, aliases)
    })
    .collect::<Result<Vec<_>, _>>()?;

  let joiner = match quantifier {
    Quantifier::Any => " OR ",
    Quantifier::All => " AND ",
  };
  Ok(format!("({})", parts.join(joiner)))
}

// ─── Operator sugar ──────────────────────────────────────────────────────────

impl BitAnd for Condition {
  type Output = Condition;

  fn bitand(self, rhs: Condition) -> Condition {
    match self {
      Condition::And { mut conditions } => {
        conditions.push(rhs);
        Condition::And { conditions }
      }
      lhs => Condition::And { conditions: vec![lhs, rhs] },
    }
  }
}

impl BitOr for Condition {
  type Output = Condition;

  fn bitor(self, rhs: Condition) -> Condition {
    match self {
      Condition::Or { mut conditions } => {
        conditions.push(rhs);
        Condition::Or { conditions }
      }
      lhs => Condition::Or { conditions: vec![lhs, rhs] },
    }
  }
}

impl Not for Condition {
  type Output = Condition;

  fn not(self) -> Condition { Condition::Not { condition: Box::new(self) } }
}

// ─── Render context ──────────────────────────────────────────────────────────

/// How `old`/`new` references are qualified in rendered SQL.
///
/// A side set to `None` is unavailable in the current context and any
/// reference to it fails with [`ConditionError::UnavailableRow`].
#[derive(Debug, Clone, Copy)]
pub struct RowAliases<'a> {
  pub old:        Option<&'a str>,
  pub new:        Option<&'a str>,
  /// Whether the aliases name transition tables rather than row variables.
  pub transition: bool,
  /// Human-readable description of where the condition is rendered.
  pub context:    &'a str,
}

impl<'a> RowAliases<'a> {
  /// Row-level `OLD`/`NEW` with the given availability.
  pub fn row(old: bool, new: bool) -> Self {
    Self {
      old:        old.then_some("OLD"),
      new:        new.then_some("NEW"),
      transition: false,
      context:    "for this trigger's operations",
    }
  }

  /// Transition-table aliases for statement-level functions.
  pub fn transition(old: Option<&'a str>, new: Option<&'a str>) -> Self {
    Self { old, new, transition: true, context: "without a transition table" }
  }

  fn alias(&self, side: RowSide) -> Result<&'a str, ConditionError> {
    let alias = match side {
      RowSide::Old => self.old,
      RowSide::New => self.new,
    };
    alias.ok_or_else(|| ConditionError::UnavailableRow {
      side,
      context: self.context.to_owned(),
    })
  }

  fn column(
    &self,
    table: &TableMeta,
    field: &FieldRef,
  ) -> Result<String, ConditionError> {
    let alias = self.alias(field.row)?;
    let column = table.column(&field.field)?;
    Ok(format!("{alias}.{}", quote_ident(column)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn accounts() -> TableMeta {
    TableMeta::new("accounts")
      .field("id")
      .mapped_field("balance", "bal")
      .field("status")
      .primary_key(["id"])
  }

  #[test]
  fn floats_always_render_as_sql() {
    assert_eq!(Value::from(1.5).to_sql(), "1.5");
    assert_eq!(Value::from(f64::NAN).to_sql(), "'NaN'::float8");
    assert_eq!(Value::from(f64::INFINITY).to_sql(), "'Infinity'::float8");
    assert_eq!(Value::from(f64::NEG_INFINITY).to_sql(), "'-Infinity'::float8");
  }

  #[test]
  fn comparisons_resolve_columns() {
    let cond = old("balance").gt(100) & new("status").eq("closed");
    let sql = cond.render(&accounts(), &RowAliases::row(true, true)).unwrap();
    assert_eq!(sql, r#"(OLD."bal" > 100 AND NEW."status" = 'closed')"#);
  }

  #[test]
  fn field_to_field_and_negation() {
    let cond = !old("status").is_distinct_from(new("status"));
    let sql = cond.render(&accounts(), &RowAliases::row(true, true)).unwrap();
    assert_eq!(sql, r#"NOT (OLD."status" IS DISTINCT FROM NEW."status")"#);
  }

  #[test]
  fn rendering_is_deterministic() {
    let cond = old("balance").lt(0) | new("status").is_null();
    let aliases = RowAliases::row(true, true);
    let a = cond.render(&accounts(), &aliases).unwrap();
    let b = cond.clone().render(&accounts(), &aliases).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn unknown_field_fails() {
    let err = old("nope")
      .eq(1)
      .render(&accounts(), &RowAliases::row(true, true))
      .unwrap_err();
    assert!(matches!(err, ConditionError::UnknownField { field, .. } if field == "nope"));
  }

  #[test]
  fn unavailable_side_fails() {
    let err = old("status")
      .eq("open")
      .render(&accounts(), &RowAliases::row(false, true))
      .unwrap_err();
    assert!(matches!(
      err,
      ConditionError::UnavailableRow { side: RowSide::Old, .. }
    ));
  }

  #[test]
  fn changed_over_all_fields_honours_exclude() {
    let cond = Condition::Changed {
      quantifier: Quantifier::Any,
      changed:    true,
      fields:     FieldSet::All { exclude: vec!["id".into()] },
    };
    let sql = cond.render(&accounts(), &RowAliases::row(true, true)).unwrap();
    assert_eq!(
      sql,
      r#"(OLD."bal" IS DISTINCT FROM NEW."bal" OR OLD."status" IS DISTINCT FROM NEW."status")"#
    );
  }

  #[test]
  fn transition_aliases_reject_raw_sql() {
    let aliases = RowAliases::transition(Some("old_values"), Some("new_values"));
    assert_eq!(
      Condition::raw("OLD.id = 1").render(&accounts(), &aliases),
      Err(ConditionError::RawInStatement)
    );
    let sql = new("balance").ge(0).render(&accounts(), &aliases).unwrap();
    assert_eq!(sql, r#"new_values."bal" >= 0"#);
  }

  #[test]
  fn sides_are_reported() {
    assert_eq!(old("id").eq(1).sides(), (true, false));
    assert_eq!((old("id").eq(1) & new("id").eq(2)).sides(), (true, true));
    assert_eq!(Condition::raw("TRUE").sides(), (false, false));
  }

  #[test]
  fn empty_combinator_fails() {
    assert_eq!(
      Condition::all([]).render(&accounts(), &RowAliases::row(true, true)),
      Err(ConditionError::EmptyCombinator("AND"))
    );
  }
}
