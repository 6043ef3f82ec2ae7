//! Function-body templates and the statement-level composer.
//!
//! A [`Func::Template`] body may embed these placeholders:
//!
//! | Placeholder            | Expands to                                          |
//! |------------------------|-----------------------------------------------------|
//! | `{table}`              | the quoted, schema-qualified table                  |
//! | `{columns.<field>}`    | the quoted column backing a logical field           |
//! | `{pk_match}`           | primary-key equality against `OLD` (row-level)      |
//! | `{cond_old_values}`    | old transition rows matching the condition          |
//! | `{cond_new_values}`    | new transition rows matching the condition          |
//! | `{cond_joined_values}` | old and new rows joined on primary key, filtered    |
//!
//! `{{` and `}}` produce literal braces. Only placeholders that appear in the
//! template are rendered.
//!
//! When a condition reads both sides, `cond_old_values` and
//! `cond_new_values` are computed through an inner join on the primary key,
//! so rows whose key changed within the statement are left out of all three
//! `cond_*` expansions.

use crate::{
  condition::RowSide,
  error::CompileError,
  sql::quote_ident,
  table::TableMeta,
  trigger::{Func, Level, Referencing, Trigger},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
  Table,
  Column(String),
  PkMatch,
  CondOldValues,
  CondNewValues,
  CondJoinedValues,
}

impl Placeholder {
  fn parse(trigger: &Trigger, name: &str) -> Result<Self, CompileError> {
    let name = name.trim();
    Ok(match name {
      "table" => Placeholder::Table,
      "pk_match" => Placeholder::PkMatch,
      "cond_old_values" => Placeholder::CondOldValues,
      "cond_new_values" => Placeholder::CondNewValues,
      "cond_joined_values" => Placeholder::CondJoinedValues,
      _ => match name.strip_prefix("columns.") {
        Some(field) if !field.is_empty() => {
          Placeholder::Column(field.to_owned())
        }
        _ => {
          return Err(CompileError::UnknownPlaceholder {
            trigger:     trigger.name.clone(),
            placeholder: name.to_owned(),
          });
        }
      },
    })
  }

  fn name(&self) -> String {
    match self {
      Placeholder::Table => "table".to_owned(),
      Placeholder::Column(f) => format!("columns.{f}"),
      Placeholder::PkMatch => "pk_match".to_owned(),
      Placeholder::CondOldValues => "cond_old_values".to_owned(),
      Placeholder::CondNewValues => "cond_new_values".to_owned(),
      Placeholder::CondJoinedValues => "cond_joined_values".to_owned(),
    }
  }

  fn uses_condition(&self) -> bool {
    matches!(
      self,
      Placeholder::CondOldValues
        | Placeholder::CondNewValues
        | Placeholder::CondJoinedValues
    )
  }
}

#[derive(Debug)]
enum Segment {
  Text(String),
  Placeholder(Placeholder),
}

fn parse(trigger: &Trigger, template: &str) -> Result<Vec<Segment>, CompileError> {
  let mut segments = Vec::new();
  let mut text = String::new();
  let mut chars = template.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '{' if chars.peek() == Some(&'{') => {
        chars.next();
        text.push('{');
      }
      '}' if chars.peek() == Some(&'}') => {
        chars.next();
        text.push('}');
      }
      '{' => {
        let mut name = String::new();
        loop {
          match chars.next() {
            Some('}') => break,
            Some(c) => name.push(c),
            None => {
              return Err(CompileError::UnterminatedPlaceholder(
                trigger.name.clone(),
              ));
            }
          }
        }
        if !text.is_empty() {
          segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Placeholder(Placeholder::parse(trigger, &name)?));
      }
      c => text.push(c),
    }
  }
  if !text.is_empty() {
    segments.push(Segment::Text(text));
  }
  Ok(segments)
}

fn placeholders(trigger: &Trigger) -> Result<Vec<Placeholder>, CompileError> {
  match &trigger.func {
    Func::Raw(_) => Ok(Vec::new()),
    Func::Template(template) => Ok(
      parse(trigger, template)?
        .into_iter()
        .filter_map(|s| match s {
          Segment::Placeholder(p) => Some(p),
          Segment::Text(_) => None,
        })
        .collect(),
    ),
  }
}

/// Make sure every placeholder can be satisfied by the trigger's level,
/// operations and transition tables.
fn require(
  trigger: &Trigger,
  refs: Option<&Referencing>,
  placeholder: &Placeholder,
) -> Result<(), CompileError> {
  let unavailable = |requires: &'static str| CompileError::PlaceholderUnavailable {
    trigger: trigger.name.clone(),
    placeholder: placeholder.name(),
    requires,
  };
  let has_old = refs.is_some_and(|r| r.old.is_some());
  let has_new = refs.is_some_and(|r| r.new.is_some());
  let (cond_old, cond_new) = trigger
    .condition
    .as_ref()
    .map(|c| c.sides())
    .unwrap_or_default();

  match placeholder {
    Placeholder::Table | Placeholder::Column(_) => Ok(()),
    Placeholder::PkMatch => {
      if trigger.level == Level::Row && trigger.operations.has_old() {
        Ok(())
      } else {
        Err(unavailable("a row-level trigger with OLD row values"))
      }
    }
    Placeholder::CondOldValues | Placeholder::CondNewValues => {
      let needs_old =
        *placeholder == Placeholder::CondOldValues || cond_old;
      let needs_new =
        *placeholder == Placeholder::CondNewValues || cond_new;
      if needs_old && !has_old {
        Err(unavailable("an old transition table"))
      } else if needs_new && !has_new {
        Err(unavailable("a new transition table"))
      } else {
        Ok(())
      }
    }
    Placeholder::CondJoinedValues => {
      if has_old && has_new {
        Ok(())
      } else {
        Err(unavailable("both old and new transition tables"))
      }
    }
  }
}

/// Validate a trigger's template against its own configuration.
pub(crate) fn check(trigger: &Trigger) -> Result<(), CompileError> {
  let refs = trigger.effective_referencing();
  let mut uses_condition = false;
  for placeholder in placeholders(trigger)? {
    require(trigger, refs.as_ref(), &placeholder)?;
    uses_condition |= placeholder.uses_condition();
  }

  if trigger.level == Level::Statement
    && trigger.condition.is_some()
    && !uses_condition
  {
    return Err(CompileError::ConditionOnStatement(trigger.name.clone()));
  }
  Ok(())
}

/// Whether the condition is lowered into the function body rather than
/// rendered as a native `WHEN` clause.
pub(crate) fn lowers_condition(trigger: &Trigger) -> bool {
  trigger.level == Level::Statement && trigger.condition.is_some()
}

/// Expand the function body against concrete table metadata.
pub fn expand(trigger: &Trigger, table: &TableMeta) -> Result<String, CompileError> {
  let template = match &trigger.func {
    Func::Raw(body) => return Ok(body.clone()),
    Func::Template(template) => template,
  };
  let refs = trigger.effective_referencing();

  let mut out = String::with_capacity(template.len());
  for segment in parse(trigger, template)? {
    match segment {
      Segment::Text(text) => out.push_str(&text),
      Segment::Placeholder(p) => {
        require(trigger, refs.as_ref(), &p)?;
        out.push_str(&render(trigger, table, refs.as_ref(), &p)?);
      }
    }
  }
  Ok(out)
}

fn render(
  trigger: &Trigger,
  table: &TableMeta,
  refs: Option<&Referencing>,
  placeholder: &Placeholder,
) -> Result<String, CompileError> {
  match placeholder {
    Placeholder::Table => Ok(table.qualified()),
    Placeholder::Column(field) => Ok(table.quoted_column(field)?),
    Placeholder::PkMatch => Ok(
      table
        .pk_columns()?
        .into_iter()
        .map(|col| {
          let col = quote_ident(col);
          format!("{col} = OLD.{col}")
        })
        .collect::<Vec<_>>()
        .join(" AND "),
    ),
    Placeholder::CondOldValues => {
      side_values(trigger, table, refs, RowSide::Old)
    }
    Placeholder::CondNewValues => {
      side_values(trigger, table, refs, RowSide::New)
    }
    Placeholder::CondJoinedValues => {
      let refs = transition(trigger, refs)?;
      let joined = format!("({})", join(table, refs)?);
      match &trigger.condition {
        None => Ok(joined),
        Some(cond) => {
          let cond = cond.render(table, &refs.aliases())?;
          Ok(format!("{joined} WHERE {cond}"))
        }
      }
    }
  }
}

fn side_values(
  trigger: &Trigger,
  table: &TableMeta,
  refs: Option<&Referencing>,
  side: RowSide,
) -> Result<String, CompileError> {
  let refs = transition(trigger, refs)?;
  let alias = match side {
    RowSide::Old => refs.old.as_deref(),
    RowSide::New => refs.new.as_deref(),
  }
  .unwrap_or_default();

  let Some(cond) = &trigger.condition else {
    return Ok(format!("(SELECT * FROM {alias})"));
  };
  let (reads_old, reads_new) = cond.sides();
  let reads_other = match side {
    RowSide::Old => reads_new,
    RowSide::New => reads_old,
  };

  if reads_other {
    let rendered = cond.render(table, &refs.aliases())?;
    Ok(format!(
      "(SELECT {alias}.* FROM {} WHERE {rendered})",
      join(table, refs)?
    ))
  } else {
    let aliases = match side {
      RowSide::Old => Referencing { old: refs.old.clone(), new: None },
      RowSide::New => Referencing { old: None, new: refs.new.clone() },
    };
    let rendered = cond.render(table, &aliases.aliases())?;
    Ok(format!("(SELECT * FROM {alias} WHERE {rendered})"))
  }
}

fn transition<'r>(
  trigger: &Trigger,
  refs: Option<&'r Referencing>,
) -> Result<&'r Referencing, CompileError> {
  refs.ok_or_else(|| CompileError::PlaceholderUnavailable {
    trigger:     trigger.name.clone(),
    placeholder: "cond_*".to_owned(),
    requires:    "transition tables",
  })
}

/// `old JOIN new ON <pk equality>`
fn join(table: &TableMeta, refs: &Referencing) -> Result<String, CompileError> {
  let old = refs.old.as_deref().unwrap_or_default();
  let new = refs.new.as_deref().unwrap_or_default();
  let on = table
    .pk_columns()?
    .into_iter()
    .map(|col| {
      let col = quote_ident(col);
      format!("{old}.{col} = {new}.{col}")
    })
    .collect::<Vec<_>>()
    .join(" AND ");
  Ok(format!("{old} JOIN {new} ON {on}"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    condition::{Condition, new, old},
    trigger::{Operation, Operations, When},
  };

  fn accounts() -> TableMeta {
    TableMeta::new("accounts")
      .field("id")
      .field("balance")
      .field("status")
      .primary_key(["id"])
  }

  fn statement(
    ops: impl Into<Operations>,
    condition: Option<Condition>,
    body: &str,
  ) -> Result<Trigger, CompileError> {
    let mut builder = Trigger::builder("audit")
      .when(When::After)
      .level(Level::Statement)
      .operation(ops)
      .func(Func::template(body));
    if let Some(c) = condition {
      builder = builder.condition(c);
    }
    builder.build()
  }

  #[test]
  fn table_and_columns_expand() {
    let t = Trigger::builder("soft")
      .when(When::Before)
      .operation(Operation::Delete)
      .func(Func::template(
        "UPDATE {table} SET {columns.status} = 'x' WHERE {pk_match}; RETURN NULL;",
      ))
      .build()
      .unwrap();
    assert_eq!(
      expand(&t, &accounts()).unwrap(),
      r#"UPDATE "public"."accounts" SET "status" = 'x' WHERE "id" = OLD."id"; RETURN NULL;"#
    );
  }

  #[test]
  fn braces_can_be_escaped() {
    let t = statement(Operation::Insert, None, "PERFORM '{{a,b}}'::text[];")
      .unwrap();
    assert_eq!(expand(&t, &accounts()).unwrap(), "PERFORM '{a,b}'::text[];");
  }

  #[test]
  fn unknown_and_unterminated_placeholders_fail() {
    assert!(matches!(
      statement(Operation::Insert, None, "{nope}"),
      Err(CompileError::UnknownPlaceholder { .. })
    ));
    assert!(matches!(
      statement(Operation::Insert, None, "{table"),
      Err(CompileError::UnterminatedPlaceholder(_))
    ));
  }

  #[test]
  fn single_side_condition_filters_one_table() {
    let t = statement(
      Operation::Insert,
      Some(new("balance").lt(0)),
      "PERFORM 1 FROM {cond_new_values} AS n;",
    )
    .unwrap();
    assert_eq!(
      expand(&t, &accounts()).unwrap(),
      r#"PERFORM 1 FROM (SELECT * FROM new_values WHERE new_values."balance" < 0) AS n;"#
    );
  }

  #[test]
  fn two_sided_condition_joins_on_primary_key() {
    let t = statement(
      Operation::Update,
      Some(old("status").is_distinct_from(new("status"))),
      "{cond_old_values}|{cond_joined_values}",
    )
    .unwrap();
    let sql = expand(&t, &accounts()).unwrap();
    let (old_part, joined) = sql.split_once('|').unwrap();
    assert_eq!(
      old_part,
      "(SELECT old_values.* FROM old_values JOIN new_values ON \
       old_values.\"id\" = new_values.\"id\" WHERE old_values.\"status\" IS \
       DISTINCT FROM new_values.\"status\")"
    );
    // An inner join: rows whose key changed have no partner and drop out.
    assert_eq!(
      joined,
      "(old_values JOIN new_values ON old_values.\"id\" = new_values.\"id\") \
       WHERE old_values.\"status\" IS DISTINCT FROM new_values.\"status\""
    );
  }

  #[test]
  fn multi_event_triggers_reject_cond_placeholders() {
    let err = statement(
      Operation::Update | Operation::Delete,
      None,
      "PERFORM 1 FROM {cond_old_values} AS o;",
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::PlaceholderUnavailable { .. }));
  }

  #[test]
  fn statement_condition_needs_a_cond_placeholder() {
    assert_eq!(
      statement(Operation::Update, Some(new("balance").gt(0)), "RETURN NULL;"),
      Err(CompileError::ConditionOnStatement("audit".into()))
    );
  }

  #[test]
  fn pk_match_requires_old_rows() {
    let err = Trigger::builder("ins")
      .when(When::Before)
      .operation(Operation::Insert)
      .func(Func::template("PERFORM 1 WHERE {pk_match};"))
      .build()
      .unwrap_err();
    assert!(matches!(err, CompileError::PlaceholderUnavailable { .. }));
  }

  #[test]
  fn unknown_column_fails_at_expansion() {
    let t = statement(Operation::Insert, None, "{columns.missing}").unwrap();
    assert!(matches!(
      expand(&t, &accounts()),
      Err(CompileError::Condition(_))
    ));
  }
}
