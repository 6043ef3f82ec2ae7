//! Ready-made triggers built on the core model.
//!
//! Every variant derives a complete [`Trigger`] from its parameters and the
//! target [`TableMeta`], validating field references as it does so.

use serde::{Deserialize, Serialize};

use crate::{
  condition::{Condition, FieldSet, Quantifier, Value},
  error::CompileError,
  sql::quote_literal,
  table::TableMeta,
  trigger::{Func, Level, Operation, Operations, Trigger, When},
};

/// Something that expands to a [`Trigger`] for a given table.
pub trait Derive {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError>;
}

fn check_fields<'a>(
  table: &TableMeta,
  fields: impl IntoIterator<Item = &'a String>,
) -> Result<(), CompileError> {
  for field in fields {
    table.column(field)?;
  }
  Ok(())
}

fn invalid(name: &str, reason: impl Into<String>) -> CompileError {
  CompileError::InvalidParameter {
    trigger: name.to_owned(),
    reason:  reason.into(),
  }
}

// ─── Change detection ────────────────────────────────────────────────────────

impl FieldSet {
  pub fn only<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    FieldSet::Only(fields.into_iter().map(Into::into).collect())
  }

  pub fn all() -> Self { FieldSet::All { exclude: Vec::new() } }

  pub fn all_except<I, S>(exclude: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    FieldSet::All { exclude: exclude.into_iter().map(Into::into).collect() }
  }
}

/// True if any of the fields changed.
pub fn any_change(fields: FieldSet) -> Condition {
  Condition::Changed { quantifier: Quantifier::Any, changed: true, fields }
}

/// True if every one of the fields changed.
pub fn all_change(fields: FieldSet) -> Condition {
  Condition::Changed { quantifier: Quantifier::All, changed: true, fields }
}

/// True if any of the fields kept its value.
pub fn any_dont_change(fields: FieldSet) -> Condition {
  Condition::Changed { quantifier: Quantifier::Any, changed: false, fields }
}

/// True if none of the fields changed.
pub fn all_dont_change(fields: FieldSet) -> Condition {
  Condition::Changed { quantifier: Quantifier::All, changed: false, fields }
}

// ─── Protect ─────────────────────────────────────────────────────────────────

fn default_protect_ops() -> Operations { Operation::Update | Operation::Delete }

fn default_before() -> When { When::Before }

fn protect_body(ops: &Operations) -> String {
  format!(
    "RAISE EXCEPTION 'pgtrig: Cannot {} rows from % table', TG_TABLE_NAME;",
    ops.describe()
  )
}

/// Raise on every matching operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protect {
  pub name:       String,
  #[serde(default = "default_protect_ops")]
  pub operations: Operations,
  #[serde(default = "default_before")]
  pub when:       When,
  #[serde(default)]
  pub level:      Level,
  #[serde(default)]
  pub condition:  Option<Condition>,
}

impl Protect {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name:       name.into(),
      operations: default_protect_ops(),
      when:       When::Before,
      level:      Level::Row,
      condition:  None,
    }
  }

  pub fn operation(mut self, ops: impl Into<Operations>) -> Self {
    self.operations = ops.into();
    self
  }

  pub fn level(mut self, level: Level) -> Self {
    self.level = level;
    self
  }

  pub fn condition(mut self, condition: Condition) -> Self {
    self.condition = Some(condition);
    self
  }
}

impl Derive for Protect {
  fn derive(&self, _table: &TableMeta) -> Result<Trigger, CompileError> {
    let mut builder = Trigger::builder(&self.name)
      .when(self.when)
      .operation(self.operations.clone())
      .level(self.level)
      .func(protect_body(&self.operations));
    if let Some(c) = &self.condition {
      builder = builder.condition(c.clone());
    }
    builder.build()
  }
}

// ─── ReadOnly ────────────────────────────────────────────────────────────────

/// Reject updates that change protected fields.
///
/// With `fields`, only those are protected; with `exclude`, everything else
/// is; with neither, any change to the row is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnly {
  pub name:    String,
  #[serde(default)]
  pub fields:  Option<Vec<String>>,
  #[serde(default)]
  pub exclude: Option<Vec<String>>,
}

impl ReadOnly {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), ..Default::default() }
  }

  pub fn fields<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields = Some(fields.into_iter().map(Into::into).collect());
    self
  }

  pub fn exclude<I, S>(mut self, exclude: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.exclude = Some(exclude.into_iter().map(Into::into).collect());
    self
  }
}

impl Derive for ReadOnly {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError> {
    let condition = match (&self.fields, &self.exclude) {
      (Some(_), Some(_)) => {
        return Err(invalid(
          &self.name,
          "`fields` and `exclude` are mutually exclusive",
        ));
      }
      (Some(fields), None) => {
        check_fields(table, fields)?;
        any_change(FieldSet::Only(fields.clone()))
      }
      (None, Some(exclude)) => {
        check_fields(table, exclude)?;
        any_change(FieldSet::All { exclude: exclude.clone() })
      }
      (None, None) => Condition::RowsDistinct { negated: false },
    };

    let ops = Operations::from(Operation::Update);
    Trigger::builder(&self.name)
      .when(When::Before)
      .operation(ops.clone())
      .condition(condition)
      .func(protect_body(&ops))
      .build()
  }
}

// ─── SoftDelete ──────────────────────────────────────────────────────────────

fn default_soft_value() -> Value { Value::Bool(false) }

/// Turn a delete into an update of `field` to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftDelete {
  pub name:      String,
  pub field:     String,
  #[serde(default = "default_soft_value")]
  pub value:     Value,
  /// Rows failing this are deleted for real.
  #[serde(default)]
  pub condition: Option<Condition>,
}

impl SoftDelete {
  pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
    Self {
      name:      name.into(),
      field:     field.into(),
      value:     default_soft_value(),
      condition: None,
    }
  }

  pub fn value(mut self, value: impl Into<Value>) -> Self {
    self.value = value.into();
    self
  }

  pub fn condition(mut self, condition: Condition) -> Self {
    self.condition = Some(condition);
    self
  }
}

impl Derive for SoftDelete {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError> {
    let column = table.quoted_column(&self.field)?;
    table.pk_columns()?;
    let body = format!(
      "UPDATE {{table}} SET {column} = {} WHERE {{pk_match}};\nRETURN NULL;",
      self.value.to_sql().replace('{', "{{").replace('}', "}}")
    );
    let mut builder = Trigger::builder(&self.name)
      .when(When::Before)
      .operation(Operation::Delete)
      .func(Func::template(body));
    if let Some(c) = &self.condition {
      builder = builder.condition(c.clone());
    }
    builder.build()
  }
}

// ─── FSM ─────────────────────────────────────────────────────────────────────

/// Restrict the values a field may move between on update.
///
/// Only listed transitions are allowed. Updates that leave the field
/// unchanged are transitions too and must be listed to be permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fsm {
  pub name:        String,
  pub field:       String,
  pub transitions: Vec<(String, String)>,
  /// Updates failing this skip the check.
  #[serde(default)]
  pub condition:   Option<Condition>,
}

impl Fsm {
  pub fn new<I, A, B>(
    name: impl Into<String>,
    field: impl Into<String>,
    transitions: I,
  ) -> Self
  where
    I: IntoIterator<Item = (A, B)>,
    A: Into<String>,
    B: Into<String>,
  {
    Self {
      name:        name.into(),
      field:       field.into(),
      transitions: transitions
        .into_iter()
        .map(|(a, b)| (a.into(), b.into()))
        .collect(),
      condition:   None,
    }
  }

  pub fn condition(mut self, condition: Condition) -> Self {
    self.condition = Some(condition);
    self
  }
}

impl Derive for Fsm {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError> {
    if self.transitions.is_empty() {
      return Err(invalid(&self.name, "at least one transition is required"));
    }
    let column = table.quoted_column(&self.field)?;
    let allowed = self
      .transitions
      .iter()
      .map(|(from, to)| format!("({}, {})", quote_literal(from), quote_literal(to)))
      .collect::<Vec<_>>()
      .join(", ");
    let body = format!(
      "IF ((OLD.{column}::text, NEW.{column}::text) IN ({allowed})) IS NOT TRUE \
       THEN\n  RAISE EXCEPTION 'pgtrig: Invalid transition of field % from % to \
       % on table %', {}, OLD.{column}, NEW.{column}, TG_TABLE_NAME;\nEND \
       IF;\nRETURN NEW;",
      quote_literal(&self.field),
    );
    let mut builder = Trigger::builder(&self.name)
      .when(When::Before)
      .operation(Operation::Update)
      .func(body);
    if let Some(c) = &self.condition {
      builder = builder.condition(c.clone());
    }
    builder.build()
  }
}

// ─── UpdateSearchVector ──────────────────────────────────────────────────────

fn default_search_config() -> String { "pg_catalog.english".to_owned() }

/// Keep a `tsvector` column in sync with a set of document fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSearchVector {
  pub name:            String,
  pub vector_field:    String,
  pub document_fields: Vec<String>,
  #[serde(default = "default_search_config")]
  pub config:          String,
}

impl UpdateSearchVector {
  pub fn new<I, S>(
    name: impl Into<String>,
    vector_field: impl Into<String>,
    document_fields: I,
  ) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      name:            name.into(),
      vector_field:    vector_field.into(),
      document_fields: document_fields.into_iter().map(Into::into).collect(),
      config:          default_search_config(),
    }
  }

  pub fn config(mut self, config: impl Into<String>) -> Self {
    self.config = config.into();
    self
  }
}

impl Derive for UpdateSearchVector {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError> {
    if self.document_fields.is_empty() {
      return Err(invalid(&self.name, "at least one document field is required"));
    }
    let vector = table.quoted_column(&self.vector_field)?;
    let document = self
      .document_fields
      .iter()
      .map(|f| Ok(format!("NEW.{}", table.quoted_column(f)?)))
      .collect::<Result<Vec<_>, CompileError>>()?
      .join(", ");
    let body = format!(
      "NEW.{vector} := to_tsvector({}::regconfig, concat_ws(' ', {document}));\nRETURN NEW;",
      quote_literal(&self.config)
    );
    Trigger::builder(&self.name)
      .when(When::Before)
      .operation(
        Operation::Insert | Operations::update_of(self.document_fields.clone()),
      )
      .func(body)
      .build()
  }
}

// ─── TriggerDef ──────────────────────────────────────────────────────────────

/// Any trigger definition, as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerDef {
  Custom(Trigger),
  Protect(Protect),
  ReadOnly(ReadOnly),
  SoftDelete(SoftDelete),
  Fsm(Fsm),
  UpdateSearchVector(UpdateSearchVector),
}

impl TriggerDef {
  pub fn name(&self) -> &str {
    match self {
      TriggerDef::Custom(t) => &t.name,
      TriggerDef::Protect(t) => &t.name,
      TriggerDef::ReadOnly(t) => &t.name,
      TriggerDef::SoftDelete(t) => &t.name,
      TriggerDef::Fsm(t) => &t.name,
      TriggerDef::UpdateSearchVector(t) => &t.name,
    }
  }
}

impl Derive for TriggerDef {
  fn derive(&self, table: &TableMeta) -> Result<Trigger, CompileError> {
    match self {
      TriggerDef::Custom(t) => {
        let mut t = t.clone();
        t.name = t.name.trim().to_lowercase();
        t.validate()?;
        t.referencing = t.effective_referencing();
        Ok(t)
      }
      TriggerDef::Protect(t) => t.derive(table),
      TriggerDef::ReadOnly(t) => t.derive(table),
      TriggerDef::SoftDelete(t) => t.derive(table),
      TriggerDef::Fsm(t) => t.derive(table),
      TriggerDef::UpdateSearchVector(t) => t.derive(table),
    }
  }
}

macro_rules! impl_into_def {
  ($($variant:ident),* $(,)?) => {
    $(
      impl From<$variant> for TriggerDef {
        fn from(t: $variant) -> Self { TriggerDef::$variant(t) }
      }
    )*
  };
}

impl_into_def!(Protect, ReadOnly, SoftDelete, Fsm, UpdateSearchVector);

impl From<Trigger> for TriggerDef {
  fn from(t: Trigger) -> Self { TriggerDef::Custom(t) }
}
