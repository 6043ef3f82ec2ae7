//! Table metadata supplied by whatever layer maps application models onto
//! physical tables.
//!
//! The core never discovers tables on its own. It receives a [`TableMeta`]
//! per bound table and treats it as read-only.

use serde::{Deserialize, Serialize};

use crate::{
  error::{CompileError, ConditionError},
  sql::{quote_ident, quote_qualified},
};

pub const DEFAULT_SCHEMA: &str = "public";

fn default_schema() -> String { DEFAULT_SCHEMA.to_owned() }

// ─── Field ───────────────────────────────────────────────────────────────────

/// A logical field and the physical column backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "FieldRepr")]
pub struct Field {
  pub name:   String,
  pub column: String,
}

impl Field {
  pub fn new(name: impl Into<String>) -> Self {
    let name = name.into();
    Self { column: name.clone(), name }
  }

  pub fn mapped(name: impl Into<String>, column: impl Into<String>) -> Self {
    Self { name: name.into(), column: column.into() }
  }
}

/// Config files may list a field as a bare name when the column matches.
#[derive(Deserialize)]
#[serde(untagged)]
enum FieldRepr {
  Name(String),
  Mapped { name: String, column: Option<String> },
}

impl From<FieldRepr> for Field {
  fn from(repr: FieldRepr) -> Self {
    match repr {
      FieldRepr::Name(name) => Field::new(name),
      FieldRepr::Mapped { name, column: Some(column) } => {
        Field::mapped(name, column)
      }
      FieldRepr::Mapped { name, column: None } => Field::new(name),
    }
  }
}

// ─── TableMeta ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
  #[serde(default = "default_schema")]
  pub schema:      String,
  pub name:        String,
  #[serde(default)]
  pub fields:      Vec<Field>,
  /// Logical field names making up the primary key, in key order.
  #[serde(default)]
  pub primary_key: Vec<String>,
  /// Partitioned parents own the authoritative trigger; partitions inherit
  /// clones that are never inspected individually.
  #[serde(default)]
  pub partitioned: bool,
}

impl TableMeta {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      schema:      default_schema(),
      name:        name.into(),
      fields:      Vec::new(),
      primary_key: Vec::new(),
      partitioned: false,
    }
  }

  pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
    self.schema = schema.into();
    self
  }

  pub fn field(mut self, name: impl Into<String>) -> Self {
    self.fields.push(Field::new(name));
    self
  }

  pub fn mapped_field(
    mut self,
    name: impl Into<String>,
    column: impl Into<String>,
  ) -> Self {
    self.fields.push(Field::mapped(name, column));
    self
  }

  pub fn primary_key<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.primary_key = fields.into_iter().map(Into::into).collect();
    self
  }

  pub fn partitioned(mut self, partitioned: bool) -> Self {
    self.partitioned = partitioned;
    self
  }

  /// `schema.name`, unquoted. Used in URIs and log output.
  pub fn display_name(&self) -> String {
    format!("{}.{}", self.schema, self.name)
  }

  /// `"schema"."name"`, safe to splice into DDL.
  pub fn qualified(&self) -> String { quote_qualified(&self.schema, &self.name) }

  pub fn field_names(&self) -> impl Iterator<Item = &str> {
    self.fields.iter().map(|f| f.name.as_str())
  }

  /// Resolve a logical field name to its physical column.
  pub fn column(&self, field: &str) -> Result<&str, ConditionError> {
    self
      .fields
      .iter()
      .find(|f| f.name == field)
      .map(|f| f.column.as_str())
      .ok_or_else(|| ConditionError::UnknownField {
        table: self.display_name(),
        field: field.to_owned(),
      })
  }

  /// Quoted column name for a logical field.
  pub fn quoted_column(&self, field: &str) -> Result<String, ConditionError> {
    self.column(field).map(quote_ident)
  }

  /// Physical primary-key columns, in key order.
  pub fn pk_columns(&self) -> Result<Vec<&str>, CompileError> {
    if self.primary_key.is_empty() {
      return Err(CompileError::MissingPrimaryKey(self.display_name()));
    }
    self
      .primary_key
      .iter()
      .map(|f| self.column(f).map_err(CompileError::from))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fields_resolve_to_columns() {
    let table = TableMeta::new("accounts")
      .field("id")
      .mapped_field("balance", "bal_cents");
    assert_eq!(table.column("id").unwrap(), "id");
    assert_eq!(table.column("balance").unwrap(), "bal_cents");
    assert!(matches!(
      table.column("missing"),
      Err(ConditionError::UnknownField { .. })
    ));
  }

  #[test]
  fn missing_primary_key_is_reported() {
    let table = TableMeta::new("accounts").field("id");
    assert!(matches!(
      table.pk_columns(),
      Err(CompileError::MissingPrimaryKey(_))
    ));
  }

  #[test]
  fn fields_deserialize_from_names_or_mappings() {
    let table: TableMeta = serde_json::from_str(
      r#"{"name": "accounts", "fields": ["id", {"name": "balance", "column": "bal"}],
          "primary_key": ["id"]}"#,
    )
    .unwrap();
    assert_eq!(table.schema, "public");
    assert_eq!(table.column("balance").unwrap(), "bal");
    assert_eq!(table.pk_columns().unwrap(), vec!["id"]);
  }
}
