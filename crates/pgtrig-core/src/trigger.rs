//! The trigger model: a declarative description of one Postgres trigger
//! and its backing PL/pgSQL function.

use std::{collections::BTreeSet, fmt, ops::BitOr};

use serde::{Deserialize, Serialize};

use crate::{
  composer,
  condition::{Condition, RowAliases},
  error::CompileError,
};

/// Longest user-supplied trigger name; leaves room for the managed prefix
/// and hash suffix within Postgres' 63-byte identifier limit.
pub const MAX_NAME_LEN: usize = 47;

// ─── Enums ───────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum When {
  #[strum(serialize = "BEFORE")]
  Before,
  #[strum(serialize = "AFTER")]
  After,
  #[strum(serialize = "INSTEAD OF")]
  InsteadOf,
}

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Operation {
  Insert,
  Update,
  Delete,
  Truncate,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Level {
  #[default]
  Row,
  Statement,
}

/// Deferrable constraint-trigger timing.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Timing {
  Immediate,
  Deferred,
}

// ─── Operations ──────────────────────────────────────────────────────────────

/// The set of operations a trigger fires on.
///
/// `update_of` narrows `Update` to `UPDATE OF <columns>`; it is only
/// meaningful when `Update` is in the set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OperationsDef", into = "OperationsDef")]
pub struct Operations {
  ops:       BTreeSet<Operation>,
  update_of: Vec<String>,
}

impl Operations {
  /// `UPDATE OF` the given logical fields.
  pub fn update_of<I, S>(fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      ops:       BTreeSet::from([Operation::Update]),
      update_of: fields.into_iter().map(Into::into).collect(),
    }
  }

  pub fn is_empty(&self) -> bool { self.ops.is_empty() }

  pub fn len(&self) -> usize { self.ops.len() }

  /// Postgres only allows transition tables on triggers with exactly one
  /// event and no column list.
  pub fn supports_transition_tables(&self) -> bool {
    self.len() == 1
      && self.update_of.is_empty()
      && !self.contains(Operation::Truncate)
  }

  pub fn contains(&self, op: Operation) -> bool { self.ops.contains(&op) }

  pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
    self.ops.iter().copied()
  }

  pub fn update_of_fields(&self) -> &[String] { &self.update_of }

  /// `OLD` is populated only if every operation supplies it.
  pub fn has_old(&self) -> bool {
    !self.is_empty()
      && self
        .iter()
        .all(|op| matches!(op, Operation::Update | Operation::Delete))
  }

  /// `NEW` is populated only if every operation supplies it.
  pub fn has_new(&self) -> bool {
    !self.is_empty()
      && self
        .iter()
        .all(|op| matches!(op, Operation::Insert | Operation::Update))
  }

  /// Lowercase, human-readable form used in error messages raised by
  /// generated functions, e.g. `update or delete`.
  pub fn describe(&self) -> String {
    self
      .iter()
      .map(|op| op.to_string().to_lowercase())
      .collect::<Vec<_>>()
      .join(" or ")
  }
}

impl From<Operation> for Operations {
  fn from(op: Operation) -> Self {
    Self { ops: BTreeSet::from([op]), update_of: Vec::new() }
  }
}

impl<T: Into<Operations>> BitOr<T> for Operation {
  type Output = Operations;

  fn bitor(self, rhs: T) -> Operations { Operations::from(self) | rhs }
}

impl<T: Into<Operations>> BitOr<T> for Operations {
  type Output = Operations;

  fn bitor(mut self, rhs: T) -> Operations {
    let rhs = rhs.into();
    self.ops.extend(rhs.ops);
    for field in rhs.update_of {
      if !self.update_of.contains(&field) {
        self.update_of.push(field);
      }
    }
    self
  }
}

/// Operations are written either as a bare list or with an `update_of`
/// column list.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum OperationsDef {
  List(Vec<Operation>),
  Full {
    ops:       Vec<Operation>,
    #[serde(default)]
    update_of: Vec<String>,
  },
}

impl From<OperationsDef> for Operations {
  fn from(def: OperationsDef) -> Self {
    let (ops, update_of) = match def {
      OperationsDef::List(ops) => (ops, Vec::new()),
      OperationsDef::Full { ops, update_of } => (ops, update_of),
    };
    Self { ops: ops.into_iter().collect(), update_of }
  }
}

impl From<Operations> for OperationsDef {
  fn from(ops: Operations) -> Self {
    let list = ops.ops.into_iter().collect();
    if ops.update_of.is_empty() {
      OperationsDef::List(list)
    } else {
      OperationsDef::Full { ops: list, update_of: ops.update_of }
    }
  }
}

impl fmt::Display for Operations {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.describe())
  }
}

// ─── Referencing / Func ──────────────────────────────────────────────────────

/// Transition-table aliases for statement-level `AFTER` triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referencing {
  #[serde(default)]
  pub old: Option<String>,
  #[serde(default)]
  pub new: Option<String>,
}

impl Referencing {
  pub const OLD_ALIAS: &'static str = "old_values";
  pub const NEW_ALIAS: &'static str = "new_values";

  pub fn is_empty(&self) -> bool { self.old.is_none() && self.new.is_none() }

  /// Aliases derived from the single operation in `ops`. Multi-event
  /// triggers get none.
  pub fn derive(ops: &Operations) -> Option<Self> {
    if !ops.supports_transition_tables() {
      return None;
    }
    let refs = Self {
      old: ops.has_old().then(|| Self::OLD_ALIAS.to_owned()),
      new: ops.has_new().then(|| Self::NEW_ALIAS.to_owned()),
    };
    (!refs.is_empty()).then_some(refs)
  }

  pub fn aliases(&self) -> RowAliases<'_> {
    RowAliases::transition(self.old.as_deref(), self.new.as_deref())
  }
}

/// The PL/pgSQL body of a trigger function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(from = "FuncRepr")]
pub enum Func {
  /// Spliced verbatim.
  Raw(String),
  /// Expanded by the composer; see [`composer`] for placeholders.
  Template(String),
}

impl Func {
  pub fn template(body: impl Into<String>) -> Self { Func::Template(body.into()) }

  pub fn source(&self) -> &str {
    match self {
      Func::Raw(s) | Func::Template(s) => s,
    }
  }
}

impl From<&str> for Func {
  fn from(s: &str) -> Self { Func::Raw(s.to_owned()) }
}

impl From<String> for Func {
  fn from(s: String) -> Self { Func::Raw(s) }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FuncRepr {
  Plain(String),
  Tagged(TaggedFunc),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedFunc {
  Raw(String),
  Template(String),
}

impl From<FuncRepr> for Func {
  fn from(repr: FuncRepr) -> Self {
    match repr {
      FuncRepr::Plain(s) | FuncRepr::Tagged(TaggedFunc::Raw(s)) => Func::Raw(s),
      FuncRepr::Tagged(TaggedFunc::Template(s)) => Func::Template(s),
    }
  }
}

// ─── Trigger ─────────────────────────────────────────────────────────────────

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
  pub name:        String,
  pub when:        When,
  pub operations:  Operations,
  #[serde(default)]
  pub level:       Level,
  #[serde(default)]
  pub condition:   Option<Condition>,
  #[serde(default)]
  pub referencing: Option<Referencing>,
  /// `(variable, type)` pairs emitted in the function's `DECLARE` block.
  #[serde(default)]
  pub declare:     Vec<(String, String)>,
  pub func:        Func,
  #[serde(default)]
  pub timing:      Option<Timing>,
  #[serde(default = "default_true")]
  pub enabled:     bool,
}

impl Trigger {
  pub fn builder(name: impl Into<String>) -> TriggerBuilder {
    TriggerBuilder::new(name)
  }

  /// Transition tables in effect: the explicit ones, or the ones derived
  /// from `operations` for statement-level `AFTER` triggers.
  pub fn effective_referencing(&self) -> Option<Referencing> {
    match &self.referencing {
      Some(refs) => Some(refs.clone()),
      None if self.level == Level::Statement && self.when == When::After => {
        Referencing::derive(&self.operations)
      }
      None => None,
    }
  }

  /// Check every invariant that does not depend on table metadata.
  pub fn validate(&self) -> Result<(), CompileError> {
    let name = &self.name;
    if name.is_empty() {
      return Err(CompileError::MissingName);
    }
    if name.chars().count() > MAX_NAME_LEN {
      return Err(CompileError::NameTooLong {
        name: name.clone(),
        max:  MAX_NAME_LEN,
      });
    }
    if !name
      .chars()
      .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
      return Err(self.invalid(
        "name may only contain lowercase letters, digits and underscores",
      ));
    }
    if self.operations.is_empty() {
      return Err(CompileError::MissingOperation(name.clone()));
    }
    if !self.operations.update_of_fields().is_empty()
      && !self.operations.contains(Operation::Update)
    {
      return Err(self.invalid("update_of requires the update operation"));
    }

    if self.timing.is_some()
      && (self.when != When::After || self.level != Level::Row)
    {
      return Err(CompileError::InvalidTiming(name.clone()));
    }
    if self.level == Level::Row && self.operations.contains(Operation::Truncate)
    {
      return Err(self.invalid("truncate triggers must be statement-level"));
    }
    if self.when == When::InsteadOf {
      if self.level != Level::Row {
        return Err(self.invalid("INSTEAD OF triggers must be row-level"));
      }
      if self.condition.is_some() {
        return Err(self.invalid("INSTEAD OF triggers cannot have a condition"));
      }
    }

    if let Some(refs) = &self.referencing {
      if self.level == Level::Row {
        return Err(CompileError::ReferencingOnRow(name.clone()));
      }
      if self.when != When::After {
        return Err(CompileError::ReferencingNotAfter(name.clone()));
      }
      if refs.is_empty() {
        return Err(self.invalid("referencing declares no transition table"));
      }
      if !self.operations.supports_transition_tables() {
        return Err(CompileError::ReferencingMultipleEvents(name.clone()));
      }
    }

    for (var, ty) in &self.declare {
      if var.trim().is_empty() || ty.trim().is_empty() {
        return Err(self.invalid("declared variables need a name and a type"));
      }
    }

    composer::check(self)
  }

  pub(crate) fn invalid(&self, reason: &str) -> CompileError {
    CompileError::InvalidParameter {
      trigger: self.name.clone(),
      reason:  reason.to_owned(),
    }
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TriggerBuilder {
  name:        String,
  when:        Option<When>,
  operations:  Operations,
  level:       Level,
  condition:   Option<Condition>,
  referencing: Option<Referencing>,
  declare:     Vec<(String, String)>,
  func:        Option<Func>,
  timing:      Option<Timing>,
  enabled:     bool,
}

impl TriggerBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name:        name.into(),
      when:        None,
      operations:  Operations::default(),
      level:       Level::Row,
      condition:   None,
      referencing: None,
      declare:     Vec::new(),
      func:        None,
      timing:      None,
      enabled:     true,
    }
  }

  pub fn when(mut self, when: When) -> Self {
    self.when = Some(when);
    self
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

  pub fn referencing(
    mut self,
    old: Option<&str>,
    new: Option<&str>,
  ) -> Self {
    self.referencing = Some(Referencing {
      old: old.map(str::to_owned),
      new: new.map(str::to_owned),
    });
    self
  }

  pub fn declare(
    mut self,
    var: impl Into<String>,
    ty: impl Into<String>,
  ) -> Self {
    self.declare.push((var.into(), ty.into()));
    self
  }

  pub fn func(mut self, func: impl Into<Func>) -> Self {
    self.func = Some(func.into());
    self
  }

  pub fn timing(mut self, timing: Timing) -> Self {
    self.timing = Some(timing);
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  /// Normalise the name, derive transition tables and validate.
  pub fn build(self) -> Result<Trigger, CompileError> {
    let name = self.name.trim().to_lowercase();
    let when = self.when.ok_or_else(|| CompileError::InvalidParameter {
      trigger: name.clone(),
      reason:  "`when` must be set".to_owned(),
    })?;
    let func = self.func.ok_or_else(|| CompileError::InvalidParameter {
      trigger: name.clone(),
      reason:  "`func` must be set".to_owned(),
    })?;

    let mut trigger = Trigger {
      name,
      when,
      operations: self.operations,
      level: self.level,
      condition: self.condition,
      referencing: self.referencing,
      declare: self.declare,
      func,
      timing: self.timing,
      enabled: self.enabled,
    };
    trigger.validate()?;
    trigger.referencing = trigger.effective_referencing();
    Ok(trigger)
  }
}
