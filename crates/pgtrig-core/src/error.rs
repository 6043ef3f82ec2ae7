//! Error types for `pgtrig-core`.

use thiserror::Error;

use crate::condition::RowSide;

/// A condition references something the target table or trigger context
/// cannot provide.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
  #[error("field {field:?} does not exist on table {table}")]
  UnknownField { table: String, field: String },

  #[error("{side} row values are not available {context}")]
  UnavailableRow { side: RowSide, context: String },

  #[error("raw SQL conditions cannot be rendered against transition tables")]
  RawInStatement,

  #[error("`{0}` condition requires at least one operand")]
  EmptyCombinator(&'static str),

  #[error("no fields remain to compare after exclusions on table {0}")]
  NoFields(String),
}

/// A trigger definition violates an invariant of the trigger model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
  #[error("trigger must have a name")]
  MissingName,

  #[error("trigger name {name:?} is longer than {max} characters")]
  NameTooLong { name: String, max: usize },

  #[error("trigger identifier {0:?} exceeds 63 characters")]
  IdentifierTooLong(String),

  #[error("trigger {0} must declare at least one operation")]
  MissingOperation(String),

  #[error("deferrable trigger {0} must run AFTER and FOR EACH ROW")]
  InvalidTiming(String),

  #[error("row-level trigger {0} cannot declare transition tables")]
  ReferencingOnRow(String),

  #[error("trigger {0} declares transition tables but is not an AFTER trigger")]
  ReferencingNotAfter(String),

  #[error(
    "trigger {0} declares transition tables but fires on more than one \
     event or on a column list"
  )]
  ReferencingMultipleEvents(String),

  #[error(
    "statement-level trigger {0} has a condition but its function uses no \
     cond_* placeholder"
  )]
  ConditionOnStatement(String),

  #[error("placeholder {{{placeholder}}} in trigger {trigger} requires {requires}")]
  PlaceholderUnavailable {
    trigger:     String,
    placeholder: String,
    requires:    &'static str,
  },

  #[error("unknown placeholder {{{placeholder}}} in trigger {trigger}")]
  UnknownPlaceholder { trigger: String, placeholder: String },

  #[error("unterminated placeholder in trigger {0}")]
  UnterminatedPlaceholder(String),

  #[error("table {0} has no primary key")]
  MissingPrimaryKey(String),

  #[error("invalid parameter for trigger {trigger}: {reason}")]
  InvalidParameter { trigger: String, reason: String },

  #[error("condition error: {0}")]
  Condition(#[from] ConditionError),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Compile(#[from] CompileError),

  #[error(transparent)]
  Condition(#[from] ConditionError),

  #[error("trigger {trigger} is already registered on table {table}")]
  DuplicateTrigger { table: String, trigger: String },

  #[error("table {0} was registered again with different metadata")]
  ConflictingTable(String),

  #[error("trigger uri {0:?} must look like `schema.table:name`")]
  MalformedUri(String),

  #[error("trigger uri {0} is not registered")]
  UnknownUri(String),

  #[error("stored hash {stored} does not match recomputed hash {computed}")]
  HashMismatch { stored: String, computed: String },

  #[error("persisted trigger SQL is missing its hash marker")]
  MissingHash,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
