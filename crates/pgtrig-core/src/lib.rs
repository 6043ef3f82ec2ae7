//! Trigger definitions, compilation and the desired-state registry.
//!
//! This crate is pure: it renders SQL and hashes it but never talks to a
//! database. `pgtrig-postgres` applies what it produces.

pub mod compiler;
pub mod composer;
pub mod condition;
pub mod contrib;
pub mod error;
pub mod registry;
pub mod sql;
pub mod table;
pub mod trigger;

pub use compiler::{CompiledTrigger, compile};
pub use condition::{Condition, FieldSet, new, old};
pub use contrib::{Derive, TriggerDef};
pub use error::{CompileError, ConditionError, Error, Result};
pub use registry::{Registry, TriggerUri};
pub use table::TableMeta;
pub use trigger::{Func, Level, Operation, Operations, Timing, Trigger, When};
