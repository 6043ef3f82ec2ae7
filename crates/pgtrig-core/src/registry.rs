//! The registry of desired triggers, grouped per database and table.
//!
//! A [`Registry`] is built once, typically at startup, and then only read.
//! Tables and triggers keep their registration order, which fixes the order
//! of every DDL statement derived from it.

use crate::{
  compiler::{CompiledTrigger, compile},
  contrib::{Derive, TriggerDef},
  error::{Error, Result},
  sql::split_qualified,
  table::{DEFAULT_SCHEMA, TableMeta},
  trigger::Trigger,
};

/// A parsed `schema.table:name` trigger URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerUri {
  pub schema:  String,
  pub table:   String,
  pub trigger: String,
}

impl TriggerUri {
  /// Parse a URI. The schema defaults to `public` when omitted.
  pub fn parse(uri: &str) -> Result<Self> {
    let malformed = || Error::MalformedUri(uri.to_owned());
    let (table, trigger) = uri.rsplit_once(':').ok_or_else(malformed)?;
    let trigger = trigger.trim().to_lowercase();
    if trigger.is_empty() || table.trim().is_empty() {
      return Err(malformed());
    }
    let (schema, table) = match split_qualified(table.trim()) {
      Some(parts) => parts,
      None if !table.contains('.') => {
        (DEFAULT_SCHEMA.to_owned(), table.trim().trim_matches('"').to_owned())
      }
      None => return Err(malformed()),
    };
    Ok(Self { schema, table, trigger })
  }
}

impl std::fmt::Display for TriggerUri {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}.{}:{}", self.schema, self.table, self.trigger)
  }
}

/// One registered trigger and its compiled form.
#[derive(Debug, Clone)]
pub struct Entry {
  pub trigger:  Trigger,
  pub compiled: CompiledTrigger,
}

/// The triggers registered on one table of one database.
#[derive(Debug, Clone)]
pub struct TableEntry {
  pub database: String,
  pub table:    TableMeta,
  entries:      Vec<Entry>,
}

impl TableEntry {
  pub fn entries(&self) -> &[Entry] { &self.entries }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
  tables: Vec<TableEntry>,
}

impl Registry {
  pub fn new() -> Self { Self::default() }

  /// Register a trigger on `table` for `database`, compiling it eagerly so
  /// that definition errors surface here rather than at install time.
  pub fn register(
    &mut self,
    database: &str,
    table: &TableMeta,
    def: impl Into<TriggerDef>,
  ) -> Result<&CompiledTrigger> {
    let trigger = def.into().derive(table)?;
    let compiled = compile(&trigger, table)?;

    let idx = match self.tables.iter().position(|t| {
      t.database == database
        && t.table.schema == table.schema
        && t.table.name == table.name
    }) {
      Some(idx) => {
        if self.tables[idx].table != *table {
          return Err(Error::ConflictingTable(table.display_name()));
        }
        idx
      }
      None => {
        self.tables.push(TableEntry {
          database: database.to_owned(),
          table:    table.clone(),
          entries:  Vec::new(),
        });
        self.tables.len() - 1
      }
    };

    let entry = &mut self.tables[idx];
    if entry.entries.iter().any(|e| e.trigger.name == trigger.name) {
      return Err(Error::DuplicateTrigger {
        table:   table.display_name(),
        trigger: trigger.name,
      });
    }
    entry.entries.push(Entry { trigger, compiled });
    let last = entry.entries.len() - 1;
    Ok(&entry.entries[last].compiled)
  }

  pub fn is_empty(&self) -> bool { self.tables.is_empty() }

  /// Every table entry, in registration order.
  pub fn tables(&self) -> impl Iterator<Item = &TableEntry> {
    self.tables.iter()
  }

  /// Database labels with at least one registered table, in first-seen
  /// order.
  pub fn databases(&self) -> Vec<&str> {
    let mut labels: Vec<&str> = Vec::new();
    for t in &self.tables {
      if !labels.contains(&t.database.as_str()) {
        labels.push(&t.database);
      }
    }
    labels
  }

  /// Compiled triggers routed to `database`, in registration order.
  pub fn compiled<'a>(
    &'a self,
    database: &str,
  ) -> impl Iterator<Item = &'a CompiledTrigger> + use<'a> {
    let database = database.to_owned();
    self
      .tables
      .iter()
      .filter(move |t| t.database == database)
      .flat_map(|t| t.entries.iter().map(|e| &e.compiled))
  }

  /// Look up a trigger by URI within one database.
  pub fn get_in(&self, database: &str, uri: &str) -> Result<&Entry> {
    let uri = TriggerUri::parse(uri)?;
    self
      .tables
      .iter()
      .filter(|t| t.database == database)
      .find_map(|t| find(t, &uri))
      .ok_or_else(|| Error::UnknownUri(uri.to_string()))
  }

  /// Look up a trigger by URI in any database.
  pub fn get(&self, uri: &str) -> Result<&Entry> {
    let uri = TriggerUri::parse(uri)?;
    self
      .tables
      .iter()
      .find_map(|t| find(t, &uri))
      .ok_or_else(|| Error::UnknownUri(uri.to_string()))
  }

  /// Canonicalise URIs, failing on any that are not registered.
  pub fn resolve<S: AsRef<str>>(&self, uris: &[S]) -> Result<Vec<String>> {
    uris
      .iter()
      .map(|uri| self.get(uri.as_ref()).map(|e| e.compiled.uri.clone()))
      .collect()
  }
}

fn find<'a>(table: &'a TableEntry, uri: &TriggerUri) -> Option<&'a Entry> {
  if table.table.schema != uri.schema || table.table.name != uri.table {
    return None;
  }
  table.entries.iter().find(|e| e.trigger.name == uri.trigger)
}
