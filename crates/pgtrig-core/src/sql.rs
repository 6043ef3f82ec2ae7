//! Quoting helpers for identifiers and literals embedded in generated DDL.
//!
//! Generated SQL is executed as a single simple-query batch, so nothing is
//! bound as a parameter; every user-supplied name and value passes through
//! one of these functions.

/// Quote an identifier unless it is already quoted.
pub fn quote_ident(ident: &str) -> String {
  if ident.len() >= 2 && ident.starts_with('"') && ident.ends_with('"') {
    return ident.to_owned();
  }
  format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
  format!("'{}'", value.replace('\'', "''"))
}

/// Quote a `schema.name` pair.
pub fn quote_qualified(schema: &str, name: &str) -> String {
  format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Split a possibly-quoted `schema.name` into its unquoted parts.
///
/// Dots inside quotes do not split.
pub fn split_qualified(qualified: &str) -> Option<(String, String)> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;
  let mut chars = qualified.chars().peekable();

  while let Some(c) = chars.next() {
    match c {
      '"' if in_quotes && chars.peek() == Some(&'"') => {
        current.push('"');
        chars.next();
      }
      '"' => in_quotes = !in_quotes,
      '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
      _ => current.push(c),
    }
  }
  parts.push(current);

  match <[String; 2]>::try_from(parts) {
    Ok([schema, name]) if !schema.is_empty() && !name.is_empty() => {
      Some((schema, name))
    }
    _ => None,
  }
}
