//! One parsed log line, as a field-name to string mapping
//!
//! A `Record` is the unit of ingestion for both metric engines. It is built
//! by the file source from a single log line, handed to each engine exactly
//! once and then dropped. Engines never retain a `Record` or borrow from it
//! past the handling call.

use serde_json::Value;
use std::collections::HashMap;

/// An unordered mapping from field name to field value, representing one
/// parsed log line.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    /// Create an empty `Record`.
    pub fn new() -> Record {
        Record {
            fields: HashMap::new(),
        }
    }

    /// Insert a field into the Record, builder style.
    pub fn insert<S>(mut self, field: S, value: S) -> Record
    where
        S: Into<String>,
    {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Look a field up by name. Missing fields read as the empty string,
    /// which is the convention every predicate and projection in the engines
    /// relies on.
    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map_or("", String::as_str)
    }

    /// The number of fields carried by this Record.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the Record carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Coerce a JSON value into the string form a `Record` carries.
///
/// Numbers render as their shortest round-trip decimal, booleans as
/// `true` / `false`, null as the empty string. Nested structures keep their
/// compact JSON encoding so no information is lost to downstream regexes.
fn coerce(value: &Value) -> String {
    match *value {
        Value::String(ref s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => if b { "true".to_string() } else { "false".to_string() },
        Value::Number(ref n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Parse one log line into a `Record`.
///
/// Lines that start with `{` are treated as JSON objects and their values
/// coerced to strings. Other lines are checked for the nginx severity tags
/// `[error]` and `[crit]`, yielding a one-field Record so operators can count
/// them. Everything else -- including JSON that fails to parse -- is dropped
/// with a `None`.
pub fn parse_line(line: &str) -> Option<Record> {
    if line.starts_with('{') {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return None,
        };
        let obj = match parsed {
            Value::Object(obj) => obj,
            _ => return None,
        };
        let mut rec = Record::new();
        for (k, v) in &obj {
            rec = rec.insert(k.clone(), coerce(v));
        }
        Some(rec)
    } else if line.contains("[error]") {
        Some(Record::new().insert("error", "1"))
    } else if line.contains("[crit]") {
        Some(Record::new().insert("crit", "1"))
    } else {
        None
    }
}
