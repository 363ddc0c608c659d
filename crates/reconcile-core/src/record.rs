//! Document types exchanged with a store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::classify::TargetRefRule;

/// Field map of a document.
pub type Fields = Map<String, Value>;

/// A semi-structured document with an opaque identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// Create a record with no fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Create a record from an id and a JSON object.
    ///
    /// Non-object values produce an empty field map.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a field only if it holds a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Check that a field is present and not null.
    pub fn has_field(&self, field: &str) -> bool {
        !matches!(self.fields.get(field), None | Some(Value::Null))
    }
}

/// Opaque position in a forward-only scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a collection scan.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// `None` once the collection is exhausted.
    pub next_cursor: Option<Cursor>,
}

/// A staged field update for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub collection: String,
    pub id: String,
    /// Fields merged into the document; other fields are left untouched.
    pub fields: Fields,
}

impl FieldUpdate {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, fields: Fields) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    /// Update that sets a single field.
    pub fn set(
        collection: impl Into<String>,
        id: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let mut fields = Map::new();
        fields.insert(field.into(), value.into());
        Self::new(collection, id, fields)
    }
}

/// A single predicate of a [`ProbeFilter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Field equals the given value.
    Equals { field: String, value: Value },
    /// Field holds a string that is non-empty after trimming.
    NonEmpty { field: String },
    /// Field holds a reference accepted by [`TargetRefRule`]: a string of at
    /// least `min_len` characters after trimming.
    ValidRef { field: String, min_len: usize },
}

impl Condition {
    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::Equals { field, value } => record.get(field) == Some(value),
            Condition::NonEmpty { field } => record
                .get_str(field)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
            Condition::ValidRef { field, min_len } => {
                TargetRefRule::new(*min_len).is_valid(record.get(field))
            }
        }
    }
}

/// Conjunction of conditions for a bounded (limit 1) probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeFilter {
    pub conditions: Vec<Condition>,
}

impl ProbeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Equals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn non_empty(mut self, field: impl Into<String>) -> Self {
        self.conditions.push(Condition::NonEmpty {
            field: field.into(),
        });
        self
    }

    /// Require a reference the given rule accepts.
    pub fn valid_ref(mut self, field: impl Into<String>, rule: TargetRefRule) -> Self {
        self.conditions.push(Condition::ValidRef {
            field: field.into(),
            min_len: rule.min_len,
        });
        self
    }

    /// True when every condition holds.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}
