//! Rows exchanged between server and client.

use crate::cursor::SeekKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Primary key column.
pub const ID_COLUMN: &str = "id";
/// Last modification time, epoch milliseconds.
pub const UPDATED_AT_COLUMN: &str = "updated_at";
/// Soft-delete marker; a row carrying a non-null value is a tombstone.
pub const DELETED_AT_COLUMN: &str = "deleted_at";

/// A single table row.
///
/// Rows are opaque JSON objects apart from three reserved columns:
/// `id` (string primary key), `updated_at` (i64 epoch millis) and the
/// optional `deleted_at` tombstone marker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates a row with the given primary key and modification time.
    pub fn new(id: impl Into<String>, updated_at: i64) -> Self {
        let mut map = Map::new();
        map.insert(ID_COLUMN.into(), Value::String(id.into()));
        map.insert(UPDATED_AT_COLUMN.into(), Value::from(updated_at));
        Self(map)
    }

    /// Wraps an existing column map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Converts a JSON value into a row. Returns `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Sets a column and returns the row.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Sets a column in place.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Returns a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Returns the primary key.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_COLUMN).and_then(Value::as_str)
    }

    /// Returns the modification time.
    pub fn updated_at(&self) -> Option<i64> {
        self.0.get(UPDATED_AT_COLUMN).and_then(Value::as_i64)
    }

    /// Returns the soft-delete time, if any.
    pub fn deleted_at(&self) -> Option<i64> {
        self.0.get(DELETED_AT_COLUMN).and_then(Value::as_i64)
    }

    /// Returns true if this row is a soft-deleted tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.0.get(DELETED_AT_COLUMN), Some(v) if !v.is_null())
    }

    /// Position of this row in `(updated_at, id)` order.
    ///
    /// Rows without an id have no position.
    pub fn seek_key(&self) -> Option<SeekKey> {
        let id = self.id()?;
        Some(SeekKey::new(self.updated_at().unwrap_or(0), id))
    }

    /// Returns the underlying column map.
    pub fn columns(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts the row into a JSON object value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Row> for Value {
    fn from(row: Row) -> Self {
        row.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_columns() {
        let row = Row::new("a", 42).with("title", "hello");
        assert_eq!(row.id(), Some("a"));
        assert_eq!(row.updated_at(), Some(42));
        assert_eq!(row.get("title"), Some(&json!("hello")));
        assert!(!row.is_tombstone());
    }

    #[test]
    fn tombstone_detection() {
        let row = Row::new("a", 1).with(DELETED_AT_COLUMN, 5);
        assert!(row.is_tombstone());
        assert_eq!(row.deleted_at(), Some(5));

        let row = Row::new("a", 1).with(DELETED_AT_COLUMN, Value::Null);
        assert!(!row.is_tombstone());
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Row::from_value(json!([1, 2])).is_none());
        let row = Row::from_value(json!({"id": "x", "updated_at": 3})).unwrap();
        assert_eq!(row.seek_key(), Some(SeekKey::new(3, "x")));
    }

    #[test]
    fn serializes_as_plain_object() {
        let row = Row::new("a", 7);
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value, json!({"id": "a", "updated_at": 7}));
    }
}
