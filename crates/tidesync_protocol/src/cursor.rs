//! Catch-up cursors.

use crate::row::Row;
use serde::{Deserialize, Serialize};

/// A position in a table's `(updated_at ASC, id ASC)` change order.
///
/// The derived ordering compares `updated_at` first and `id` second, which
/// is exactly the strict seek predicate used for pagination:
/// `updated_at > ts OR (updated_at = ts AND id > cursor_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SeekKey {
    /// Modification time, epoch millis.
    pub updated_at: i64,
    /// Primary key used to break timestamp ties.
    pub id: String,
}

impl SeekKey {
    /// Creates a new seek key.
    pub fn new(updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            updated_at,
            id: id.into(),
        }
    }

    /// A key that sorts before every row stamped `updated_at` or later.
    pub fn before(updated_at: i64) -> Self {
        Self {
            updated_at,
            id: String::new(),
        }
    }

    /// Returns true if `row` lies strictly after this key.
    pub fn admits(&self, row: &Row) -> bool {
        row.seek_key().is_some_and(|key| key > *self)
    }
}

/// How far a client has consumed one table's history.
///
/// Persisted client-side, one per table, and sent to the server as a table
/// marker when a stream is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCursor {
    /// Table this cursor belongs to.
    pub table_name: String,
    /// Highest `updated_at` applied so far.
    pub cursor_updated_at: i64,
    /// Id of the row that set `cursor_updated_at`.
    pub cursor_id: String,
}

impl TableCursor {
    /// Creates a cursor at an explicit position.
    pub fn new(table_name: impl Into<String>, updated_at: i64, id: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            cursor_updated_at: updated_at,
            cursor_id: id.into(),
        }
    }

    /// A cursor that has seen nothing yet.
    pub fn initial(table_name: impl Into<String>) -> Self {
        Self::new(table_name, 0, "")
    }

    /// The cursor position as a seek key.
    pub fn seek_key(&self) -> SeekKey {
        SeekKey::new(self.cursor_updated_at, self.cursor_id.clone())
    }

    /// Moves the cursor to the greatest row position in `rows`.
    ///
    /// The cursor never moves backwards. Returns true if it advanced.
    pub fn advance(&mut self, rows: &[Row]) -> bool {
        let current = self.seek_key();
        match rows.iter().filter_map(Row::seek_key).max() {
            Some(max) if max > current => {
                self.cursor_updated_at = max.updated_at;
                self.cursor_id = max.id;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seek_key_breaks_ties_by_id() {
        let key = SeekKey::new(10, "b");
        assert!(!key.admits(&Row::new("a", 10)));
        assert!(!key.admits(&Row::new("b", 10)));
        assert!(key.admits(&Row::new("c", 10)));
        assert!(key.admits(&Row::new("a", 11)));
        assert!(!key.admits(&Row::new("z", 9)));
    }

    #[test]
    fn before_admits_whole_timestamp() {
        let key = SeekKey::before(10);
        assert!(key.admits(&Row::new("a", 10)));
        assert!(!key.admits(&Row::new("a", 9)));
    }

    #[test]
    fn advance_to_max_row() {
        let mut cursor = TableCursor::initial("todos");
        let rows = vec![Row::new("b", 30), Row::new("a", 50), Row::new("c", 40)];
        assert!(cursor.advance(&rows));
        assert_eq!(cursor.cursor_updated_at, 50);
        assert_eq!(cursor.cursor_id, "a");
    }

    #[test]
    fn advance_ignores_older_rows() {
        let mut cursor = TableCursor::new("todos", 100, "m");
        assert!(!cursor.advance(&[Row::new("z", 99), Row::new("a", 100)]));
        assert_eq!(cursor, TableCursor::new("todos", 100, "m"));
        assert!(!cursor.advance(&[]));
    }

    #[test]
    fn serializes_camel_case() {
        let cursor = TableCursor::new("todos", 5, "x");
        let value = serde_json::to_value(&cursor).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"tableName": "todos", "cursorUpdatedAt": 5, "cursorId": "x"})
        );
    }

    proptest! {
        #[test]
        fn cursor_is_monotonic(chunks in prop::collection::vec(
            prop::collection::vec((0i64..1_000, 0u8..20), 0..10), 1..10)
        ) {
            let mut cursor = TableCursor::initial("t");
            let mut expected_max: Option<SeekKey> = None;
            for chunk in chunks {
                let rows: Vec<Row> = chunk
                    .iter()
                    .map(|(ts, id)| Row::new(format!("{id:02}"), *ts))
                    .collect();
                let before = cursor.seek_key();
                cursor.advance(&rows);
                prop_assert!(cursor.seek_key() >= before);
                for row in &rows {
                    let key = row.seek_key().unwrap();
                    if expected_max.as_ref().map_or(true, |m| key > *m) {
                        expected_max = Some(key);
                    }
                }
            }
            if let Some(max) = expected_max {
                prop_assert_eq!(cursor.cursor_updated_at, max.updated_at);
            }
        }
    }
}
