//! Cursor persistence.
//!
//! One row per replicated table in [`CURSOR_TABLE`], keyed by table name.

use crate::error::SyncResult;
use crate::store::{LocalStore, WriteBatch};
use serde_json::Value;
use tidesync_protocol::{Row, TableCursor};

/// Bookkeeping table holding one cursor row per replicated table.
pub const CURSOR_TABLE: &str = "_sync_cursors";

const CURSOR_UPDATED_AT: &str = "cursor_updated_at";
const CURSOR_ID: &str = "cursor_id";

/// Loads the persisted cursor of every table, defaulting to the initial
/// cursor for tables never synced.
pub fn load_cursors(store: &dyn LocalStore, tables: &[String]) -> SyncResult<Vec<TableCursor>> {
    tables
        .iter()
        .map(|table| load_cursor(store, table))
        .collect()
}

/// Loads one table's cursor.
pub fn load_cursor(store: &dyn LocalStore, table: &str) -> SyncResult<TableCursor> {
    let cursor = store
        .get_row(CURSOR_TABLE, table)?
        .and_then(|row| {
            let updated_at = row.get(CURSOR_UPDATED_AT).and_then(Value::as_i64)?;
            let id = row.get(CURSOR_ID).and_then(Value::as_str)?;
            Some(TableCursor::new(table, updated_at, id))
        })
        .unwrap_or_else(|| TableCursor::initial(table));
    Ok(cursor)
}

/// Stages `cursor` into `batch`.
pub fn stage_cursor(batch: &mut WriteBatch, cursor: &TableCursor) {
    let row = Row::new(cursor.table_name.clone(), cursor.cursor_updated_at)
        .with(CURSOR_UPDATED_AT, cursor.cursor_updated_at)
        .with(CURSOR_ID, cursor.cursor_id.clone());
    batch.put(CURSOR_TABLE, row);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn missing_cursor_is_initial() {
        let store = MemoryStore::new();
        let cursors = load_cursors(&store, &["todos".to_string()]).unwrap();
        assert_eq!(cursors, vec![TableCursor::initial("todos")]);
    }

    #[test]
    fn staged_cursor_round_trips() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        stage_cursor(&mut batch, &TableCursor::new("todos", 1_234, "row-9"));
        store.commit(batch).unwrap();

        assert_eq!(
            load_cursor(&store, "todos").unwrap(),
            TableCursor::new("todos", 1_234, "row-9")
        );
        assert_eq!(load_cursor(&store, "notes").unwrap(), TableCursor::initial("notes"));
    }
}
