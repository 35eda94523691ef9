//! Row source abstraction.
//!
//! The delta provider reads table history through [`RowSource`]; the
//! physical storage engine behind it is out of scope. [`MemoryRowSource`]
//! is the in-memory reference implementation used by tests and demos.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tidesync_protocol::{Row, SeekKey, DELETED_AT_COLUMN, UPDATED_AT_COLUMN};

/// Read access to a table's change history.
///
/// Both queries include soft-deleted rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Returns the `updated_at` of the `n`th most recently changed row
    /// (1-based). A table with fewer rows answers with its oldest change;
    /// an empty table, or `n == 0`, answers `None`.
    async fn nth_latest_change(&self, table: &str, n: usize) -> ServerResult<Option<i64>>;

    /// Returns up to `limit` rows strictly after `after`, in
    /// `(updated_at ASC, id ASC)` order.
    async fn rows_after(&self, table: &str, after: &SeekKey, limit: usize)
        -> ServerResult<Vec<Row>>;
}

/// In-memory row source.
#[derive(Default)]
pub struct MemoryRowSource {
    tables: RwLock<HashMap<String, BTreeMap<String, Row>>>,
    unavailable: RwLock<HashSet<String>>,
}

impl MemoryRowSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source serving the given (empty) tables.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::new();
        {
            let mut map = source.tables.write();
            for table in tables {
                map.entry(table.into()).or_default();
            }
        }
        source
    }

    /// Inserts or replaces rows by id. Rows without an id are ignored.
    pub fn upsert(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.write();
        let entries = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.id().map(str::to_string) {
                entries.insert(id, row);
            }
        }
    }

    /// Marks a row deleted at `at`, keeping it as a tombstone.
    ///
    /// Returns the tombstone, or `None` if the row does not exist.
    pub fn soft_delete(&self, table: &str, id: &str, at: i64) -> Option<Row> {
        let mut tables = self.tables.write();
        let row = tables.get_mut(table)?.get_mut(id)?;
        row.set(DELETED_AT_COLUMN, at);
        row.set(UPDATED_AT_COLUMN, at);
        Some(row.clone())
    }

    /// Returns a row by id.
    pub fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables.read().get(table)?.get(id).cloned()
    }

    /// Number of rows in a table, tombstones included.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Makes every read of `table` fail until cleared.
    pub fn set_unavailable(&self, table: &str, unavailable: bool) {
        let mut set = self.unavailable.write();
        if unavailable {
            set.insert(table.to_string());
        } else {
            set.remove(table);
        }
    }

    fn check_available(&self, table: &str) -> ServerResult<()> {
        if self.unavailable.read().contains(table) {
            return Err(ServerError::Storage(format!("table {table} is unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn nth_latest_change(&self, table: &str, n: usize) -> ServerResult<Option<i64>> {
        self.check_available(table)?;
        if n == 0 {
            return Ok(None);
        }
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| ServerError::UnknownTable(table.to_string()))?;
        let mut stamps: Vec<i64> = rows.values().filter_map(Row::updated_at).collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        Ok(stamps.get(n - 1).or(stamps.last()).copied())
    }

    async fn rows_after(
        &self,
        table: &str,
        after: &SeekKey,
        limit: usize,
    ) -> ServerResult<Vec<Row>> {
        self.check_available(table)?;
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| ServerError::UnknownTable(table.to_string()))?;
        let mut page: Vec<(SeekKey, &Row)> = rows
            .values()
            .filter_map(|row| row.seek_key().map(|key| (key, row)))
            .filter(|(key, _)| key > after)
            .collect();
        page.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(page
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rows_after_orders_by_timestamp_then_id() {
        let source = MemoryRowSource::new();
        source.upsert(
            "t",
            vec![Row::new("b", 5), Row::new("a", 5), Row::new("c", 1)],
        );

        let rows = source.rows_after("t", &SeekKey::default(), 10).await.unwrap();
        let ids: Vec<_> = rows.iter().filter_map(Row::id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let rows = source.rows_after("t", &SeekKey::new(5, "a"), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), Some("b"));
    }

    #[tokio::test]
    async fn nth_latest_includes_tombstones() {
        let source = MemoryRowSource::new();
        source.upsert("t", (1..=5).map(|i| Row::new(format!("r{i}"), i * 10)));
        source.soft_delete("t", "r1", 60).unwrap();

        assert_eq!(source.nth_latest_change("t", 1).await.unwrap(), Some(60));
        assert_eq!(source.nth_latest_change("t", 2).await.unwrap(), Some(50));
        assert_eq!(source.nth_latest_change("t", 0).await.unwrap(), None);
        assert!(source.get("t", "r1").unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn nth_latest_on_a_short_table_is_the_oldest_change() {
        let source = MemoryRowSource::with_tables(["t", "empty"]);
        source.upsert("t", (1..=3).map(|i| Row::new(format!("r{i}"), i * 10)));

        assert_eq!(source.nth_latest_change("t", 3).await.unwrap(), Some(10));
        assert_eq!(source.nth_latest_change("t", 20).await.unwrap(), Some(10));
        assert_eq!(source.nth_latest_change("empty", 20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_and_unavailable_tables() {
        let source = MemoryRowSource::with_tables(["todos"]);
        assert!(source.rows_after("todos", &SeekKey::default(), 1).await.unwrap().is_empty());
        assert!(matches!(
            source.rows_after("notes", &SeekKey::default(), 1).await,
            Err(ServerError::UnknownTable(_))
        ));

        source.set_unavailable("todos", true);
        assert!(matches!(
            source.rows_after("todos", &SeekKey::default(), 1).await,
            Err(ServerError::Storage(_))
        ));
        source.set_unavailable("todos", false);
        assert_eq!(source.row_count("todos"), 0);
    }
}
