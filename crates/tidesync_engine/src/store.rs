//! Local row store.
//!
//! The engine keeps replicated rows, cursors and the mutation queue in one
//! [`LocalStore`]. Multi-row writes go through a [`WriteBatch`] committed
//! atomically.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tidesync_protocol::Row;

/// One staged write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a row by id.
    Put {
        /// Target table.
        table: String,
        /// Row to write.
        row: Row,
    },
    /// Remove a row by id.
    Delete {
        /// Target table.
        table: String,
        /// Primary key.
        id: String,
    },
}

/// Writes applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an upsert.
    pub fn put(&mut self, table: impl Into<String>, row: Row) {
        self.ops.push(WriteOp::Put {
            table: table.into(),
            row,
        });
    }

    /// Stages a delete.
    pub fn delete(&mut self, table: impl Into<String>, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            table: table.into(),
            id: id.into(),
        });
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage for replicated rows and engine bookkeeping.
pub trait LocalStore: Send + Sync {
    /// Returns every row of a table. Unknown tables are empty.
    fn get_all(&self, table: &str) -> SyncResult<Vec<Row>>;

    /// Returns a row by id.
    fn get_row(&self, table: &str, id: &str) -> SyncResult<Option<Row>>;

    /// Inserts or replaces a row by its id.
    fn set_row(&self, table: &str, row: Row) -> SyncResult<()>;

    /// Removes a row. Removing a missing row is not an error.
    fn del_row(&self, table: &str, id: &str) -> SyncResult<()>;

    /// Row ids ordered by `column`, ties broken by id.
    fn sorted_row_ids(&self, table: &str, column: &str, descending: bool)
        -> SyncResult<Vec<String>>;

    /// Applies every write in `batch` atomically.
    fn commit(&self, batch: WriteBatch) -> SyncResult<()>;
}

impl<'a> dyn LocalStore + 'a {
    /// Stages writes through `f` and commits them as one batch.
    ///
    /// Nothing is written if `f` fails.
    pub fn transaction<F>(&self, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut WriteBatch) -> SyncResult<()>,
    {
        let mut batch = WriteBatch::new();
        f(&mut batch)?;
        if batch.is_empty() {
            return Ok(());
        }
        self.commit(batch)
    }
}

type Tables = HashMap<String, BTreeMap<String, Row>>;

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(SyncError::Store("store is read-only".into()));
        }
        Ok(())
    }
}

fn row_id(row: &Row) -> SyncResult<String> {
    row.id()
        .map(str::to_string)
        .ok_or_else(|| SyncError::Store("row without primary key".into()))
}

/// Orders JSON values: missing and null first, then booleans, numbers,
/// strings, and everything else.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl LocalStore for MemoryStore {
    fn get_all(&self, table: &str) -> SyncResult<Vec<Row>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_row(&self, table: &str, id: &str) -> SyncResult<Option<Row>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    fn set_row(&self, table: &str, row: Row) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(table, row);
        self.commit(batch)
    }

    fn del_row(&self, table: &str, id: &str) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(table, id);
        self.commit(batch)
    }

    fn sorted_row_ids(
        &self,
        table: &str,
        column: &str,
        descending: bool,
    ) -> SyncResult<Vec<String>> {
        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &Row)> = rows.iter().collect();
        entries.sort_by(|(a_id, a), (b_id, b)| {
            compare_values(a.get(column), b.get(column)).then_with(|| a_id.cmp(b_id))
        });
        if descending {
            entries.reverse();
        }
        Ok(entries.into_iter().map(|(id, _)| id.clone()).collect())
    }

    fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        self.check_writable()?;
        // Validate before touching any table.
        let mut staged = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { table, row } => {
                    let id = row_id(&row)?;
                    staged.push((table, id, Some(row)));
                }
                WriteOp::Delete { table, id } => staged.push((table, id, None)),
            }
        }

        let mut tables = self.tables.write();
        for (table, id, row) in staged {
            match row {
                Some(row) => {
                    tables.entry(table).or_default().insert(id, row);
                }
                None => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}
