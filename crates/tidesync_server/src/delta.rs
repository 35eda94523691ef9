//! Delta catch-up provider.
//!
//! Answers "everything changed in table T since cursor X" as a lazy
//! sequence of chunks. Pagination is a strict seek over
//! `(updated_at ASC, id ASC)`, so pages never overlap or leave gaps, and the
//! sequence can be restarted from any older cursor without losing rows.

use crate::config::ServerConfig;
use crate::source::RowSource;
use std::sync::Arc;
use tidesync_protocol::{DeltaChunk, Row, SeekKey, TableCursor};
use tracing::{debug, warn};

/// Produces catch-up chunk sequences.
#[derive(Clone)]
pub struct DeltaProvider {
    source: Arc<dyn RowSource>,
    page_size: usize,
    overlap_window_ms: i64,
    recent_rows_floor: usize,
}

impl DeltaProvider {
    /// Creates a provider reading from `source`.
    pub fn new(source: Arc<dyn RowSource>, config: &ServerConfig) -> Self {
        Self {
            source,
            page_size: config.page_size.max(1),
            overlap_window_ms: i64::try_from(config.overlap_window.as_millis()).unwrap_or(i64::MAX),
            recent_rows_floor: config.recent_rows_floor,
        }
    }

    /// Rows per chunk.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Starts a chunk sequence for one table marker.
    pub fn chunks(&self, since: &TableCursor) -> DeltaChunks {
        DeltaChunks {
            provider: self.clone(),
            since: since.clone(),
            position: None,
            finished: false,
        }
    }
}

/// Where catch-up starts for `since`.
///
/// The floor reaches back by the overlap window and, when known, to the Nth
/// most recent change. If neither moves it, the caller's own cursor id keeps
/// breaking ties; otherwise every row stamped at the floor is included.
fn start_key(since: &TableCursor, overlap_window_ms: i64, nth_latest: Option<i64>) -> SeekKey {
    let candidate = since.cursor_updated_at.saturating_sub(overlap_window_ms);
    let floor = nth_latest.map_or(candidate, |ts| ts.min(candidate));
    if floor == since.cursor_updated_at {
        since.seek_key()
    } else {
        SeekKey::before(floor)
    }
}

/// A lazy, finite sequence of catch-up chunks for one table.
pub struct DeltaChunks {
    provider: DeltaProvider,
    since: TableCursor,
    position: Option<SeekKey>,
    finished: bool,
}

impl DeltaChunks {
    /// Table being caught up.
    pub fn table(&self) -> &str {
        &self.since.table_name
    }

    /// Returns the next chunk, or `None` once the terminal chunk was yielded.
    ///
    /// A failure yields one error chunk flagged `is_last_chunk` and ends the
    /// sequence.
    pub async fn next_chunk(&mut self) -> Option<DeltaChunk> {
        if self.finished {
            return None;
        }
        let table = self.since.table_name.clone();
        let position = match self.position.take() {
            Some(position) => position,
            None => match self.initial_position().await {
                Ok(position) => position,
                Err(message) => return Some(self.fail(table, message)),
            },
        };

        let page_size = self.provider.page_size;
        let rows = match self
            .provider
            .source
            .rows_after(&table, &position, page_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => return Some(self.fail(table, e.to_string())),
        };

        let next = match rows.last().map(Row::seek_key) {
            Some(Some(key)) => key,
            Some(None) => return Some(self.fail(table, "row without primary key".to_string())),
            None => position,
        };

        let chunk = DeltaChunk::page(table, rows, page_size);
        debug!(
            table = %chunk.table,
            rows = chunk.rows.len(),
            last = chunk.is_last_chunk,
            "delta chunk"
        );
        if chunk.is_last_chunk {
            self.finished = true;
        } else {
            self.position = Some(next);
        }
        Some(chunk)
    }

    async fn initial_position(&self) -> Result<SeekKey, String> {
        let provider = &self.provider;
        let nth_latest = if provider.recent_rows_floor > 0 {
            provider
                .source
                .nth_latest_change(&self.since.table_name, provider.recent_rows_floor)
                .await
                .map_err(|e| e.to_string())?
        } else {
            None
        };
        Ok(start_key(&self.since, provider.overlap_window_ms, nth_latest))
    }

    fn fail(&mut self, table: String, message: String) -> DeltaChunk {
        warn!(table = %table, error = %message, "delta catch-up failed");
        self.finished = true;
        DeltaChunk::failed(table, message)
    }
}
