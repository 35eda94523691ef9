//! Protocol messages for sync.

use crate::codec::{from_cbor, to_cbor};
use crate::cursor::TableCursor;
use crate::error::ProtocolResult;
use crate::operation::Operation;
use crate::recipient::RecipientFilter;
use crate::row::Row;
use serde::{Deserialize, Serialize};

/// Opens a sync stream: one marker per table the client replicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Last applied position for each table.
    pub table_markers: Vec<TableCursor>,
}

impl SyncRequest {
    /// Creates a new sync request.
    pub fn new(table_markers: Vec<TableCursor>) -> Self {
        Self { table_markers }
    }

    /// Names of the requested tables, in request order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.table_markers.iter().map(|m| m.table_name.as_str())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// One page of a table's catch-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaChunk {
    /// Table the rows belong to.
    pub table: String,
    /// Rows in `(updated_at, id)` order, tombstones included.
    pub rows: Vec<Row>,
    /// True for the final chunk of this table's catch-up.
    pub is_last_chunk: bool,
    /// Set when the catch-up failed; the chunk then carries no rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeltaChunk {
    /// A page of rows. The page is terminal when it is not full.
    pub fn page(table: impl Into<String>, rows: Vec<Row>, page_size: usize) -> Self {
        let is_last_chunk = rows.len() < page_size;
        Self {
            table: table.into(),
            rows,
            is_last_chunk,
            error: None,
        }
    }

    /// An empty terminal chunk.
    pub fn terminal(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            is_last_chunk: true,
            error: None,
        }
    }

    /// A terminal chunk reporting a failed catch-up.
    pub fn failed(table: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            is_last_chunk: true,
            error: Some(error.into()),
        }
    }

    /// Returns true if this chunk reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A single mutation pushed to subscribers as it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChange {
    /// Table the rows belong to.
    pub table: String,
    /// What happened to the rows.
    pub operation: Operation,
    /// Affected rows (for deletes, at least their ids).
    pub rows: Vec<Row>,
    /// Who receives the event.
    #[serde(default)]
    pub recipient_filter: RecipientFilter,
}

impl LiveChange {
    /// Creates a live change event body.
    pub fn new(
        table: impl Into<String>,
        operation: Operation,
        rows: Vec<Row>,
        recipient_filter: RecipientFilter,
    ) -> Self {
        Self {
            table: table.into(),
            operation,
            rows,
            recipient_filter,
        }
    }
}

/// An event on a sync stream.
///
/// Encoded with an internal `type` tag:
/// `{"type": "delta", ...}`, `{"type": "liveChange", ...}`,
/// `{"type": "heartbeat"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeEvent {
    /// Catch-up page.
    Delta(DeltaChunk),
    /// Real-time mutation.
    LiveChange(LiveChange),
    /// Liveness signal.
    Heartbeat,
}

impl ChangeEvent {
    /// Returns the table this event concerns, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            ChangeEvent::Delta(chunk) => Some(&chunk.table),
            ChangeEvent::LiveChange(change) => Some(&change.table),
            ChangeEvent::Heartbeat => None,
        }
    }

    /// Returns the wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Delta(_) => "delta",
            ChangeEvent::LiveChange(_) => "liveChange",
            ChangeEvent::Heartbeat => "heartbeat",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
