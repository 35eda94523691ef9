//! # TideSync Protocol
//!
//! Sync protocol types and CBOR codecs for TideSync.
//!
//! This crate provides:
//! - `Row` and its reserved columns (`id`, `updated_at`, `deleted_at`)
//! - `TableCursor` and `SeekKey` for gap-free catch-up pagination
//! - `Caller` and `RecipientFilter` for scoping live events
//! - Protocol messages (`SyncRequest`, `ChangeEvent`)
//! - CBOR encoding/decoding and length-delimited framing
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod cursor;
mod error;
mod messages;
mod operation;
mod recipient;
mod row;

pub use codec::{encode_frame, from_cbor, to_cbor, FrameDecoder, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use cursor::{SeekKey, TableCursor};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ChangeEvent, DeltaChunk, LiveChange, SyncRequest};
pub use operation::Operation;
pub use recipient::{Caller, RecipientFilter};
pub use row::{Row, DELETED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN};
