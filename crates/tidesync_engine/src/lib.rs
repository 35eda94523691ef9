//! # TideSync Engine
//!
//! Offline-first sync client for TideSync.
//!
//! This crate provides:
//! - A durable mutation queue (optimistic writes, ordered drain, retry with
//!   backoff, crash recovery)
//! - A connection manager (one sync stream, catch-up apply, watchdog,
//!   reconnect with jittered exponential backoff)
//! - A connectivity oracle (interface, internet and server reachability)
//! - Merged reads of confirmed rows overlaid with pending mutations
//! - A transport abstraction with a scriptable mock
//!
//! ## Architecture
//!
//! Writes and reads are decoupled:
//! 1. Local writes land in the queue and are visible at once via
//!    [`SyncClient::read_merged`]
//! 2. The queue drains to the server through an [`OperationExecutor`]
//! 3. Server changes arrive on the stream and are applied to the
//!    [`LocalStore`] together with the per-table cursor
//!
//! ## Key Invariants
//!
//! - Queue entries drain in creation order
//! - An entry leaves the queue only after the server acknowledges it
//! - A cursor advances in the same batch as the rows it covers
//! - Catch-up never overwrites a newer local row
//! - Authentication failures halt retries until `reconnect()`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod client;
mod config;
mod connection;
mod connectivity;
mod cursors;
mod error;
mod events;
mod queue;
mod store;
mod transport;

pub use backoff::Backoff;
pub use client::{SyncClient, SyncClientBuilder};
pub use config::EngineConfig;
pub use connection::{ConnectionManager, ConnectionStatus};
pub use connectivity::{
    ConnectivityOracle, ConnectivityState, HealthProbe, StaticProbe, StreamStatus,
};
pub use cursors::{load_cursor, load_cursors, CURSOR_TABLE};
pub use error::{SyncError, SyncResult};
pub use events::{EngineEvent, EventBus};
pub use queue::{
    MutationQueue, OperationExecutor, PendingQueueEntry, QueueProgress, QueueStatus, QUEUE_TABLE,
};
pub use store::{LocalStore, MemoryStore, WriteBatch, WriteOp};
pub use transport::{EventStream, MockSession, MockTransport, SyncTransport};
