//! # TideSync Server
//!
//! Reference sync server for TideSync.
//!
//! This crate provides:
//! - Delta catch-up over an abstract row source (strict seek pagination)
//! - An in-memory live bus with recipient scoping and heartbeats
//! - The streaming sync endpoint composing both
//! - Authentication (HMAC-SHA256 tokens)
//!
//! # Protocol
//!
//! A client opens one long-lived stream carrying a cursor per table:
//! 1. The server pages every table's changes since its cursor as `delta` chunks
//! 2. Once every table is current, live changes and heartbeats follow
//! 3. Any failed catch-up ends the stream; the client reconnects
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust,ignore
//! use tidesync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret-32-bytes-long!".to_vec());
//! let server = SyncServer::new(config, source);
//! let token = server.issue_token(&Caller::user("u1"))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod bus;
mod config;
mod delta;
mod endpoint;
mod error;
mod server;
mod source;

pub use auth::{AuthConfig, TokenValidator};
pub use bus::{LiveBus, Subscription};
pub use config::ServerConfig;
pub use delta::{DeltaChunks, DeltaProvider};
pub use endpoint::{SyncEndpoint, SyncStream};
pub use error::{ServerError, ServerResult};
pub use server::SyncServer;
pub use source::{MemoryRowSource, RowSource};
