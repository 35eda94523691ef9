//! CLI command implementations.

pub mod backoff;
pub mod demo;
