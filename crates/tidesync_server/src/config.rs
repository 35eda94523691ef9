//! Server configuration.

use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Rows per catch-up chunk.
    pub page_size: usize,
    /// How far before the caller's cursor catch-up starts, to tolerate clock
    /// skew between writers.
    pub overlap_window: Duration,
    /// Catch-up always reaches back to the Nth most recently changed row.
    /// Zero disables this floor.
    pub recent_rows_floor: usize,
    /// Interval between live-bus heartbeats.
    pub heartbeat_interval: Duration,
    /// Events buffered per stream before the producer waits for the client.
    pub stream_buffer: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
}

impl ServerConfig {
    /// Creates a configuration with default tunables.
    pub fn new() -> Self {
        Self {
            page_size: 100,
            overlap_window: Duration::from_secs(60),
            recent_rows_floor: 20,
            heartbeat_interval: Duration::from_secs(10),
            stream_buffer: 64,
            require_auth: false,
            auth_secret: None,
        }
    }

    /// Sets the catch-up page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the clock-skew overlap window.
    pub fn with_overlap_window(mut self, window: Duration) -> Self {
        self.overlap_window = window;
        self
    }

    /// Sets how many recent rows every catch-up includes.
    pub fn with_recent_rows_floor(mut self, rows: usize) -> Self {
        self.recent_rows_floor = rows;
        self
    }

    /// Disables both overlap heuristics, making catch-up start exactly at
    /// the caller's cursor.
    pub fn without_overlap(self) -> Self {
        self.with_overlap_window(Duration::ZERO)
            .with_recent_rows_floor(0)
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the per-stream buffer size.
    pub fn with_stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size.max(1);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(!config.require_auth);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_page_size(0)
            .without_overlap()
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.page_size, 1);
        assert_eq!(config.overlap_window, Duration::ZERO);
        assert_eq!(config.recent_rows_floor, 0);
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
    }
}
