//! Configuration for the sync engine.

use crate::backoff::Backoff;
use std::time::Duration;

/// Configuration for the sync client.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tables replicated from the server.
    pub tables: Vec<String>,
    /// A connection with no event for this long is aborted.
    pub heartbeat_timeout: Duration,
    /// Delay policy for reconnects and mutation retries.
    pub backoff: Backoff,
    /// Failed submissions before a mutation is parked as failed.
    pub max_retries: u32,
    /// Fallback interval between connectivity probes.
    pub probe_interval: Duration,
    /// Upper bound on how long the queue sleeps between drains.
    pub queue_poll_interval: Duration,
    /// Capacity of the engine event channel.
    pub event_capacity: usize,
}

impl EngineConfig {
    /// Creates a configuration replicating `tables`.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            heartbeat_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
            max_retries: 5,
            probe_interval: Duration::from_secs(30),
            queue_poll_interval: Duration::from_secs(15),
            event_capacity: 256,
        }
    }

    /// Sets the heartbeat watchdog timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the per-mutation retry limit.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Sets the connectivity probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the queue poll interval.
    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert!(config.tables.is_empty());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff, Backoff::default());
    }

    #[test]
    fn config_builder() {
        let config = EngineConfig::new(["todos", "notes"])
            .with_heartbeat_timeout(Duration::from_secs(5))
            .with_max_retries(0)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(80)))
            .with_event_capacity(0);

        assert_eq!(config.tables, vec!["todos", "notes"]);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff.cap, Duration::from_millis(80));
        assert_eq!(config.event_capacity, 1);
    }
}
