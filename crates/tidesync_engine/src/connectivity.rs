//! Connectivity oracle.
//!
//! Tracks three layers of reachability: the OS network interface, the public
//! internet, and the application server. The server counts as reachable when
//! its health probe answers or a sync stream is open. Consumers watch the
//! derived [`ConnectivityState`] and react to transitions immediately.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A reachability check against one endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns true if the endpoint answered.
    async fn ping(&self) -> bool;
}

/// A probe with a switchable answer.
#[derive(Debug)]
pub struct StaticProbe {
    up: AtomicBool,
}

impl StaticProbe {
    /// Creates a probe answering `up`.
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
        }
    }

    /// Changes the answer.
    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn ping(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Lifecycle of the sync stream as reported by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    /// No stream.
    #[default]
    Idle,
    /// A stream is being opened.
    Connecting,
    /// A stream is open.
    Open,
}

/// Derived reachability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    /// The OS reports a usable network interface.
    pub has_network_interface: bool,
    /// The third-party internet probe answered.
    pub is_internet_reachable: bool,
    /// The server probe answered or a stream is open.
    pub is_server_reachable: bool,
    /// Current sync stream lifecycle.
    pub stream_status: StreamStatus,
}

impl ConnectivityState {
    /// Returns true if requests to the server can be attempted.
    pub fn can_reach_server(&self) -> bool {
        self.has_network_interface && self.is_server_reachable
    }
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    interface: bool,
    internet_probe: bool,
    server_probe: bool,
    stream: StreamStatus,
}

impl Signals {
    fn derive(&self) -> ConnectivityState {
        ConnectivityState {
            has_network_interface: self.interface,
            is_internet_reachable: self.interface && self.internet_probe,
            is_server_reachable: self.interface
                && (self.server_probe || self.stream == StreamStatus::Open),
            stream_status: self.stream,
        }
    }
}

/// Tri-state reachability detector.
pub struct ConnectivityOracle {
    internet: Arc<dyn HealthProbe>,
    server: Arc<dyn HealthProbe>,
    probe_interval: Duration,
    signals: Mutex<Signals>,
    state: watch::Sender<ConnectivityState>,
    reprobe: Notify,
}

impl ConnectivityOracle {
    /// Creates an oracle. Both probes count as failed until the first
    /// [`refresh`](Self::refresh).
    pub fn new(
        internet: Arc<dyn HealthProbe>,
        server: Arc<dyn HealthProbe>,
        probe_interval: Duration,
    ) -> Self {
        let signals = Signals {
            interface: true,
            internet_probe: false,
            server_probe: false,
            stream: StreamStatus::Idle,
        };
        let (state, _) = watch::channel(signals.derive());
        Self {
            internet,
            server,
            probe_interval,
            signals: Mutex::new(signals),
            state,
            reprobe: Notify::new(),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Returns true if requests to the server can be attempted.
    pub fn can_reach_server(&self) -> bool {
        self.state().can_reach_server()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Records an OS network interface change and schedules a re-probe.
    pub fn set_network_interface(&self, up: bool) {
        let changed = self.update(|signals| {
            let changed = signals.interface != up;
            signals.interface = up;
            changed
        });
        if changed {
            info!(up, "network interface changed");
            self.reprobe.notify_one();
        }
    }

    /// Records the sync stream lifecycle.
    pub fn set_stream_status(&self, status: StreamStatus) {
        self.update(|signals| {
            signals.stream = status;
            true
        });
    }

    /// Probes the internet and the server once.
    pub async fn refresh(&self) -> ConnectivityState {
        let interface = self.signals.lock().interface;
        let (internet, server) = if interface {
            futures::join!(self.internet.ping(), self.server.ping())
        } else {
            (false, false)
        };
        debug!(internet, server, "connectivity probed");
        self.update(|signals| {
            signals.internet_probe = internet;
            signals.server_probe = server;
            true
        });
        self.state()
    }

    /// Probes immediately, then on every interface transition and every
    /// probe interval, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            self.refresh().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.reprobe.notified() => {}
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
        }
        debug!("connectivity oracle stopped");
    }

    fn update(&self, f: impl FnOnce(&mut Signals) -> bool) -> bool {
        let mut signals = self.signals.lock();
        let touched = f(&mut signals);
        let next = signals.derive();
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_reach_server() != next.can_reach_server() {
                info!(reachable = next.can_reach_server(), "server reachability changed");
            }
            *current = next;
            true
        });
        touched
    }
}
