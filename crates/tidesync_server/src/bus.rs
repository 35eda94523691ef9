//! In-memory live event bus.
//!
//! Fans out per-mutation change events to the subscribers whose caller
//! matches the event's recipient filter, and runs a heartbeat while at least
//! one subscriber is connected. Single-process: every server instance owns
//! an independent subscriber set.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidesync_protocol::{Caller, ChangeEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Subscriber {
    caller: Caller,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<u64, Subscriber>,
    heartbeat: Option<CancellationToken>,
}

/// Publish/subscribe broker for live change events.
pub struct LiveBus {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    heartbeat_interval: Duration,
}

impl LiveBus {
    /// Creates a bus that heartbeats every `heartbeat_interval` while it has
    /// subscribers.
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            next_id: AtomicU64::new(1),
            heartbeat_interval,
        }
    }

    /// Delivers `event` to every matching subscriber.
    ///
    /// Live changes go to subscribers matching their recipient filter;
    /// heartbeats go to everyone. Returns the number of deliveries.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let state = self.state.lock();
        let recipients: Vec<&Subscriber> = match &event {
            ChangeEvent::LiveChange(change) => state
                .subscribers
                .values()
                .filter(|s| change.recipient_filter.matches(&s.caller))
                .collect(),
            ChangeEvent::Heartbeat => state.subscribers.values().collect(),
            ChangeEvent::Delta(chunk) => {
                warn!(table = %chunk.table, "delta chunks are not published on the live bus");
                return 0;
            }
        };

        let mut delivered = 0;
        for subscriber in recipients {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(kind = event.kind(), delivered, "published live event");
        delivered
    }

    /// Registers a subscriber for `caller`.
    ///
    /// The subscription is released when it is dropped or when `cancel`
    /// fires, whichever comes first. The first subscriber starts the
    /// heartbeat. Must be called within a Tokio runtime.
    pub fn subscribe(self: &Arc<Self>, caller: Caller, cancel: CancellationToken) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let release = cancel.child_token();

        {
            let mut state = self.state.lock();
            state.subscribers.insert(id, Subscriber { caller, tx });
            if state.heartbeat.is_none() {
                state.heartbeat = Some(self.start_heartbeat());
            }
        }

        let bus = Arc::downgrade(self);
        let released = release.clone();
        tokio::spawn(async move {
            released.cancelled().await;
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        });

        Subscription {
            id,
            bus: Arc::clone(self),
            rx,
            release,
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Returns true while the heartbeat task is running.
    pub fn is_heartbeat_running(&self) -> bool {
        self.state.lock().heartbeat.is_some()
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_none() {
            return;
        }
        if state.subscribers.is_empty() {
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.cancel();
                info!("last subscriber left, heartbeat stopped");
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let bus: Weak<Self> = Arc::downgrade(self);
        let interval = self.heartbeat_interval;
        info!(?interval, "first subscriber joined, heartbeat started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => match bus.upgrade() {
                        Some(bus) => {
                            bus.publish(ChangeEvent::Heartbeat);
                        }
                        None => break,
                    },
                }
            }
        });
        token
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    id: u64,
    bus: Arc<LiveBus>,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    release: CancellationToken,
}

impl Subscription {
    /// Subscriber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the subscription is
    /// cancelled.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.release.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release.cancel();
        self.bus.unsubscribe(self.id);
    }
}
