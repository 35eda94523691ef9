//! Engine event broadcast.

use crate::connection::ConnectionStatus;
use crate::queue::QueueProgress;
use tokio::sync::broadcast;

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The connection manager changed state.
    StatusChanged(ConnectionStatus),
    /// A table finished its catch-up on the current connection.
    TableCaughtUp {
        /// Table name.
        table: String,
    },
    /// The mutation queue changed.
    QueueProgress(QueueProgress),
    /// A mutation exhausted its retries and was parked.
    MutationFailed {
        /// Queue entry id.
        id: String,
        /// Last error message.
        error: String,
    },
    /// A background task hit an error it recovered from.
    Error(String),
}

/// Fan-out of [`EngineEvent`]s to any number of listeners.
///
/// Slow listeners lag and skip events rather than block the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends an event to every current listener.
    pub fn emit(&self, event: EngineEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }

    /// Registers a listener.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listeners_receive_events_after_subscribing() {
        let bus = EventBus::new(8);
        bus.emit(EngineEvent::Error("nobody listening".into()));

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::StatusChanged(ConnectionStatus::Connecting));
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::StatusChanged(ConnectionStatus::Connecting)
        );
    }
}
