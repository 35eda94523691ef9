//! Sync protocol endpoint.
//!
//! One call streams a full catch-up for every requested table, then the live
//! events addressed to the caller, for as long as the connection lives.

use crate::bus::{LiveBus, Subscription};
use crate::delta::{DeltaChunks, DeltaProvider};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tidesync_protocol::{Caller, ChangeEvent, SyncRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Composes the delta provider and the live bus into streaming calls.
#[derive(Clone)]
pub struct SyncEndpoint {
    delta: DeltaProvider,
    bus: Arc<LiveBus>,
    stream_buffer: usize,
}

impl SyncEndpoint {
    /// Creates an endpoint.
    pub fn new(delta: DeltaProvider, bus: Arc<LiveBus>, stream_buffer: usize) -> Self {
        Self {
            delta,
            bus,
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Opens a stream for `caller`.
    ///
    /// The live subscription is registered before catch-up starts, so events
    /// published meanwhile are held back and delivered after the last delta
    /// chunk. The stream ends early when any table's catch-up fails, and is
    /// released when `cancel` fires or the stream is dropped.
    pub fn open(
        &self,
        caller: Caller,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> SyncStream {
        let token = cancel.child_token();
        let subscription = self.bus.subscribe(caller, token.clone());
        let catch_up: Vec<DeltaChunks> = request
            .table_markers
            .iter()
            .map(|marker| self.delta.chunks(marker))
            .collect();

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(produce(catch_up, subscription, tx, token.clone()));

        SyncStream { rx, cancel: token }
    }
}

async fn produce(
    catch_up: Vec<DeltaChunks>,
    mut subscription: Subscription,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    for mut chunks in catch_up {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                chunk = chunks.next_chunk() => chunk,
            };
            let Some(chunk) = next else { break };
            let failed = chunk.is_error();
            if !forward(&tx, &cancel, ChangeEvent::Delta(chunk)).await {
                return;
            }
            if failed {
                info!(table = chunks.table(), "catch-up failed, closing stream");
                return;
            }
        }
        debug!(table = chunks.table(), "table caught up");
    }

    debug!(subscriber = subscription.id(), "catch-up complete, streaming live events");
    while let Some(event) = subscription.recv().await {
        if !forward(&tx, &cancel, event).await {
            return;
        }
    }
}

/// Sends one event; false once the stream is gone or cancelled.
async fn forward(
    tx: &mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
    event: ChangeEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Server side of one open sync stream.
///
/// Yields events until catch-up fails or the stream is cancelled. Dropping
/// it releases the live subscription without touching the parent token.
pub struct SyncStream {
    rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl SyncStream {
    /// Waits for the next event.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Closes the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the stream was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for SyncStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SyncStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::source::MemoryRowSource;
    use futures::StreamExt;
    use std::time::Duration;
    use tidesync_protocol::{LiveChange, Operation, RecipientFilter, Row, TableCursor};

    fn endpoint(source: Arc<MemoryRowSource>, page_size: usize) -> (SyncEndpoint, Arc<LiveBus>) {
        let config = ServerConfig::new()
            .without_overlap()
            .with_page_size(page_size);
        let bus = Arc::new(LiveBus::new(config.heartbeat_interval));
        let delta = DeltaProvider::new(source, &config);
        (SyncEndpoint::new(delta, Arc::clone(&bus), 8), bus)
    }

    fn live(filter: RecipientFilter) -> ChangeEvent {
        ChangeEvent::LiveChange(LiveChange::new(
            "todos",
            Operation::Update,
            vec![Row::new("x", 99)],
            filter,
        ))
    }

    async fn wait_for_no_subscribers(bus: &LiveBus) {
        for _ in 0..50 {
            if bus.subscriber_count() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn live_events_follow_catch_up() {
        let source = Arc::new(MemoryRowSource::new());
        source.upsert("todos", (0..3).map(|i| Row::new(format!("{i}"), i + 1)));
        let (endpoint, bus) = endpoint(source, 2);

        let cancel = CancellationToken::new();
        let mut stream = endpoint.open(
            Caller::user("u1"),
            SyncRequest::new(vec![TableCursor::initial("todos")]),
            &cancel,
        );
        // Published while catch-up is still pending.
        assert_eq!(bus.publish(live(RecipientFilter::broadcast())), 1);

        let kinds = (&mut stream).take(3).map(|e| e.kind()).collect::<Vec<_>>().await;
        assert_eq!(kinds, vec!["delta", "delta", "liveChange"]);
    }

    #[tokio::test]
    async fn catch_up_covers_every_table_in_order() {
        let source = Arc::new(MemoryRowSource::new());
        source.upsert("a", vec![Row::new("1", 1)]);
        source.upsert("b", vec![Row::new("2", 2)]);
        let (endpoint, _bus) = endpoint(source, 10);

        let mut stream = endpoint.open(
            Caller::anonymous(),
            SyncRequest::new(vec![TableCursor::initial("a"), TableCursor::initial("b")]),
            &CancellationToken::new(),
        );
        let first = stream.next_event().await.unwrap();
        let second = stream.next_event().await.unwrap();
        assert_eq!(first.table(), Some("a"));
        assert_eq!(second.table(), Some("b"));
    }

    #[tokio::test]
    async fn failed_catch_up_ends_the_call() {
        let source = Arc::new(MemoryRowSource::with_tables(["a", "b"]));
        source.set_unavailable("a", true);
        let (endpoint, bus) = endpoint(source, 10);

        let mut stream = endpoint.open(
            Caller::anonymous(),
            SyncRequest::new(vec![TableCursor::initial("a"), TableCursor::initial("b")]),
            &CancellationToken::new(),
        );
        match stream.next_event().await {
            Some(ChangeEvent::Delta(chunk)) => {
                assert!(chunk.is_error() && chunk.is_last_chunk);
                assert_eq!(chunk.table, "a");
            }
            other => panic!("expected an error chunk, got {other:?}"),
        }
        assert_eq!(stream.next_event().await, None);
        wait_for_no_subscribers(&bus).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn live_events_are_scoped_to_the_caller() {
        let source = Arc::new(MemoryRowSource::with_tables(["todos"]));
        let (endpoint, bus) = endpoint(source, 10);
        let cancel = CancellationToken::new();
        let request = SyncRequest::new(vec![TableCursor::initial("todos")]);

        let mut u1 = endpoint.open(Caller::user("u1"), request.clone(), &cancel);
        let mut u2 = endpoint.open(Caller::user("u2"), request, &cancel);
        // Terminal catch-up chunks.
        assert_eq!(u1.next_event().await.map(|e| e.kind()), Some("delta"));
        assert_eq!(u2.next_event().await.map(|e| e.kind()), Some("delta"));

        bus.publish(live(RecipientFilter::user("u1")));
        bus.publish(live(RecipientFilter::broadcast()));

        assert_eq!(u1.next_event().await, Some(live(RecipientFilter::user("u1"))));
        assert_eq!(u1.next_event().await, Some(live(RecipientFilter::broadcast())));
        assert_eq!(u2.next_event().await, Some(live(RecipientFilter::broadcast())));
        let quiet = tokio::time::timeout(Duration::from_millis(20), u2.next_event()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn cancellation_releases_the_subscription() {
        let source = Arc::new(MemoryRowSource::with_tables(["todos"]));
        let (endpoint, bus) = endpoint(source, 10);
        let cancel = CancellationToken::new();

        let mut stream = endpoint.open(
            Caller::anonymous(),
            SyncRequest::new(vec![TableCursor::initial("todos")]),
            &cancel,
        );
        assert!(stream.next_event().await.is_some());
        assert_eq!(bus.subscriber_count(), 1);

        cancel.cancel();
        assert!(stream.is_cancelled());
        wait_for_no_subscribers(&bus).await;
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.is_heartbeat_running());
    }

    #[tokio::test]
    async fn dropping_the_stream_leaves_the_parent_token_alone() {
        let source = Arc::new(MemoryRowSource::with_tables(["todos"]));
        let (endpoint, bus) = endpoint(source, 10);
        let cancel = CancellationToken::new();

        let stream = endpoint.open(Caller::anonymous(), SyncRequest::default(), &cancel);
        drop(stream);

        assert!(!cancel.is_cancelled());
        wait_for_no_subscribers(&bus).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
