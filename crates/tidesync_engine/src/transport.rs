//! Transport layer abstraction for the sync stream.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tidesync_protocol::{ChangeEvent, SyncRequest};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Events received on an open sync stream.
pub type EventStream = BoxStream<'static, SyncResult<ChangeEvent>>;

/// A sync transport opens the long-lived streaming call to the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, HTTP streaming, loopback, mock for testing).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Opens a stream for `request`. The stream must end soon after
    /// `cancel` fires.
    async fn open_stream(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<EventStream>;
}

/// One scripted connection of a [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockSession {
    /// Opening fails with a retryable transport error.
    Unreachable,
    /// Opening fails authentication.
    Unauthorized,
    /// Yields the events, then the server closes the stream.
    Events(Vec<ChangeEvent>),
    /// Yields the events, then stays open until cancelled.
    EventsThenHang(Vec<ChangeEvent>),
    /// Yields whatever is sent on the channel after the stream opens, until
    /// cancelled or every sender is dropped.
    Live(broadcast::Sender<ChangeEvent>),
}

/// A mock transport for testing.
///
/// Each `open_stream` call plays the next scripted session; an empty script
/// behaves as [`MockSession::Unreachable`].
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockSession>>,
    requests: Mutex<Vec<SyncRequest>>,
    opens: AtomicUsize,
}

impl MockTransport {
    /// Creates a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a session to the script.
    pub fn push(&self, session: MockSession) {
        self.script.lock().push_back(session);
    }

    /// Number of `open_stream` calls so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn open_stream(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let session = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockSession::Unreachable);

        match session {
            MockSession::Unreachable => Err(SyncError::transport_retryable("connection refused")),
            MockSession::Unauthorized => {
                Err(SyncError::AuthenticationFailed("token rejected".into()))
            }
            MockSession::Events(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            MockSession::EventsThenHang(events) => {
                let hang = stream::once(async move {
                    cancel.cancelled().await;
                    Err(SyncError::Cancelled)
                });
                Ok(stream::iter(events.into_iter().map(Ok)).chain(hang).boxed())
            }
            MockSession::Live(sender) => {
                let receiver = sender.subscribe();
                Ok(stream::unfold((receiver, cancel), |(mut receiver, cancel)| async move {
                    let event = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        received = receiver.recv() => received.ok()?,
                    };
                    Some((Ok(event), (receiver, cancel)))
                })
                .boxed())
            }
        }
    }
}
