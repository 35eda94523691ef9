//! Client facade.
//!
//! [`SyncClient`] owns the connectivity oracle, the connection manager and
//! the mutation queue, runs each as a background task, and exposes the
//! operations an application calls.

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::connectivity::{ConnectivityOracle, ConnectivityState, HealthProbe, StaticProbe};
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::queue::{MutationQueue, OperationExecutor, PendingQueueEntry, QueueProgress};
use crate::store::LocalStore;
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use tidesync_protocol::{Operation, Row};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn SyncTransport>>,
    executor: Option<Arc<dyn OperationExecutor>>,
    store: Option<Arc<dyn LocalStore>>,
    internet_probe: Option<Arc<dyn HealthProbe>>,
    server_probe: Option<Arc<dyn HealthProbe>>,
}

impl SyncClientBuilder {
    /// Starts a builder with `config`.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            executor: None,
            store: None,
            internet_probe: None,
            server_probe: None,
        }
    }

    /// Sets the stream transport. Required.
    pub fn transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the mutation executor. Required.
    pub fn executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the local store. Required.
    pub fn store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the third-party internet probe. Defaults to always up.
    pub fn internet_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.internet_probe = Some(probe);
        self
    }

    /// Sets the server health probe. Defaults to always up.
    pub fn server_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.server_probe = Some(probe);
        self
    }

    /// Builds the client, recovering any queue entries left in flight.
    pub fn build(self) -> SyncResult<SyncClient> {
        let transport = self
            .transport
            .ok_or_else(|| SyncError::Config("a transport is required".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| SyncError::Config("an operation executor is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| SyncError::Config("a local store is required".into()))?;
        let internet = self
            .internet_probe
            .unwrap_or_else(|| Arc::new(StaticProbe::new(true)));
        let server = self
            .server_probe
            .unwrap_or_else(|| Arc::new(StaticProbe::new(true)));

        let events = EventBus::new(self.config.event_capacity);
        let oracle = Arc::new(ConnectivityOracle::new(
            internet,
            server,
            self.config.probe_interval,
        ));
        let connection = Arc::new(ConnectionManager::new(
            &self.config,
            transport,
            Arc::clone(&store),
            Arc::clone(&oracle),
            events.clone(),
        ));
        let queue = Arc::new(MutationQueue::open(
            &self.config,
            Arc::clone(&store),
            executor,
            Arc::clone(&oracle),
            events.clone(),
        )?);

        Ok(SyncClient {
            store,
            oracle,
            connection,
            queue,
            events,
            tasks: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Offline-first sync client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tidesync_engine::{EngineConfig, MemoryStore, MockTransport, SyncClient};
/// # use tidesync_engine::{OperationExecutor, SyncResult};
/// # use tidesync_protocol::{Operation, Row};
/// # struct Noop;
/// # #[async_trait::async_trait]
/// # impl OperationExecutor for Noop {
/// #     async fn execute(&self, _: &str, _: Operation, _: &Row) -> SyncResult<Option<Row>> { Ok(None) }
/// # }
///
/// # async fn demo() -> SyncResult<()> {
/// let client = SyncClient::builder(EngineConfig::new(["todos"]))
///     .transport(Arc::new(MockTransport::new()))
///     .executor(Arc::new(Noop))
///     .store(Arc::new(MemoryStore::new()))
///     .build()?;
///
/// client.start();
/// client.enqueue("todos", Operation::Create, Row::new("t1", 0))?;
/// let todos = client.read_merged("todos")?;
/// client.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncClient {
    store: Arc<dyn LocalStore>,
    oracle: Arc<ConnectivityOracle>,
    connection: Arc<ConnectionManager>,
    queue: Arc<MutationQueue>,
    events: EventBus,
    tasks: Mutex<Option<Running>>,
}

impl SyncClient {
    /// Starts a builder.
    pub fn builder(config: EngineConfig) -> SyncClientBuilder {
        SyncClientBuilder::new(config)
    }

    /// Spawns the oracle, connection and queue tasks. Calling it again
    /// while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let cancel = CancellationToken::new();

        let oracle = Arc::clone(&self.oracle);
        let connection = Arc::clone(&self.connection);
        let queue = Arc::clone(&self.queue);
        let handles = vec![
            tokio::spawn({
                let cancel = cancel.clone();
                async move { oracle.run(cancel).await }
            }),
            tokio::spawn({
                let cancel = cancel.clone();
                async move { connection.run(cancel).await }
            }),
            tokio::spawn({
                let cancel = cancel.clone();
                async move { queue.run(cancel).await }
            }),
        ];

        info!("sync client started");
        *tasks = Some(Running { cancel, handles });
    }

    /// Stops every background task and waits for them to finish.
    pub async fn shutdown(&self) {
        let Some(running) = self.tasks.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("sync client stopped");
    }

    /// Returns true between [`start`](Self::start) and
    /// [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Records a local mutation for delivery.
    pub fn enqueue(
        &self,
        entity: &str,
        operation: Operation,
        payload: Row,
    ) -> SyncResult<PendingQueueEntry> {
        self.queue.enqueue(entity, operation, payload)
    }

    /// Confirmed rows of `entity` with queued mutations applied.
    pub fn read_merged(&self, entity: &str) -> SyncResult<Vec<Row>> {
        self.queue.read_merged(entity)
    }

    /// Confirmed rows of `entity` only.
    pub fn read_confirmed(&self, entity: &str) -> SyncResult<Vec<Row>> {
        self.store.get_all(entity)
    }

    /// Every queued mutation, oldest first.
    pub fn pending(&self) -> SyncResult<Vec<PendingQueueEntry>> {
        self.queue.entries()
    }

    /// Queue counts by status.
    pub fn queue_progress(&self) -> SyncResult<QueueProgress> {
        self.queue.progress()
    }

    /// Drains due mutations now.
    pub async fn sync(&self) -> SyncResult<usize> {
        self.queue.sync().await
    }

    /// Drains every mutation now, failed ones included.
    pub async fn force_sync(&self) -> SyncResult<usize> {
        self.queue.force_sync().await
    }

    /// Clears retry and auth state on both the stream and the queue, and
    /// tries again immediately.
    pub fn reconnect(&self) {
        self.connection.reconnect();
        self.queue.reconnect();
    }

    /// Reopens the stream so every table catches up again.
    pub fn refresh(&self) {
        self.connection.refresh();
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Watches connection status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    /// Current reachability.
    pub fn connectivity(&self) -> ConnectivityState {
        self.oracle.state()
    }

    /// Watches reachability transitions.
    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.oracle.subscribe()
    }

    /// Forwards an OS network interface change.
    pub fn set_network_interface(&self, up: bool) {
        self.oracle.set_network_interface(up);
    }

    /// Listens to engine events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(running) = self.tasks.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
