//! Connection manager.
//!
//! Keeps one sync stream open, applies catch-up chunks and live events to the
//! local store, and reconnects with backoff after any failure other than an
//! authentication error.
//!
//! ## States
//!
//! ```text
//! disconnected -> connecting -> connected -> sync-complete
//!                                         -> sync-error       -> disconnected (backoff) -> connecting
//!                                         -> connection-error -> disconnected (backoff) -> connecting
//!                                         -> auth-error       (halted until reconnect())
//! ```

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityOracle, StreamStatus};
use crate::cursors::{load_cursors, stage_cursor};
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::store::{LocalStore, WriteBatch};
use crate::transport::SyncTransport;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{ChangeEvent, DeltaChunk, LiveChange, Row, SyncRequest, TableCursor};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of the sync connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A stream is being opened.
    Connecting,
    /// The stream is open; catch-up may still be running.
    Connected,
    /// Every table is caught up and live events are flowing.
    SyncComplete,
    /// A catch-up or local apply failed.
    SyncError,
    /// The stream failed, closed or went silent.
    ConnectionError,
    /// Credentials were rejected; automatic retries are halted.
    AuthError,
}

impl ConnectionStatus {
    /// Returns the status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::SyncComplete => "sync-complete",
            ConnectionStatus::SyncError => "sync-error",
            ConnectionStatus::ConnectionError => "connection-error",
            ConnectionStatus::AuthError => "auth-error",
        }
    }

    /// Returns true if a stream is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::SyncComplete
        )
    }

    fn for_error(error: &SyncError) -> Self {
        match error {
            SyncError::AuthenticationFailed(_) => ConnectionStatus::AuthError,
            SyncError::CatchUp { .. } | SyncError::Store(_) => ConnectionStatus::SyncError,
            _ => ConnectionStatus::ConnectionError,
        }
    }
}

/// Tables still catching up, and tables whose catch-up failed, on one
/// connection attempt.
#[derive(Debug, Default)]
struct AttemptState {
    cursors: HashMap<String, TableCursor>,
    pending: HashSet<String>,
    errored: HashSet<String>,
}

impl AttemptState {
    fn new(cursors: Vec<TableCursor>) -> Self {
        let pending = cursors.iter().map(|c| c.table_name.clone()).collect();
        let cursors = cursors
            .into_iter()
            .map(|c| (c.table_name.clone(), c))
            .collect();
        Self {
            cursors,
            pending,
            errored: HashSet::new(),
        }
    }

    fn is_caught_up(&self) -> bool {
        self.pending.is_empty() && self.errored.is_empty()
    }
}

/// How one attempt ended.
enum AttemptEnd {
    /// The manager was stopped.
    Stopped,
    /// `refresh()` asked for an immediate new attempt.
    Refreshed,
    /// The attempt failed.
    Failed(SyncError),
}

/// Resets a try-lock flag when dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Opens and maintains the sync stream.
pub struct ConnectionManager {
    tables: Vec<String>,
    heartbeat_timeout: Duration,
    backoff: Backoff,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn LocalStore>,
    oracle: Arc<ConnectivityOracle>,
    events: EventBus,
    status: watch::Sender<ConnectionStatus>,
    retry_count: AtomicU32,
    auth_halted: AtomicBool,
    refresh_requested: AtomicBool,
    running: AtomicBool,
    wake: Notify,
    run_token: Mutex<Option<CancellationToken>>,
    attempt_token: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    /// Creates a manager. Nothing happens until [`run`](Self::run).
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn LocalStore>,
        oracle: Arc<ConnectivityOracle>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            tables: config.tables.clone(),
            heartbeat_timeout: config.heartbeat_timeout,
            backoff: config.backoff,
            transport,
            store,
            oracle,
            events,
            status,
            retry_count: AtomicU32::new(0),
            auth_halted: AtomicBool::new(false),
            refresh_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            run_token: Mutex::new(None),
            attempt_token: Mutex::new(None),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watches status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Returns true while automatic retries are halted by an auth error.
    pub fn is_auth_halted(&self) -> bool {
        self.auth_halted.load(Ordering::SeqCst)
    }

    /// Resets the retry counter, clears an auth halt and ends any backoff
    /// wait.
    pub fn reconnect(&self) {
        info!("reconnect requested");
        self.retry_count.store(0, Ordering::SeqCst);
        self.auth_halted.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Aborts the current connection so a fresh one re-syncs immediately.
    pub fn refresh(&self) {
        info!("refresh requested");
        self.refresh_requested.store(true, Ordering::SeqCst);
        match self.attempt_token.lock().as_ref() {
            Some(token) => token.cancel(),
            None => self.wake.notify_one(),
        }
    }

    /// Stops a running loop.
    pub fn stop(&self) {
        if let Some(token) = self.run_token.lock().as_ref() {
            token.cancel();
        }
    }

    /// Runs the connect/consume/reconnect loop until `cancel` fires or
    /// [`stop`](Self::stop) is called. A second concurrent call returns
    /// immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("connection loop already running");
            return;
        }
        let _guard = RunGuard(&self.running);
        let cancel = cancel.child_token();
        *self.run_token.lock() = Some(cancel.clone());

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.is_auth_halted() {
                if !self.wait_for_wake(&cancel).await {
                    break;
                }
                continue;
            }
            if !self.oracle.can_reach_server() {
                self.set_status(ConnectionStatus::Disconnected);
                if !self.wait_until_reachable(&cancel).await {
                    break;
                }
                continue;
            }

            match self.attempt(&cancel).await {
                AttemptEnd::Stopped => break,
                AttemptEnd::Refreshed => {
                    debug!("reconnecting after refresh");
                }
                AttemptEnd::Failed(error) => {
                    let status = ConnectionStatus::for_error(&error);
                    self.set_status(status);
                    self.events.emit(EngineEvent::Error(error.to_string()));
                    if status == ConnectionStatus::AuthError {
                        warn!(error = %error, "authentication rejected, automatic retries halted");
                        self.auth_halted.store(true, Ordering::SeqCst);
                        continue;
                    }

                    self.set_status(ConnectionStatus::Disconnected);
                    let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst);
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        error = %error,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed, retrying"
                    );
                    if !self.wait_backoff(delay, &cancel).await {
                        break;
                    }
                }
            }
        }

        *self.run_token.lock() = None;
        self.set_status(ConnectionStatus::Disconnected);
        info!("connection loop stopped");
    }

    async fn attempt(&self, cancel: &CancellationToken) -> AttemptEnd {
        let token = cancel.child_token();
        *self.attempt_token.lock() = Some(token.clone());
        self.refresh_requested.store(false, Ordering::SeqCst);

        let result = self.connect_and_consume(&token).await;

        *self.attempt_token.lock() = None;
        token.cancel();
        self.oracle.set_stream_status(StreamStatus::Idle);
        // A wake-up from before the attempt ended must not cut the next wait short.
        let _ = self.wake.notified().now_or_never();

        if cancel.is_cancelled() {
            return AttemptEnd::Stopped;
        }
        if self.refresh_requested.swap(false, Ordering::SeqCst) {
            return AttemptEnd::Refreshed;
        }
        match result {
            Ok(()) => AttemptEnd::Failed(SyncError::transport_retryable("stream closed")),
            Err(error) => AttemptEnd::Failed(error),
        }
    }

    async fn connect_and_consume(&self, token: &CancellationToken) -> SyncResult<()> {
        self.set_status(ConnectionStatus::Connecting);
        self.oracle.set_stream_status(StreamStatus::Connecting);

        let cursors = load_cursors(self.store.as_ref(), &self.tables)?;
        let request = SyncRequest::new(cursors.clone());
        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(SyncError::Cancelled),
            opened = self.transport.open_stream(request, token.clone()) => opened?,
        };

        self.set_status(ConnectionStatus::Connected);
        self.oracle.set_stream_status(StreamStatus::Open);
        self.retry_count.store(0, Ordering::SeqCst);

        let mut state = AttemptState::new(cursors);
        let mut connectivity = self.oracle.subscribe();
        let mut deadline = Instant::now() + self.heartbeat_timeout;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SyncError::Cancelled),
                Ok(()) = connectivity.changed() => {
                    if !connectivity.borrow_and_update().can_reach_server() {
                        info!("server unreachable, dropping connection");
                        return Err(SyncError::Offline);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        timeout_ms = self.heartbeat_timeout.as_millis() as u64,
                        "no event within heartbeat timeout"
                    );
                    return Err(SyncError::Timeout);
                }
                item = stream.next() => match item {
                    None => return Ok(()),
                    Some(Err(error)) => return Err(error),
                    Some(Ok(event)) => {
                        deadline = Instant::now() + self.heartbeat_timeout;
                        self.apply_event(&mut state, event)?;
                    }
                },
            }
        }
    }

    fn apply_event(&self, state: &mut AttemptState, event: ChangeEvent) -> SyncResult<()> {
        match event {
            ChangeEvent::Delta(chunk) => self.apply_delta(state, chunk),
            ChangeEvent::LiveChange(change) => self.apply_live(change),
            ChangeEvent::Heartbeat => {
                if state.is_caught_up() {
                    self.set_status(ConnectionStatus::SyncComplete);
                }
                Ok(())
            }
        }
    }

    fn apply_delta(&self, state: &mut AttemptState, chunk: DeltaChunk) -> SyncResult<()> {
        let table = chunk.table;
        if let Some(message) = chunk.error {
            state.pending.remove(&table);
            state.errored.insert(table.clone());
            return Err(SyncError::CatchUp { table, message });
        }

        let mut cursor = state
            .cursors
            .get(&table)
            .cloned()
            .unwrap_or_else(|| TableCursor::initial(table.clone()));
        let mut batch = WriteBatch::new();
        for row in &chunk.rows {
            self.stage_newer(&mut batch, &table, row)?;
        }
        if cursor.advance(&chunk.rows) {
            stage_cursor(&mut batch, &cursor);
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }
        debug!(
            table = %table,
            rows = chunk.rows.len(),
            last = chunk.is_last_chunk,
            "applied delta chunk"
        );
        state.cursors.insert(table.clone(), cursor);

        if chunk.is_last_chunk && state.pending.remove(&table) {
            info!(table = %table, "table caught up");
            self.events.emit(EngineEvent::TableCaughtUp { table });
        }
        Ok(())
    }

    /// Stages `row` unless the store already holds a newer version.
    fn stage_newer(&self, batch: &mut WriteBatch, table: &str, row: &Row) -> SyncResult<()> {
        let Some(id) = row.id() else {
            warn!(table, "skipping row without primary key");
            return Ok(());
        };
        let current = self.store.get_row(table, id)?;
        let newer_local = current
            .as_ref()
            .and_then(Row::updated_at)
            .zip(row.updated_at())
            .is_some_and(|(local, incoming)| local > incoming);
        if !newer_local {
            batch.put(table, row.clone());
        }
        Ok(())
    }

    fn apply_live(&self, change: LiveChange) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        for row in change.rows {
            let Some(id) = row.id().map(str::to_string) else {
                warn!(table = %change.table, "skipping live row without primary key");
                continue;
            };
            if change.operation.is_delete() {
                batch.delete(change.table.as_str(), id);
            } else {
                batch.put(change.table.as_str(), row);
            }
        }
        debug!(table = %change.table, operation = %change.operation, "applied live change");
        if batch.is_empty() {
            return Ok(());
        }
        self.store.commit(batch)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(status = status.as_str(), "connection status changed");
            self.events.emit(EngineEvent::StatusChanged(status));
        }
    }

    /// Waits out a backoff delay. Returns false if cancelled.
    async fn wait_backoff(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        let mut connectivity = self.oracle.subscribe();
        let mut reachable = connectivity.borrow_and_update().can_reach_server();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.wake.notified() => return true,
                Ok(()) = connectivity.changed() => {
                    let now = connectivity.borrow_and_update().can_reach_server();
                    if now && !reachable {
                        debug!("server reachable again, skipping backoff");
                        return true;
                    }
                    reachable = now;
                }
                _ = &mut sleep => return true,
            }
        }
    }

    /// Waits for the oracle to report the server reachable. Returns false
    /// if cancelled.
    async fn wait_until_reachable(&self, cancel: &CancellationToken) -> bool {
        let mut connectivity = self.oracle.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.wake.notified() => true,
            reached = connectivity.wait_for(|state| state.can_reach_server()) => reached.is_ok(),
        }
    }

    /// Waits for `reconnect()`. Returns false if cancelled.
    async fn wait_for_wake(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.wake.notified() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::StaticProbe;
    use crate::cursors::load_cursor;
    use crate::store::MemoryStore;
    use crate::transport::{MockSession, MockTransport};
    use tidesync_protocol::{Operation, RecipientFilter};
    use tokio::sync::broadcast;

    struct Harness {
        manager: Arc<ConnectionManager>,
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
        oracle: Arc<ConnectivityOracle>,
        server_probe: Arc<StaticProbe>,
        events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    }

    fn config() -> EngineConfig {
        EngineConfig::new(["todos"]).with_heartbeat_timeout(Duration::from_secs(30))
    }

    async fn harness() -> Harness {
        harness_with(config()).await
    }

    async fn harness_with(config: EngineConfig) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let server_probe = Arc::new(StaticProbe::new(true));
        let oracle = Arc::new(ConnectivityOracle::new(
            Arc::new(StaticProbe::new(true)),
            server_probe.clone(),
            Duration::from_secs(60),
        ));
        oracle.refresh().await;
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let manager = Arc::new(ConnectionManager::new(
            &config,
            transport.clone(),
            store.clone(),
            oracle.clone(),
            bus,
        ));
        Harness {
            manager,
            transport,
            store,
            oracle,
            server_probe,
            events,
            cancel: CancellationToken::new(),
        }
    }

    impl Harness {
        fn spawn(&self) -> tokio::task::JoinHandle<()> {
            let manager = Arc::clone(&self.manager);
            let cancel = self.cancel.clone();
            tokio::spawn(async move { manager.run(cancel).await })
        }

        async fn wait_for_status(&mut self, status: ConnectionStatus) {
            loop {
                match self.events.recv().await {
                    Ok(EngineEvent::StatusChanged(s)) if s == status => return,
                    Ok(_) => {}
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        }
    }

    /// Lets ready tasks run without letting the paused clock advance.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn slow_backoff() -> EngineConfig {
        config().with_backoff(Backoff::new(Duration::from_secs(60), Duration::from_secs(600)))
    }

    fn delta(rows: Vec<Row>, last: bool) -> ChangeEvent {
        ChangeEvent::Delta(DeltaChunk {
            table: "todos".into(),
            rows,
            is_last_chunk: last,
            error: None,
        })
    }

    fn live(operation: Operation, row: Row) -> ChangeEvent {
        ChangeEvent::LiveChange(LiveChange::new(
            "todos",
            operation,
            vec![row],
            RecipientFilter::broadcast(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_then_heartbeat_completes_sync() {
        let mut h = harness().await;
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![Row::new("a", 10), Row::new("b", 20)], false),
            delta(vec![Row::new("c", 20)], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.store.row_count("todos"), 3);
        assert_eq!(
            load_cursor(h.store.as_ref(), "todos").unwrap(),
            TableCursor::new("todos", 20, "c")
        );
        assert_eq!(h.manager.retry_count(), 0);

        h.manager.stop();
        task.await.unwrap();
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn delta_application_is_idempotent() {
        let mut h = harness().await;
        let chunk = delta(vec![Row::new("a", 10).with("title", "x")], true);
        h.transport.push(MockSession::EventsThenHang(vec![
            chunk.clone(),
            chunk,
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.store.row_count("todos"), 1);
        assert_eq!(
            load_cursor(h.store.as_ref(), "todos").unwrap(),
            TableCursor::new("todos", 10, "a")
        );
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn older_catch_up_rows_do_not_overwrite() {
        let mut h = harness().await;
        h.store.set_row("todos", Row::new("a", 50).with("title", "local")).unwrap();
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![Row::new("a", 40).with("title", "stale")], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        let row = h.store.get_row("todos", "a").unwrap().unwrap();
        assert_eq!(row.get("title"), Some(&serde_json::Value::from("local")));
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_events_upsert_and_delete() {
        let mut h = harness().await;
        h.store.set_row("todos", Row::new("old", 1)).unwrap();
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![], true),
            live(Operation::Create, Row::new("new", 5)),
            live(Operation::Delete, Row::new("old", 6)),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert!(h.store.get_row("todos", "new").unwrap().is_some());
        assert!(h.store.get_row("todos", "old").unwrap().is_none());
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_error_keeps_cursor_and_reconnects() {
        let mut h = harness().await;
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![Row::new("a", 10)], false),
            ChangeEvent::Delta(DeltaChunk::failed("todos", "storage offline")),
        ]));
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![Row::new("b", 20)], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncError).await;
        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.transport.open_count(), 2);

        // The retry resumes from the cursor of the last applied chunk.
        let second = &h.transport.requests()[1];
        assert_eq!(second.table_markers, vec![TableCursor::new("todos", 10, "a")]);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_before_catch_up_does_not_complete() {
        let mut h = harness().await;
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![Row::new("a", 1)], false),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::Connected).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Connected);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_trips_the_watchdog() {
        let mut h = harness().await;
        h.transport.push(MockSession::EventsThenHang(vec![delta(vec![], true)]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::Connected).await;
        h.wait_for_status(ConnectionStatus::ConnectionError).await;
        assert_eq!(h.manager.retry_count(), 1);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_error_halts_until_reconnect() {
        let mut h = harness().await;
        h.transport.push(MockSession::Unauthorized);
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::AuthError).await;
        assert!(h.manager.is_auth_halted());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.transport.open_count(), 1);

        h.manager.reconnect();
        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.transport.open_count(), 2);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_server_blocks_attempts() {
        let mut h = harness().await;
        h.server_probe.set(false);
        h.oracle.refresh().await;
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.transport.open_count(), 0);

        h.server_probe.set(true);
        h.oracle.refresh().await;
        h.wait_for_status(ConnectionStatus::SyncComplete).await;

        // Losing the interface drops the live connection.
        h.oracle.set_network_interface(false);
        h.wait_for_status(ConnectionStatus::ConnectionError).await;
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_reopens_without_backoff() {
        let mut h = harness().await;
        for _ in 0..2 {
            h.transport.push(MockSession::EventsThenHang(vec![
                delta(vec![], true),
                ChangeEvent::Heartbeat,
            ]));
        }
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        h.manager.refresh();
        h.wait_for_status(ConnectionStatus::Connecting).await;
        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(h.manager.retry_count(), 0);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_skipped() {
        let h = harness().await;
        let task = h.spawn();
        tokio::task::yield_now().await;

        // Returns immediately while the first loop holds the flag.
        h.manager.run(h.cancel.clone()).await;
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_reports_disconnected_while_backing_off() {
        let mut h = harness_with(slow_backoff()).await;
        h.transport.push(MockSession::Unreachable);
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::ConnectionError).await;
        h.wait_for_status(ConnectionStatus::Disconnected).await;
        settle().await;
        assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.transport.open_count(), 1);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_cuts_a_backoff_short() {
        let mut h = harness_with(slow_backoff()).await;
        h.transport.push(MockSession::Unreachable);
        h.transport.push(MockSession::EventsThenHang(vec![
            delta(vec![], true),
            ChangeEvent::Heartbeat,
        ]));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::Disconnected).await;
        let backoff_started = Instant::now();
        settle().await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.retry_count(), 1);

        h.manager.reconnect();
        assert_eq!(h.manager.retry_count(), 0);
        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.transport.open_count(), 2);
        assert_eq!(Instant::now(), backoff_started);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_while_connected_does_not_skip_a_later_backoff() {
        let mut h = harness_with(slow_backoff()).await;
        for _ in 0..2 {
            h.transport.push(MockSession::EventsThenHang(vec![
                delta(vec![], true),
                ChangeEvent::Heartbeat,
            ]));
        }
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        h.manager.reconnect();

        // The silent stream times out, then the loop must wait out a delay.
        h.wait_for_status(ConnectionStatus::ConnectionError).await;
        h.wait_for_status(ConnectionStatus::Disconnected).await;
        settle().await;
        assert_eq!(h.transport.open_count(), 1);

        h.wait_for_status(ConnectionStatus::SyncComplete).await;
        assert_eq!(h.transport.open_count(), 2);
        h.cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pushes_back_the_watchdog() {
        let mut h = harness().await;
        let (live, _) = broadcast::channel(8);
        h.transport.push(MockSession::Live(live.clone()));
        let task = h.spawn();

        h.wait_for_status(ConnectionStatus::Connected).await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        live.send(ChangeEvent::Heartbeat).unwrap();
        let heartbeat_at = Instant::now();

        // Past the first deadline, inside the one the heartbeat set.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.manager.status(), ConnectionStatus::Connected);
        assert_eq!(h.transport.open_count(), 1);

        h.wait_for_status(ConnectionStatus::ConnectionError).await;
        assert!(heartbeat_at.elapsed() >= Duration::from_secs(30));
        h.cancel.cancel();
        task.await.unwrap();
    }
}
