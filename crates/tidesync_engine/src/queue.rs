//! Durable mutation queue.
//!
//! Every local write is recorded as one [`PendingQueueEntry`] in
//! [`QUEUE_TABLE`] and drained to the server oldest-first. Entries are
//! removed only once the server acknowledges them; repeated failures park an
//! entry as `failed` rather than dropping it.
//!
//! Delivery is at-least-once. Each payload carries a stable client-generated
//! id so the server can deduplicate replays.

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityOracle;
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::store::{LocalStore, WriteBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidesync_protocol::{Operation, Row, ID_COLUMN};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bookkeeping table holding the queue.
pub const QUEUE_TABLE: &str = "_pending_queue";

const CREATED_AT_COLUMN: &str = "created_at";

/// Delivery state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    /// Waiting to be sent.
    Pending,
    /// Sent, no answer yet.
    InFlight,
    /// Retries exhausted; only a forced drain sends it again.
    Failed,
}

/// One local mutation awaiting server acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQueueEntry {
    /// Queue entry id.
    pub id: String,
    /// Target table.
    pub entity: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Row sent to the executor; its `id` is stable across retries.
    pub payload: Row,
    /// Delivery state.
    pub status: QueueStatus,
    /// Failed submissions so far.
    pub retry_count: u32,
    /// Enqueue time, epoch millis, strictly increasing per queue.
    pub created_at: i64,
    /// Earliest time a non-forced drain may retry, epoch millis.
    #[serde(default)]
    pub next_retry_at: Option<i64>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingQueueEntry {
    /// Returns true if a non-forced drain should send this entry at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.status == QueueStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    fn to_row(&self) -> SyncResult<Row> {
        let value = serde_json::to_value(self)
            .map_err(|e| SyncError::Store(format!("encode queue entry: {e}")))?;
        Row::from_value(value).ok_or_else(|| SyncError::Store("queue entry is not an object".into()))
    }

    fn from_row(row: Row) -> SyncResult<Self> {
        serde_json::from_value(row.into_value())
            .map_err(|e| SyncError::Store(format!("decode queue entry: {e}")))
    }
}

/// Queue counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProgress {
    /// Entries waiting to be sent.
    pub pending: usize,
    /// Entries sent without an answer yet.
    pub in_flight: usize,
    /// Entries parked after exhausting retries.
    pub failed: usize,
}

impl QueueProgress {
    /// Total entries in the queue.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.failed
    }

    /// Returns true if nothing is left to send.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Applies a queued mutation on the server.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Executes `operation` on `entity`. Returns the server's canonical
    /// row, if it sends one back.
    async fn execute(
        &self,
        entity: &str,
        operation: Operation,
        payload: &Row,
    ) -> SyncResult<Option<Row>>;
}

/// Resets a try-lock flag when dropped.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable outbox of local mutations.
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    executor: Arc<dyn OperationExecutor>,
    oracle: Arc<ConnectivityOracle>,
    events: EventBus,
    backoff: Backoff,
    max_retries: u32,
    poll_interval: Duration,
    draining: AtomicBool,
    auth_blocked: AtomicBool,
    last_created_at: Mutex<i64>,
    wake: Notify,
}

impl MutationQueue {
    /// Opens the queue over `store`.
    ///
    /// Entries left in flight by a crash are reset to pending.
    pub fn open(
        config: &EngineConfig,
        store: Arc<dyn LocalStore>,
        executor: Arc<dyn OperationExecutor>,
        oracle: Arc<ConnectivityOracle>,
        events: EventBus,
    ) -> SyncResult<Self> {
        let queue = Self {
            store,
            executor,
            oracle,
            events,
            backoff: config.backoff,
            max_retries: config.max_retries.max(1),
            poll_interval: config.queue_poll_interval,
            draining: AtomicBool::new(false),
            auth_blocked: AtomicBool::new(false),
            last_created_at: Mutex::new(0),
            wake: Notify::new(),
        };

        let entries = queue.entries()?;
        let mut batch = WriteBatch::new();
        for mut entry in entries.iter().cloned() {
            if entry.status == QueueStatus::InFlight {
                entry.status = QueueStatus::Pending;
                batch.put(QUEUE_TABLE, entry.to_row()?);
            }
        }
        if !batch.is_empty() {
            info!(recovered = batch.len(), "reset in-flight mutations after restart");
            queue.store.commit(batch)?;
        }
        *queue.last_created_at.lock() = entries.iter().map(|e| e.created_at).max().unwrap_or(0);
        Ok(queue)
    }

    /// Records a local mutation and returns immediately.
    ///
    /// A payload without an `id` is given a fresh one.
    pub fn enqueue(
        &self,
        entity: &str,
        operation: Operation,
        mut payload: Row,
    ) -> SyncResult<PendingQueueEntry> {
        if payload.id().is_none() {
            payload.set(ID_COLUMN, Uuid::new_v4().to_string());
        }
        let entry = PendingQueueEntry {
            id: Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            operation,
            payload,
            status: QueueStatus::Pending,
            retry_count: 0,
            created_at: self.next_created_at(),
            next_retry_at: None,
            last_error: None,
        };
        self.store.set_row(QUEUE_TABLE, entry.to_row()?)?;
        debug!(id = %entry.id, entity, %operation, "mutation enqueued");

        self.emit_progress();
        self.wake.notify_one();
        Ok(entry)
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> SyncResult<Vec<PendingQueueEntry>> {
        let ids = self
            .store
            .sorted_row_ids(QUEUE_TABLE, CREATED_AT_COLUMN, false)?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.store.get_row(QUEUE_TABLE, &id)? {
                entries.push(PendingQueueEntry::from_row(row)?);
            }
        }
        Ok(entries)
    }

    /// Counts entries by status.
    pub fn progress(&self) -> SyncResult<QueueProgress> {
        let mut progress = QueueProgress::default();
        for entry in self.entries()? {
            match entry.status {
                QueueStatus::Pending => progress.pending += 1,
                QueueStatus::InFlight => progress.in_flight += 1,
                QueueStatus::Failed => progress.failed += 1,
            }
        }
        Ok(progress)
    }

    /// Confirmed rows of `entity` with queued mutations laid over them.
    ///
    /// Queued creates and updates overlay their payload columns by id,
    /// queued deletes hide the row, and tombstones are hidden.
    pub fn read_merged(&self, entity: &str) -> SyncResult<Vec<Row>> {
        let mut rows: BTreeMap<String, Row> = self
            .store
            .get_all(entity)?
            .into_iter()
            .filter_map(|row| Some((row.id()?.to_string(), row)))
            .collect();

        for entry in self.entries()? {
            if entry.entity != entity {
                continue;
            }
            let Some(id) = entry.payload.id().map(str::to_string) else {
                continue;
            };
            if entry.operation.is_delete() {
                rows.remove(&id);
                continue;
            }
            let merged = match rows.remove(&id) {
                Some(mut row) => {
                    for (column, value) in entry.payload.columns() {
                        row.set(column.clone(), value.clone());
                    }
                    row
                }
                None => entry.payload,
            };
            rows.insert(id, merged);
        }

        Ok(rows.into_values().filter(|row| !row.is_tombstone()).collect())
    }

    /// Drains due entries. Returns how many the server acknowledged.
    pub async fn sync(&self) -> SyncResult<usize> {
        self.drain(false).await
    }

    /// Clears an auth block and drains every entry, failed ones included,
    /// ignoring retry times.
    pub async fn force_sync(&self) -> SyncResult<usize> {
        self.auth_blocked.store(false, Ordering::SeqCst);
        self.drain(true).await
    }

    /// Clears an auth block and wakes the background loop.
    pub fn reconnect(&self) {
        self.auth_blocked.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Returns true while automatic drains are blocked by an auth failure.
    pub fn is_auth_blocked(&self) -> bool {
        self.auth_blocked.load(Ordering::SeqCst)
    }

    /// Sends entries to the executor oldest first.
    ///
    /// Without `force`, failed entries and entries whose retry time lies in
    /// the future are skipped, and nothing is sent while an auth failure is
    /// unresolved. Draining stops as soon as the server becomes unreachable.
    /// An overlapping call returns `Ok(0)` without draining.
    pub async fn drain(&self, force: bool) -> SyncResult<usize> {
        if !force && self.is_auth_blocked() {
            debug!("drain skipped, waiting for re-authentication");
            return Ok(0);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already running");
            return Ok(0);
        }
        let _guard = DrainGuard(&self.draining);

        let mut acknowledged = 0;
        for entry in self.entries()? {
            if !self.oracle.can_reach_server() {
                info!("server unreachable, pausing drain");
                break;
            }
            let now = now_millis();
            // Only a drain marks entries in flight, and none other is running.
            let eligible = force || entry.status == QueueStatus::InFlight || entry.is_due(now);
            if !eligible {
                continue;
            }

            let id = entry.id.clone();
            let outcome = match self.submit(entry).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(revert) = self.release(&id) {
                        warn!(id = %id, error = %revert, "could not reset in-flight mutation");
                    }
                    self.emit_progress();
                    return Err(e);
                }
            };
            self.emit_progress();
            match outcome {
                Submitted::Acknowledged => acknowledged += 1,
                Submitted::Retrying | Submitted::Parked => {}
                Submitted::AuthRejected => break,
            }
        }
        Ok(acknowledged)
    }

    async fn submit(&self, mut entry: PendingQueueEntry) -> SyncResult<Submitted> {
        entry.status = QueueStatus::InFlight;
        self.store.set_row(QUEUE_TABLE, entry.to_row()?)?;

        let result = self
            .executor
            .execute(&entry.entity, entry.operation, &entry.payload)
            .await;

        match result {
            Ok(canonical) => {
                let mut batch = WriteBatch::new();
                batch.delete(QUEUE_TABLE, entry.id.as_str());
                if let Some(id) = entry.payload.id() {
                    if entry.operation.is_delete() {
                        batch.delete(entry.entity.as_str(), id);
                    } else {
                        let row = canonical.unwrap_or_else(|| entry.payload.clone());
                        batch.put(entry.entity.as_str(), row);
                    }
                }
                self.store.commit(batch)?;
                debug!(id = %entry.id, entity = %entry.entity, "mutation acknowledged");
                Ok(Submitted::Acknowledged)
            }
            Err(e) if e.is_auth() => {
                entry.status = QueueStatus::Pending;
                entry.last_error = Some(e.to_string());
                self.store.set_row(QUEUE_TABLE, entry.to_row()?)?;
                self.auth_blocked.store(true, Ordering::SeqCst);
                warn!(error = %e, "mutation rejected for authentication, pausing queue");
                self.events.emit(EngineEvent::Error(e.to_string()));
                Ok(Submitted::AuthRejected)
            }
            Err(e) => {
                entry.retry_count += 1;
                entry.last_error = Some(e.to_string());
                let outcome = if entry.retry_count < self.max_retries {
                    let delay = self.backoff.delay(entry.retry_count);
                    entry.status = QueueStatus::Pending;
                    entry.next_retry_at = Some(now_millis() + delay.as_millis() as i64);
                    warn!(
                        id = %entry.id,
                        attempt = entry.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "mutation failed, will retry"
                    );
                    Submitted::Retrying
                } else {
                    entry.status = QueueStatus::Failed;
                    entry.next_retry_at = None;
                    error!(id = %entry.id, attempts = entry.retry_count, error = %e, "mutation parked as failed");
                    self.events.emit(EngineEvent::MutationFailed {
                        id: entry.id.clone(),
                        error: e.to_string(),
                    });
                    Submitted::Parked
                };
                self.store.set_row(QUEUE_TABLE, entry.to_row()?)?;
                Ok(outcome)
            }
        }
    }

    fn release(&self, id: &str) -> SyncResult<()> {
        let Some(row) = self.store.get_row(QUEUE_TABLE, id)? else {
            return Ok(());
        };
        let mut entry = PendingQueueEntry::from_row(row)?;
        if entry.status == QueueStatus::InFlight {
            entry.status = QueueStatus::Pending;
            self.store.set_row(QUEUE_TABLE, entry.to_row()?)?;
        }
        Ok(())
    }

    /// Drains on enqueue, when the server becomes reachable, when the
    /// earliest retry time passes, and at least every poll interval, until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut connectivity = self.oracle.subscribe();
        loop {
            if let Err(e) = self.drain(false).await {
                warn!(error = %e, "drain failed");
                self.events.emit(EngineEvent::Error(e.to_string()));
            }

            let wait = self.next_wake_delay();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                Ok(()) = connectivity.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("mutation queue stopped");
    }

    fn next_wake_delay(&self) -> Duration {
        let now = now_millis();
        let earliest = self
            .entries()
            .ok()
            .and_then(|entries| {
                entries
                    .iter()
                    .filter(|e| e.status == QueueStatus::Pending)
                    .filter_map(|e| e.next_retry_at)
                    .min()
            })
            .map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64));
        match earliest {
            Some(delay) => delay.min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    fn next_created_at(&self) -> i64 {
        let mut last = self.last_created_at.lock();
        let next = now_millis().max(*last + 1);
        *last = next;
        next
    }

    fn emit_progress(&self) {
        match self.progress() {
            Ok(progress) => self.events.emit(EngineEvent::QueueProgress(progress)),
            Err(e) => warn!(error = %e, "could not read queue progress"),
        }
    }
}

/// Result of one submission.
enum Submitted {
    Acknowledged,
    Retrying,
    Parked,
    AuthRejected,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
