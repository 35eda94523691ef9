//! Demo command implementation.
//!
//! Starts a server over an in-memory row source, connects two clients
//! through a loopback transport, and reports what each one ends up with.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidesync_engine::{
    ConnectionStatus, EngineConfig, EngineEvent, EventStream, MemoryStore, OperationExecutor,
    SyncClient, SyncError, SyncResult, SyncTransport,
};
use tidesync_protocol::{encode_frame, FrameDecoder, Operation, RecipientFilter, Row, SyncRequest};
use tidesync_server::{MemoryRowSource, ServerConfig, SyncServer};
use tokio_util::sync::CancellationToken;
use tracing::info;

const TABLE: &str = "todos";

/// In-process transport that round-trips every event through the wire
/// framing.
struct LoopbackTransport {
    server: Arc<SyncServer>,
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn open_stream(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> SyncResult<EventStream> {
        let stream = self
            .server
            .open_stream(None, request, &cancel)
            .map_err(|e| SyncError::ServerError(e.to_string()))?;
        Ok(stream
            .map(|event| {
                let frame = encode_frame(&event)?;
                let mut decoder = FrameDecoder::new();
                decoder.push(&frame);
                decoder
                    .next_event()?
                    .ok_or_else(|| SyncError::transport_retryable("incomplete frame"))
            })
            .boxed())
    }
}

/// Writes mutations into the row source and publishes them to everyone.
struct SourceExecutor {
    server: Arc<SyncServer>,
    source: Arc<MemoryRowSource>,
}

#[async_trait]
impl OperationExecutor for SourceExecutor {
    async fn execute(
        &self,
        entity: &str,
        operation: Operation,
        payload: &Row,
    ) -> SyncResult<Option<Row>> {
        let id = payload
            .id()
            .ok_or_else(|| SyncError::Executor("payload has no id".into()))?;
        let now = now_millis();
        let row = if operation.is_delete() {
            self.source
                .soft_delete(entity, id, now)
                .ok_or_else(|| SyncError::Executor(format!("no row {id} in {entity}")))?
        } else {
            let mut row = payload.clone();
            row.set("updated_at", now);
            self.source.upsert(entity, [row.clone()]);
            row
        };
        self.server
            .publish_change(entity, operation, vec![row.clone()], RecipientFilter::broadcast());
        Ok((!operation.is_delete()).then_some(row))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn build_client(
    server: &Arc<SyncServer>,
    executor: Arc<dyn OperationExecutor>,
) -> SyncResult<SyncClient> {
    SyncClient::builder(EngineConfig::new([TABLE]))
        .transport(Arc::new(LoopbackTransport {
            server: Arc::clone(server),
        }))
        .executor(executor)
        .store(Arc::new(MemoryStore::new()))
        .build()
}

async fn wait_for(client: &SyncClient, wanted: ConnectionStatus) -> SyncResult<()> {
    let mut status = client.subscribe_status();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| *s == wanted))
        .await
        .map_err(|_| SyncError::Timeout)?
        .map_err(|_| SyncError::Cancelled)?;
    Ok(())
}

async fn wait_until(check: impl Fn() -> SyncResult<bool>) -> SyncResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check()? {
        if tokio::time::Instant::now() >= deadline {
            return Err(SyncError::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Runs the demo command.
pub async fn run(rows: usize, page_size: usize, writes: usize) -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(MemoryRowSource::with_tables([TABLE]));
    source.upsert(
        TABLE,
        (0..rows).map(|i| {
            Row::new(format!("seed-{i:06}"), i64::try_from(i).unwrap_or(i64::MAX))
                .with("title", format!("seeded todo {i}"))
        }),
    );
    let config = ServerConfig::new()
        .with_page_size(page_size)
        .with_heartbeat_interval(Duration::from_millis(200));
    let server = Arc::new(SyncServer::new(config, source.clone()));

    let writer = build_client(
        &server,
        Arc::new(SourceExecutor {
            server: Arc::clone(&server),
            source: source.clone(),
        }),
    )?;
    let reader = build_client(
        &server,
        Arc::new(SourceExecutor {
            server: Arc::clone(&server),
            source,
        }),
    )?;

    let mut events = reader.subscribe_events();
    writer.start();
    reader.start();
    wait_for(&writer, ConnectionStatus::SyncComplete).await?;
    wait_for(&reader, ConnectionStatus::SyncComplete).await?;
    info!(rows, "both clients caught up");

    let mut ids = Vec::with_capacity(writes);
    for i in 0..writes {
        let entry = writer.enqueue(
            TABLE,
            Operation::Create,
            Row::from_value(serde_json::json!({ "title": format!("local todo {i}") }))
                .unwrap_or_default(),
        )?;
        if let Some(id) = entry.payload.id() {
            ids.push(id.to_string());
        }
    }
    println!(
        "writer: {} confirmed, {} visible with pending writes",
        writer.read_confirmed(TABLE)?.len(),
        writer.read_merged(TABLE)?.len()
    );

    wait_until(|| Ok(writer.queue_progress()?.is_empty())).await?;
    wait_until(|| {
        let confirmed = reader.read_confirmed(TABLE)?;
        Ok(ids
            .iter()
            .all(|id| confirmed.iter().any(|row| row.id() == Some(id.as_str()))))
    })
    .await?;

    let mut caught_up = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::TableCaughtUp { .. }) {
            caught_up += 1;
        }
    }

    println!("writer: {} rows, status {}", writer.read_confirmed(TABLE)?.len(), writer.status().as_str());
    println!(
        "reader: {} rows, status {}, {} catch-up(s) completed",
        reader.read_confirmed(TABLE)?.len(),
        reader.status().as_str(),
        caught_up
    );

    writer.shutdown().await;
    reader.shutdown().await;
    Ok(())
}
