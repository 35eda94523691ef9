//! Main sync server.

use crate::auth::{AuthConfig, TokenValidator};
use crate::bus::LiveBus;
use crate::config::ServerConfig;
use crate::delta::DeltaProvider;
use crate::endpoint::{SyncEndpoint, SyncStream};
use crate::error::{ServerError, ServerResult};
use crate::source::RowSource;
use std::collections::HashSet;
use std::sync::Arc;
use tidesync_protocol::{Caller, ChangeEvent, LiveChange, Operation, RecipientFilter, Row, SyncRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The sync server.
///
/// Owns the live bus and serves streaming sync calls over a [`RowSource`].
/// Business logic that mutates rows reports each change through
/// [`SyncServer::publish_change`] so connected clients see it live.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tidesync_server::{MemoryRowSource, ServerConfig, SyncServer};
///
/// let source = Arc::new(MemoryRowSource::with_tables(["todos"]));
/// let server = SyncServer::new(ServerConfig::default(), source);
/// assert_eq!(server.bus().subscriber_count(), 0);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    bus: Arc<LiveBus>,
    endpoint: SyncEndpoint,
    validator: Option<TokenValidator>,
}

impl SyncServer {
    /// Creates a server reading catch-up data from `source`.
    pub fn new(config: ServerConfig, source: Arc<dyn RowSource>) -> Self {
        let bus = Arc::new(LiveBus::new(config.heartbeat_interval));
        let delta = DeltaProvider::new(source, &config);
        let endpoint = SyncEndpoint::new(delta, Arc::clone(&bus), config.stream_buffer);
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(AuthConfig::new(secret.clone()))),
            _ => None,
        };

        Self {
            config,
            bus,
            endpoint,
            validator,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the live bus.
    pub fn bus(&self) -> &Arc<LiveBus> {
        &self.bus
    }

    /// Issues a token for `caller`. Fails when authentication is disabled.
    pub fn issue_token(&self, caller: &Caller) -> ServerResult<Vec<u8>> {
        match &self.validator {
            Some(validator) => validator.create_token(caller),
            None => Err(ServerError::Internal(
                "authentication is not enabled".into(),
            )),
        }
    }

    /// Resolves the caller behind an optional bearer token.
    ///
    /// With authentication disabled every call is anonymous.
    pub fn authenticate(&self, token: Option<&[u8]>) -> ServerResult<Caller> {
        let Some(validator) = &self.validator else {
            return Ok(Caller::anonymous());
        };
        let token =
            token.ok_or_else(|| ServerError::AuthenticationFailed("Missing token".into()))?;
        validator.validate_token(token).inspect_err(|e| {
            warn!(error = %e, "rejected sync call");
        })
    }

    /// Authenticates and opens a sync stream.
    pub fn open_stream(
        &self,
        token: Option<&[u8]>,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<SyncStream> {
        let caller = self.authenticate(token)?;
        self.open_stream_as(caller, request, cancel)
    }

    /// Opens a sync stream for an already authenticated caller.
    pub fn open_stream_as(
        &self,
        caller: Caller,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> ServerResult<SyncStream> {
        validate_request(&request)?;
        info!(
            user = caller.user_id.as_deref().unwrap_or("anonymous"),
            tables = request.table_markers.len(),
            "opening sync stream"
        );
        Ok(self.endpoint.open(caller, request, cancel))
    }

    /// Publishes a live event. Returns the number of deliveries.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.bus.publish(event)
    }

    /// Publishes one mutation that has already been written to the row
    /// source.
    pub fn publish_change(
        &self,
        table: &str,
        operation: Operation,
        rows: Vec<Row>,
        filter: RecipientFilter,
    ) -> usize {
        debug!(table, %operation, rows = rows.len(), "publishing change");
        self.publish(ChangeEvent::LiveChange(LiveChange::new(
            table, operation, rows, filter,
        )))
    }
}

fn validate_request(request: &SyncRequest) -> ServerResult<()> {
    let mut seen = HashSet::new();
    for table in request.tables() {
        if table.is_empty() {
            return Err(ServerError::InvalidRequest("empty table name".into()));
        }
        if !seen.insert(table) {
            return Err(ServerError::InvalidRequest(format!(
                "table {table} requested twice"
            )));
        }
    }
    Ok(())
}
