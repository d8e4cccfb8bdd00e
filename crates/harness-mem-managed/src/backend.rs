//! Orchestrates the remote backend: connection lifecycle, the bounded
//! replication queue and its periodic flush, shadow reads and promotion.
//!
//! The local store stays the primary for every foreground read and write.
//! Nothing here is allowed to fail a caller because the remote side is
//! unhealthy: connectivity, replication and shadow-read errors degrade the
//! connection state and update metrics instead.

use std::collections::{HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harness_mem_core::{
    mask_endpoint, now_rfc3339, BackendMode, PromotionReadiness, ShadowConfig, ShadowMetrics,
    ShadowPhase, ShadowSyncManager, SqlValue, StoredEvent, SHADOW_MATCH_THRESHOLD,
};
use harness_mem_storage::{
    AsyncStorageAdapter, PgClient, PostgresStorageAdapter, SqlxPgClient, POSTGRES_INIT_SQL,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{EventStore, ObservationProjector};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SHADOW_READ_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Degraded,
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend modes that wire a remote side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ManagedMode {
    Hybrid,
    Managed,
}

impl ManagedMode {
    #[must_use]
    pub fn from_backend_mode(mode: BackendMode) -> Option<Self> {
        match mode {
            BackendMode::Local => None,
            BackendMode::Hybrid => Some(Self::Hybrid),
            BackendMode::Managed => Some(Self::Managed),
        }
    }

    /// `managed` starts promoted; `hybrid` starts off and moves to shadow
    /// once connected.
    #[must_use]
    pub fn seed_phase(self) -> ShadowPhase {
        match self {
            Self::Hybrid => ShadowPhase::Off,
            Self::Managed => ShadowPhase::Promoted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub mode: ManagedMode,
    /// Tenant scope applied to shadow reads.
    pub workspace_uid: Option<String>,
    /// Phase restored from a previous run; overrides the mode's seed phase.
    pub initial_phase: Option<ShadowPhase>,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub shadow_read_limit: u32,
}

impl ManagedBackendConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, mode: ManagedMode) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            mode,
            workspace_uid: None,
            initial_phase: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            shadow_read_limit: DEFAULT_SHADOW_READ_LIMIT,
        }
    }
}

/// Health/admin view. `endpoint` is always masked.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ManagedBackendStatus {
    pub connection_state: ConnectionState,
    pub endpoint: String,
    pub backend_mode: ManagedMode,
    pub shadow_phase: ShadowPhase,
    pub shadow_metrics: ShadowMetrics,
    pub last_replication_at: Option<String>,
    pub last_error: Option<String>,
    pub replication_queue_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// No flush ran: empty queue, no remote, or another flush in progress.
    Skipped,
    /// The event was queued but the backend is not connected.
    Deferred,
    Replicated { inserted: usize, deduplicated: usize },
    /// The batch was put back at the front of the queue.
    Failed { requeued: usize },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShadowReadOutcome {
    /// Not connected, or the phase is `off`.
    Skipped,
    Compared { overlap: f64, matched: bool },
    /// The remote query failed; scored as a divergence.
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PromotionAttempt {
    pub promoted: bool,
    pub phase: ShadowPhase,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowReadOptions {
    pub project: Option<String>,
    /// Remote result cap; the configured default when `None`.
    pub limit: Option<u32>,
}

/// Completion signal for a replication submitted by `replicate_event`.
#[must_use = "drop the ticket to replicate in the background"]
pub struct ReplicationTicket {
    state: TicketState,
}

enum TicketState {
    Ready(FlushOutcome),
    Pending(JoinHandle<FlushOutcome>),
}

impl ReplicationTicket {
    fn ready(outcome: FlushOutcome) -> Self {
        Self { state: TicketState::Ready(outcome) }
    }

    /// Wait for the flush triggered by the submission.
    pub async fn wait(self) -> FlushOutcome {
        match self.state {
            TicketState::Ready(outcome) => outcome,
            TicketState::Pending(handle) => handle.await.unwrap_or_else(|err| {
                tracing::warn!(error = %err, "replication flush task did not complete");
                FlushOutcome::Skipped
            }),
        }
    }
}

#[derive(Clone)]
struct Remote {
    adapter: Arc<PostgresStorageAdapter>,
    events: Arc<EventStore>,
    projector: Arc<ObservationProjector>,
}

struct Connection {
    state: ConnectionState,
    last_error: Option<String>,
    last_replication_at: Option<String>,
    remote: Option<Remote>,
}

struct FlushTimer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ManagedBackendConfig,
    shadow: Mutex<ShadowSyncManager>,
    connection: Mutex<Connection>,
    queue: Mutex<VecDeque<StoredEvent>>,
    flushing: AtomicBool,
    timer: Mutex<Option<FlushTimer>>,
    shut_down: AtomicBool,
}

/// Clears the in-progress flag when a flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ManagedBackend {
    inner: Arc<Inner>,
}

impl ManagedBackend {
    #[must_use]
    pub fn new(config: ManagedBackendConfig) -> Self {
        let phase = config.initial_phase.unwrap_or_else(|| config.mode.seed_phase());
        let mut shadow_config = ShadowConfig::for_phase(
            phase,
            &config.endpoint,
            config.api_key.as_deref().unwrap_or_default(),
        );
        // Managed mode has no local primary to compare against.
        shadow_config.shadow_read_enabled &= config.mode == ManagedMode::Hybrid;
        let shadow = ShadowSyncManager::from_config(shadow_config);

        Self {
            inner: Arc::new(Inner {
                config,
                shadow: Mutex::new(shadow),
                connection: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    last_replication_at: None,
                    remote: None,
                }),
                queue: Mutex::new(VecDeque::new()),
                flushing: AtomicBool::new(false),
                timer: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ManagedBackendConfig {
        &self.inner.config
    }

    /// Connect to the configured endpoint and bootstrap the remote schema.
    /// Failure leaves the backend `degraded`; it is never returned as an error.
    pub async fn initialize(&self) -> ConnectionState {
        self.inner.set_state(ConnectionState::Connecting);
        let config = &self.inner.config;
        match SqlxPgClient::connect(&config.endpoint, config.api_key.as_deref()).await {
            Ok(client) => self.initialize_with(Arc::new(client)).await,
            Err(err) => {
                self.inner.degrade(&err.to_string());
                ConnectionState::Degraded
            }
        }
    }

    /// Like [`ManagedBackend::initialize`], over an already constructed client.
    pub async fn initialize_with(&self, client: Arc<dyn PgClient>) -> ConnectionState {
        self.inner.set_state(ConnectionState::Connecting);
        let adapter = Arc::new(PostgresStorageAdapter::new(client));

        if let Err(err) = adapter.exec_async(POSTGRES_INIT_SQL).await {
            self.inner.degrade(&err.to_string());
            return ConnectionState::Degraded;
        }

        let remote = Remote {
            events: Arc::new(EventStore::new(Arc::clone(&adapter))),
            projector: Arc::new(ObservationProjector::new(Arc::clone(&adapter))),
            adapter,
        };
        {
            let mut connection = self.inner.connection.lock();
            connection.state = ConnectionState::Connected;
            connection.last_error = None;
            connection.remote = Some(remote);
        }

        let phase = {
            let mut shadow = self.inner.shadow.lock();
            if self.inner.config.mode == ManagedMode::Hybrid && shadow.phase() == ShadowPhase::Off {
                shadow.advance_phase();
            }
            shadow.phase()
        };

        tracing::info!(
            endpoint = %mask_endpoint(&self.inner.config.endpoint),
            %phase,
            "managed backend connected"
        );
        self.start_flush_timer();
        ConnectionState::Connected
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        let connection = self.inner.connection.lock();
        connection.state == ConnectionState::Connected && connection.remote.is_some()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.lock().state
    }

    #[must_use]
    pub fn phase(&self) -> ShadowPhase {
        self.inner.shadow.lock().phase()
    }

    #[must_use]
    pub fn metrics(&self) -> ShadowMetrics {
        self.inner.shadow.lock().snapshot()
    }

    #[must_use]
    pub fn promotion_readiness(&self) -> PromotionReadiness {
        self.inner.shadow.lock().is_ready_for_promotion()
    }

    /// Current shadow config without the credential, ready to persist.
    #[must_use]
    pub fn shadow_config(&self) -> ShadowConfig {
        let mut config = self.inner.shadow.lock().to_config();
        config.managed_api_key.clear();
        config
    }

    #[must_use]
    pub fn queued_event_ids(&self) -> Vec<String> {
        self.inner.queue.lock().iter().map(|event| event.event_id.clone()).collect()
    }

    #[must_use]
    pub fn get_status(&self) -> ManagedBackendStatus {
        let (shadow_phase, shadow_metrics) = {
            let shadow = self.inner.shadow.lock();
            (shadow.phase(), shadow.snapshot())
        };
        let replication_queue_size = self.inner.queue.lock().len();
        let connection = self.inner.connection.lock();

        ManagedBackendStatus {
            connection_state: connection.state,
            endpoint: mask_endpoint(&self.inner.config.endpoint),
            backend_mode: self.inner.config.mode,
            shadow_phase,
            shadow_metrics,
            last_replication_at: connection.last_replication_at.clone(),
            last_error: connection.last_error.clone(),
            replication_queue_size,
        }
    }

    /// Queue `event` for replication after a durable local write.
    ///
    /// The primary write is counted whatever the connection state. While
    /// disconnected the event waits in the queue and a replication failure is
    /// recorded; while connected a flush is spawned and the returned ticket
    /// resolves to its outcome.
    pub fn replicate_event(&self, event: StoredEvent) -> ReplicationTicket {
        let connected = self.is_connected();
        {
            let mut shadow = self.inner.shadow.lock();
            shadow.record_primary_write();
            if !connected {
                shadow.record_replication(false);
            }
        }
        self.inner.enqueue(event);

        if !connected {
            return ReplicationTicket::ready(FlushOutcome::Deferred);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                let handle = runtime.spawn(async move { inner.flush().await });
                ReplicationTicket { state: TicketState::Pending(handle) }
            }
            Err(_) => ReplicationTicket::ready(FlushOutcome::Deferred),
        }
    }

    /// Replicate up to one batch from the front of the queue.
    pub async fn flush_replication_queue(&self) -> FlushOutcome {
        self.inner.flush().await
    }

    /// Re-run `query` against the remote backend and score the overlap with
    /// `local_ids`, the identifiers the primary returned.
    pub async fn shadow_read(
        &self,
        query: &str,
        local_ids: &[String],
        options: &ShadowReadOptions,
    ) -> ShadowReadOutcome {
        let remote = {
            let connection = self.inner.connection.lock();
            if connection.state != ConnectionState::Connected {
                return ShadowReadOutcome::Skipped;
            }
            connection.remote.clone()
        };
        let Some(remote) = remote else {
            return ShadowReadOutcome::Skipped;
        };
        if self.inner.config.mode == ManagedMode::Managed || !self.phase().mirrors_writes() {
            return ShadowReadOutcome::Skipped;
        }

        let (sql, params) = self.shadow_query(query, options);
        match remote.adapter.query_all_async(&sql, &params).await {
            Ok(rows) => {
                let remote_ids: HashSet<&str> =
                    rows.iter().filter_map(|row| row.text("id")).collect();
                let overlap = overlap(local_ids, &remote_ids);
                let matched = overlap >= SHADOW_MATCH_THRESHOLD;
                self.inner.shadow.lock().record_shadow_read(matched);
                tracing::debug!(
                    overlap,
                    matched,
                    local = local_ids.len(),
                    remote = remote_ids.len(),
                    "shadow read compared"
                );
                ShadowReadOutcome::Compared { overlap, matched }
            }
            Err(err) => {
                self.inner.shadow.lock().record_shadow_read(false);
                self.inner.connection.lock().last_error = Some(err.to_string());
                tracing::warn!(error = %err, "shadow read failed");
                ShadowReadOutcome::Failed
            }
        }
    }

    /// Advance one phase when every promotion gate passes; otherwise report
    /// all unmet gates and leave the phase alone.
    pub fn attempt_promotion(&self) -> PromotionAttempt {
        let mut shadow = self.inner.shadow.lock();
        let readiness = shadow.is_ready_for_promotion();
        if readiness.ready {
            let phase = shadow.advance_phase();
            tracing::info!(%phase, "managed backend promoted");
        } else {
            tracing::info!(reasons = ?readiness.reasons, "promotion refused");
        }
        PromotionAttempt {
            promoted: readiness.ready,
            phase: shadow.phase(),
            reasons: readiness.reasons,
        }
    }

    /// Return to `off` and stop mirroring. Metrics are kept.
    pub fn rollback(&self) -> ShadowPhase {
        let mut shadow = self.inner.shadow.lock();
        let from = shadow.phase();
        shadow.rollback();
        tracing::warn!(%from, "shadow phase rolled back");
        shadow.phase()
    }

    /// Stop the flush timer, drain one last batch when connected, and release
    /// the connection. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop.send_replace(true);
            if let Err(err) = timer.handle.await {
                tracing::warn!(error = %err, "flush timer ended abnormally");
            }
        }

        let queued = !self.inner.queue.lock().is_empty();
        if queued && self.is_connected() {
            let outcome = self.inner.flush().await;
            tracing::debug!(?outcome, "final replication flush");
        }

        let remote = {
            let mut connection = self.inner.connection.lock();
            connection.state = ConnectionState::Disconnected;
            connection.remote.take()
        };
        if let Some(remote) = remote {
            if let Err(err) = remote.adapter.close().await {
                tracing::warn!(error = %err, "failed to close managed connection");
            }
        }

        tracing::info!(queue_depth = self.inner.queue.lock().len(), "managed backend shut down");
    }

    fn shadow_query(&self, query: &str, options: &ShadowReadOptions) -> (String, Vec<SqlValue>) {
        let mut sql = String::from(
            "SELECT id FROM mem_observations WHERE search_vector @@ plainto_tsquery('english', $1)",
        );
        let mut params: Vec<SqlValue> = vec![query.into()];

        let project = options.project.as_deref().filter(|project| !project.is_empty());
        let workspace = self.inner.config.workspace_uid.as_deref().filter(|uid| !uid.is_empty());
        for (column, value) in [("project", project), ("workspace_uid", workspace)] {
            if let Some(value) = value {
                params.push(value.into());
                sql.push_str(&format!(" AND {column} = ${}", params.len()));
            }
        }

        let limit =
            options.limit.filter(|limit| *limit > 0).unwrap_or(self.inner.config.shadow_read_limit);
        params.push(SqlValue::Integer(i64::from(limit)));
        sql.push_str(&format!(
            " ORDER BY ts_rank(search_vector, plainto_tsquery('english', $1)) DESC LIMIT ${}",
            params.len()
        ));
        (sql, params)
    }

    fn start_flush_timer(&self) {
        let mut slot = self.inner.timer.lock();
        if slot.is_some() || self.inner.shut_down.load(Ordering::Acquire) {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let outcome = inner.flush().await;
                        tracing::trace!(?outcome, "periodic replication flush");
                    }
                }
            }
        });
        *slot = Some(FlushTimer { stop, handle });
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.connection.lock().state = state;
    }

    fn degrade(&self, error: &str) {
        let mut connection = self.connection.lock();
        connection.state = ConnectionState::Degraded;
        connection.last_error = Some(error.to_string());
        tracing::warn!(
            endpoint = %mask_endpoint(&self.config.endpoint),
            error,
            "managed backend degraded"
        );
    }

    fn enqueue(&self, event: StoredEvent) {
        let mut queue = self.queue.lock();
        while queue.len() >= self.config.queue_capacity.max(1) {
            if let Some(evicted) = queue.pop_front() {
                tracing::warn!(
                    event_id = %evicted.event_id,
                    "replication queue full, dropped oldest event"
                );
            }
        }
        queue.push_back(event);
    }

    async fn flush(&self) -> FlushOutcome {
        let Some(remote) = self.connection.lock().remote.clone() else {
            return FlushOutcome::Skipped;
        };
        if self.flushing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return FlushOutcome::Skipped;
        }
        let _guard = FlushGuard(&self.flushing);

        let mut batch: Vec<StoredEvent> = {
            let mut queue = self.queue.lock();
            let take = self.config.batch_size.max(1).min(queue.len());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return FlushOutcome::Skipped;
        }

        match remote.events.append(&batch).await {
            Ok(result) => {
                {
                    let mut shadow = self.shadow.lock();
                    for _ in 0..result.accepted() {
                        shadow.record_replication(true);
                    }
                    for _ in 0..result.skipped {
                        shadow.record_replication(false);
                    }
                }
                if result.skipped > 0 {
                    batch.retain(|event| event.validate().is_ok());
                }

                let mut projection_error = None;
                if result.inserted > 0 {
                    let projection = remote.projector.project(&batch).await;
                    if !projection.errors.is_empty() {
                        tracing::warn!(
                            errors = projection.errors.len(),
                            "projection reported failures"
                        );
                        projection_error =
                            Some(format!("projection failed: {}", projection.errors.join("; ")));
                    }
                }

                let mut connection = self.connection.lock();
                connection.last_replication_at = now_rfc3339().ok();
                connection.last_error = projection_error;
                if connection.state == ConnectionState::Degraded {
                    connection.state = ConnectionState::Connected;
                    tracing::info!("managed backend recovered");
                }
                tracing::debug!(
                    batch = batch.len(),
                    inserted = result.inserted,
                    deduplicated = result.deduplicated,
                    "replicated batch"
                );
                FlushOutcome::Replicated {
                    inserted: result.inserted,
                    deduplicated: result.deduplicated,
                }
            }
            Err(err) => {
                let requeued = batch.len();
                {
                    let mut shadow = self.shadow.lock();
                    for _ in 0..requeued {
                        shadow.record_replication(false);
                    }
                }
                let queue_depth = {
                    let mut queue = self.queue.lock();
                    for event in batch.into_iter().rev() {
                        queue.push_front(event);
                    }
                    while queue.len() > self.config.queue_capacity.max(1) {
                        queue.pop_front();
                    }
                    queue.len()
                };

                let mut connection = self.connection.lock();
                connection.last_error = Some(err.to_string());
                if connection.state == ConnectionState::Connected {
                    connection.state = ConnectionState::Degraded;
                }
                tracing::warn!(error = %err, requeued, queue_depth, "replication batch failed");
                FlushOutcome::Failed { requeued }
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn overlap(local_ids: &[String], remote_ids: &HashSet<&str>) -> f64 {
    if local_ids.is_empty() {
        return 1.0;
    }
    let hits = local_ids.iter().filter(|id| remote_ids.contains(id.as_str())).count();
    hits as f64 / local_ids.len() as f64
}
