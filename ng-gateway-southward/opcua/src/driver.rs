use crate::{
    certificate::CertificateManager,
    codec::now_millis,
    connection::{ConnectionContext, ConnectionManager},
    queue::FailureHandler,
    registry::{ListenRegistration, ListenerRegistry},
    request::{ListenParams, NodeListenParams, Request, SubtreeListenParams},
    session::UaConnector,
    types::{OpcUaChannelDescriptor, OpcUaOptions},
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::Utc;
use ng_gateway_sdk::{
    build_exponential_backoff, ChannelConfig, ChannelListener, ChannelRecord, ChannelStatus,
    Driver, DriverError, DriverHealth, DriverResult, HealthStatus, SouthwardConnectionState,
};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// OPC UA driver: lazy connect, forced reconnect on failure, listeners kept
/// across sessions.
pub struct OpcUaDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    options: ArcSwap<OpcUaOptions>,
    connector: Arc<dyn UaConnector>,
    certificates: Arc<dyn CertificateManager>,
    node_registry: Arc<ListenerRegistry<NodeListenParams>>,
    subtree_registry: Arc<ListenerRegistry<SubtreeListenParams>>,
    /// Current connection; every connect and drop happens under this lock
    connection: Mutex<Option<Arc<ConnectionManager>>>,
    /// Bumped on every connect and explicit disconnect; stale failure
    /// handlers and reconnect loops compare against it
    epoch: AtomicU64,
    reconnecting: AtomicBool,
    /// Set by every reconnect request; a finishing loop that finds it set runs again
    reconnect_pending: AtomicBool,
    cancel_token: CancellationToken,

    conn_tx: watch::Sender<SouthwardConnectionState>,
    conn_rx: watch::Receiver<SouthwardConnectionState>,

    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    last_avg_response_time_ms: AtomicU64,
}

impl OpcUaDriver {
    pub fn new(
        options: OpcUaOptions,
        connector: Arc<dyn UaConnector>,
        certificates: Arc<dyn CertificateManager>,
    ) -> Self {
        let (conn_tx, conn_rx) = watch::channel(SouthwardConnectionState::Disconnected);
        Self {
            inner: Arc::new(DriverInner {
                options: ArcSwap::from_pointee(options),
                connector,
                certificates,
                node_registry: ListenerRegistry::new(),
                subtree_registry: ListenerRegistry::new(),
                connection: Mutex::new(None),
                epoch: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
                conn_tx,
                conn_rx,
                total_requests: AtomicU64::new(0),
                successful_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                last_avg_response_time_ms: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn options(&self) -> Arc<OpcUaOptions> {
        self.inner.options.load_full()
    }

    /// Current connection, if any.
    pub async fn connection(&self) -> Option<Arc<ConnectionManager>> {
        self.inner.connection.lock().await.clone()
    }

    /// Replace the options; an open connection is closed and reopened with them.
    #[instrument(level = "info", skip_all)]
    pub async fn update_options(&self, options: OpcUaOptions) -> DriverResult<()> {
        self.inner.options.store(Arc::new(options));
        let mut slot = self.inner.connection.lock().await;
        if let Some(old) = slot.take() {
            self.inner.epoch.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = old.close().await {
                tracing::warn!(error = %e, "OPC UA close before option update failed");
            }
            self.inner.open_locked(&mut slot).await?;
        }
        Ok(())
    }

    /// Stop reconnecting and close the connection for good.
    #[instrument(level = "info", skip_all)]
    pub async fn shutdown(&self) -> DriverResult<()> {
        self.inner.cancel_token.cancel();
        self.inner.close_current().await
    }
}

impl DriverInner {
    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            connector: Arc::clone(&self.connector),
            options: self.options.load_full(),
            certificates: Arc::clone(&self.certificates),
            node_registry: Arc::clone(&self.node_registry),
            subtree_registry: Arc::clone(&self.subtree_registry),
        }
    }

    #[inline]
    fn has_listeners(&self) -> bool {
        !self.node_registry.is_empty() || !self.subtree_registry.is_empty()
    }

    #[inline]
    fn publish_state(&self, state: SouthwardConnectionState) {
        let _ = self.conn_tx.send(state);
    }

    async fn ensure_connected(self: &Arc<Self>) -> DriverResult<Arc<ConnectionManager>> {
        let mut slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(connection) => Ok(Arc::clone(connection)),
            None => self.open_locked(&mut slot).await,
        }
    }

    /// Open a connection into the empty `slot`; the caller holds its lock.
    async fn open_locked(
        self: &Arc<Self>,
        slot: &mut Option<Arc<ConnectionManager>>,
    ) -> DriverResult<Arc<ConnectionManager>> {
        if self.cancel_token.is_cancelled() {
            return Err(DriverError::InvalidStateError(
                "OPC UA driver is shut down".to_string(),
            ));
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.publish_state(SouthwardConnectionState::Connecting);

        let me: Weak<DriverInner> = Arc::downgrade(self);
        let failure_handler: FailureHandler = Arc::new(move |error: DriverError| {
            if let Some(inner) = me.upgrade() {
                inner.on_connection_failure(epoch, error);
            }
        });

        match ConnectionManager::connect(&self.context(), failure_handler).await {
            Ok(connection) => {
                *slot = Some(Arc::clone(&connection));
                self.publish_state(SouthwardConnectionState::Connected);
                tracing::info!(epoch, "OPC UA driver connected");
                Ok(connection)
            }
            Err(e) => {
                self.publish_state(SouthwardConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn close_current(&self) -> DriverResult<()> {
        let taken = {
            let mut slot = self.connection.lock().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            slot.take()
        };
        let result = match taken {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };
        self.publish_state(SouthwardConnectionState::Disconnected);
        result
    }

    /// A connection of `epoch` failed: drop it and reconnect in the background.
    fn on_connection_failure(self: &Arc<Self>, epoch: u64, error: DriverError) {
        if self.cancel_token.is_cancelled() || self.epoch.load(Ordering::Acquire) != epoch {
            tracing::debug!(error = %error, "ignoring failure of a stale OPC UA connection");
            return;
        }
        tracing::warn!(error = %error, "OPC UA connection failed, dropping session");
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let dropped = {
                let mut slot = inner.connection.lock().await;
                if inner.epoch.load(Ordering::Acquire) == epoch {
                    slot.take()
                } else {
                    None
                }
            };
            let Some(connection) = dropped else {
                return;
            };
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "OPC UA close of failed connection reported an error");
            }
            inner.publish_state(SouthwardConnectionState::Reconnecting);
            inner.start_reconnect();
        });
    }

    fn start_reconnect(self: &Arc<Self>) {
        self.reconnect_pending.store(true, Ordering::Release);
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                inner.reconnect_pending.store(false, Ordering::Release);
                inner.reconnect_loop().await;
                inner.reconnecting.store(false, Ordering::Release);
                // A request that arrived while the loop was exiting saw `reconnecting` still set.
                if !inner.reconnect_pending.load(Ordering::Acquire)
                    || inner.reconnecting.swap(true, Ordering::AcqRel)
                {
                    return;
                }
            }
        });
    }

    /// Retry with exponential backoff while listeners exist, until a
    /// connection is open, the policy gives up or the driver shuts down.
    async fn reconnect_loop(self: &Arc<Self>) {
        let policy = self.options.load().reconnect;
        let mut bo = build_exponential_backoff(&policy);
        let mut started_at = self.epoch.load(Ordering::Acquire);
        let mut attempt: u32 = 0;
        loop {
            if self.cancel_token.is_cancelled() {
                return;
            }
            if !self.has_listeners() {
                tracing::debug!("no OPC UA listeners left, reconnect stopped");
                self.publish_state(SouthwardConnectionState::Disconnected);
                return;
            }
            if !policy.allows_attempt(attempt) {
                self.publish_state(SouthwardConnectionState::Failed(format!(
                    "reconnect gave up after {attempt} attempts"
                )));
                return;
            }
            let Some(delay) = bo.next_backoff() else {
                self.publish_state(SouthwardConnectionState::Failed(
                    "reconnect time budget exhausted".to_string(),
                ));
                return;
            };
            attempt = attempt.saturating_add(1);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "OPC UA reconnect scheduled");
            self.publish_state(SouthwardConnectionState::Reconnecting);
            tokio::select! {
                _ = self.cancel_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut slot = self.connection.lock().await;
            if slot.is_some() || self.epoch.load(Ordering::Acquire) != started_at {
                return;
            }
            match self.open_locked(&mut slot).await {
                Ok(_) => {
                    tracing::info!(attempt, "OPC UA reconnected");
                    return;
                }
                Err(e) => {
                    // Our own attempt moved the epoch; anyone else must take the lock first.
                    started_at = self.epoch.load(Ordering::Acquire);
                    tracing::warn!(attempt, error = %e, "OPC UA reconnect attempt failed");
                }
            }
        }
    }

    fn record_outcome(&self, started: Instant, result: &DriverResult<()>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => self.successful_requests.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed_requests.fetch_add(1, Ordering::Relaxed),
        };
        let elapsed = started.elapsed().as_millis() as u64;
        let prev = self.last_avg_response_time_ms.load(Ordering::Acquire);
        let avg = if prev == 0 {
            elapsed
        } else {
            (prev * 9 + elapsed) / 10
        };
        self.last_avg_response_time_ms.store(avg, Ordering::Release);
    }

    /// Parse each record's descriptor; records that do not parse are failed in place.
    fn parse_records<'a, P>(
        records: &'a mut [ChannelRecord],
        params: impl Fn(&OpcUaChannelDescriptor) -> P,
    ) -> Vec<Request<'a, P>> {
        let mut requests = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            match OpcUaChannelDescriptor::from_config(&record.channel_config) {
                Ok(descriptor) => requests.push(Request::new(params(&descriptor), record)),
                Err(e) => {
                    tracing::warn!(channel = %record.channel_name, error = %e, "OPC UA channel configuration rejected");
                    record.status = ChannelStatus::from(&e);
                    record.timestamp = now_millis();
                }
            }
        }
        requests
    }

    fn fail_requests<P>(requests: &mut [Request<'_, P>], error: &DriverError) {
        let status = ChannelStatus::from(error);
        let now = now_millis();
        for request in requests.iter_mut() {
            request.record.status = status.clone();
            request.record.timestamp = now;
        }
    }
}

#[async_trait]
impl Driver for OpcUaDriver {
    #[instrument(level = "info", skip_all)]
    async fn connect(&self) -> DriverResult<()> {
        self.inner.ensure_connected().await.map(|_| ())
    }

    #[instrument(level = "info", skip_all)]
    async fn disconnect(&self) -> DriverResult<()> {
        self.inner.close_current().await
    }

    #[instrument(level = "debug", skip_all, fields(count = records.len()))]
    async fn read(&self, records: &mut [ChannelRecord]) -> DriverResult<()> {
        let started = Instant::now();
        let mut requests = DriverInner::parse_records(records, |d| d.read_params());
        let result = if requests.is_empty() {
            Ok(())
        } else {
            match self.inner.ensure_connected().await {
                Ok(connection) => connection.read(&mut requests).await,
                Err(e) => {
                    DriverInner::fail_requests(&mut requests, &e);
                    Err(e)
                }
            }
        };
        self.inner.record_outcome(started, &result);
        result
    }

    #[instrument(level = "debug", skip_all, fields(count = records.len()))]
    async fn write(&self, records: &mut [ChannelRecord]) -> DriverResult<()> {
        let started = Instant::now();
        let mut requests = DriverInner::parse_records(records, |d| d.write_params());
        let result = if requests.is_empty() {
            Ok(())
        } else {
            match self.inner.ensure_connected().await {
                Ok(connection) => connection.write(&mut requests).await,
                Err(e) => {
                    DriverInner::fail_requests(&mut requests, &e);
                    Err(e)
                }
            }
        };
        self.inner.record_outcome(started, &result);
        result
    }

    #[instrument(level = "info", skip_all)]
    async fn register_channel_listener(
        &self,
        config: &ChannelConfig,
        listener: Arc<dyn ChannelListener>,
    ) -> DriverResult<()> {
        let descriptor = OpcUaChannelDescriptor::from_config(config)?;
        let registration = Arc::new(ListenRegistration::new(
            listener,
            Arc::clone(&descriptor.channel_name),
            descriptor.value_type,
            Arc::new(config.clone()),
        ));

        let inner = &self.inner;
        let mut slot = inner.connection.lock().await;
        match descriptor.listen_params() {
            ListenParams::Node(params) => {
                inner.node_registry.register(params, registration);
            }
            ListenParams::Subtree(params) => {
                inner
                    .subtree_registry
                    .register(params.clone(), Arc::clone(&registration));
                if let Some(connection) = slot.as_ref() {
                    connection
                        .subtrees()
                        .register_channel_listener(params, registration);
                }
            }
        }
        if slot.is_some() {
            return Ok(());
        }

        // Kept even when the connect fails; the reconnect loop applies it later.
        match inner.open_locked(&mut slot).await {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(slot);
                tracing::warn!(error = %e, "OPC UA connect for listener failed, will retry");
                inner.start_reconnect();
                Err(e)
            }
        }
    }

    #[instrument(level = "info", skip_all)]
    async fn unregister_channel_listener(
        &self,
        listener: &Arc<dyn ChannelListener>,
    ) -> DriverResult<()> {
        let slot = self.inner.connection.lock().await;
        self.inner.node_registry.unregister(listener);
        self.inner.subtree_registry.unregister(listener);
        if let Some(connection) = slot.as_ref() {
            connection.subtrees().unregister_channel_listener(listener);
        }
        Ok(())
    }

    fn subscribe_connection_state(&self) -> watch::Receiver<SouthwardConnectionState> {
        self.inner.conn_rx.clone()
    }

    async fn health_check(&self) -> DriverResult<DriverHealth> {
        let inner = &self.inner;
        let state = inner.conn_rx.borrow().clone();
        let mut details = HashMap::new();
        details.insert("connectionState".to_string(), json!(state.to_string()));
        details.insert("nodeListeners".to_string(), json!(inner.node_registry.len()));
        details.insert(
            "subtreeListeners".to_string(),
            json!(inner.subtree_registry.len()),
        );
        Ok(DriverHealth {
            status: match state {
                SouthwardConnectionState::Connected => HealthStatus::Healthy,
                SouthwardConnectionState::Connecting | SouthwardConnectionState::Reconnecting => {
                    HealthStatus::Degraded
                }
                SouthwardConnectionState::Disconnected => HealthStatus::Unknown,
                SouthwardConnectionState::Failed(_) => HealthStatus::Unhealthy,
            },
            last_activity: Utc::now(),
            error_count: inner.failed_requests.load(Ordering::Acquire),
            success_rate: {
                let total = inner.total_requests.load(Ordering::Acquire) as f64;
                if total > 0.0 {
                    inner.successful_requests.load(Ordering::Acquire) as f64 / total
                } else {
                    0.0
                }
            },
            average_response_time: Duration::from_millis(
                inner.last_avg_response_time_ms.load(Ordering::Acquire),
            ),
            details: Some(details),
        })
    }
}
