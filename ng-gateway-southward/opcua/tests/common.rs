#![allow(dead_code)]

use async_trait::async_trait;
use ng_driver_opcua::{
    session::{
        BrowsePage, BrowseReference, CreatedItem, Endpoint, MonitoredItemSpec, NotificationSink,
        ReadItem, SessionConfig, UaConnector, UaSession, WriteItem,
    },
    types::SecurityPolicy,
    ListenRegistration, OpcUaOptions,
};
use ng_gateway_sdk::{
    ChannelConfig, ChannelEvent, ChannelListener, ChannelRecord, DataType, DriverError,
    DriverResult,
};
use opcua::types::{
    ByteString, DataValue, MessageSecurityMode, NodeClass, NodeId, QualifiedName, StatusCode,
    Variant,
};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// Poll `check` until it holds or two seconds of (possibly paused) time pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

/// Server calls recorded by [`MockSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Read(Vec<NodeId>),
    Write(Vec<NodeId>),
    Browse(NodeId),
    BrowseNext { release: bool },
    CreateSubscription,
    CreateItems(Vec<MonitoredItemSpec>),
    DeleteItems(Vec<u32>),
    DeleteSubscription(u32),
    Disconnect,
}

/// In-memory session recording every call.
#[derive(Default)]
pub struct MockSession {
    calls: Mutex<Vec<Call>>,
    values: Mutex<HashMap<NodeId, DataValue>>,
    write_status: Mutex<HashMap<NodeId, StatusCode>>,
    read_delays: Mutex<VecDeque<Duration>>,
    write_delays: Mutex<VecDeque<Duration>>,
    fail_reads: AtomicBool,
    bad_items: Mutex<HashSet<NodeId>>,
    pages: Mutex<HashMap<NodeId, Vec<Vec<BrowseReference>>>>,
    continuations: Mutex<HashMap<Vec<u8>, (NodeId, usize)>>,
    browse_gate: Mutex<Option<CancellationToken>>,
    next_gate: Mutex<Option<CancellationToken>>,
    sink: Mutex<Option<Arc<dyn NotificationSink>>>,
    items: Mutex<HashMap<u32, MonitoredItemSpec>>,
    next_subscription_id: AtomicU32,
    next_item_id: AtomicU32,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_subscription_id: AtomicU32::new(100),
            next_item_id: AtomicU32::new(1),
            ..Default::default()
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn set_value(&self, node: NodeId, value: Variant) {
        self.values.lock().unwrap().insert(
            node,
            DataValue {
                value: Some(value),
                status: Some(StatusCode::Good),
                ..Default::default()
            },
        );
    }

    pub fn set_data_value(&self, node: NodeId, value: DataValue) {
        self.values.lock().unwrap().insert(node, value);
    }

    pub fn set_write_status(&self, node: NodeId, status: StatusCode) {
        self.write_status.lock().unwrap().insert(node, status);
    }

    /// Delay the next reads, one entry per call.
    pub fn delay_reads(&self, delays: impl IntoIterator<Item = Duration>) {
        self.read_delays.lock().unwrap().extend(delays);
    }

    /// Each write call consumes the next delay, if any.
    pub fn delay_writes(&self, delays: impl IntoIterator<Item = Duration>) {
        self.write_delays.lock().unwrap().extend(delays);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Monitored items on `node` are refused by the server.
    pub fn refuse_item(&self, node: NodeId) {
        self.bad_items.lock().unwrap().insert(node);
    }

    /// Children of `node`, one inner vec per browse page.
    pub fn set_children(&self, node: NodeId, pages: Vec<Vec<BrowseReference>>) {
        self.pages.lock().unwrap().insert(node, pages);
    }

    /// Browse calls block until [`MockSession::release_browse`].
    pub fn hold_browse(&self) {
        *self.browse_gate.lock().unwrap() = Some(CancellationToken::new());
    }

    /// Like [`MockSession::hold_browse`] for continuation pages only.
    pub fn hold_browse_next(&self) {
        *self.next_gate.lock().unwrap() = Some(CancellationToken::new());
    }

    pub fn release_browse(&self) {
        for gate in [&self.browse_gate, &self.next_gate] {
            if let Some(gate) = gate.lock().unwrap().take() {
                gate.cancel();
            }
        }
    }

    pub fn live_items(&self) -> Vec<MonitoredItemSpec> {
        self.items.lock().unwrap().values().cloned().collect()
    }

    pub fn outstanding_continuations(&self) -> usize {
        self.continuations.lock().unwrap().len()
    }

    /// Push a data change for every live item monitoring `node`.
    pub fn publish(&self, node: &NodeId, value: Variant) -> usize {
        let Some(sink) = self.sink.lock().unwrap().clone() else {
            return 0;
        };
        let handles: Vec<u32> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|spec| &spec.node_id == node)
            .map(|spec| spec.client_handle)
            .collect();
        for handle in &handles {
            sink.on_data_value(
                *handle,
                DataValue {
                    value: Some(value.clone()),
                    status: Some(StatusCode::Good),
                    ..Default::default()
                },
            );
        }
        handles.len()
    }

    /// Push an event with `[Time, Message]` fields.
    pub fn publish_event(&self, node: &NodeId, fields: Vec<Variant>) {
        let Some(sink) = self.sink.lock().unwrap().clone() else {
            return;
        };
        let handles: Vec<u32> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|spec| &spec.node_id == node)
            .map(|spec| spec.client_handle)
            .collect();
        for handle in handles {
            sink.on_event(handle, fields.clone());
        }
    }

    pub fn lose_subscription(&self) {
        if let Some(sink) = self.sink.lock().unwrap().clone() {
            sink.on_subscription_lost();
        }
    }

    fn page(&self, node: &NodeId, index: usize) -> BrowsePage {
        let pages = self.pages.lock().unwrap();
        let Some(node_pages) = pages.get(node) else {
            return BrowsePage::default();
        };
        let references = node_pages.get(index).cloned().unwrap_or_default();
        let continuation_point = (index + 1 < node_pages.len()).then(|| {
            let token = format!("{node}#{}", index + 1).into_bytes();
            self.continuations
                .lock()
                .unwrap()
                .insert(token.clone(), (node.clone(), index + 1));
            ByteString::from(token)
        });
        BrowsePage {
            references,
            continuation_point,
        }
    }

    async fn wait_gate(&self, gate: &Mutex<Option<CancellationToken>>) {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.cancelled().await;
        }
    }
}

#[async_trait]
impl UaSession for MockSession {
    async fn read(&self, items: Vec<ReadItem>) -> Result<Vec<DataValue>, StatusCode> {
        self.record(Call::Read(items.iter().map(|i| i.node_id.clone()).collect()));
        let delay = self.read_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StatusCode::BadCommunicationError);
        }
        let values = self.values.lock().unwrap();
        Ok(items
            .iter()
            .map(|item| {
                values.get(&item.node_id).cloned().unwrap_or(DataValue {
                    status: Some(StatusCode::BadNodeIdUnknown),
                    ..Default::default()
                })
            })
            .collect())
    }

    async fn write(&self, items: Vec<WriteItem>) -> Result<Vec<StatusCode>, StatusCode> {
        self.record(Call::Write(items.iter().map(|i| i.node_id.clone()).collect()));
        let delay = self.write_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let statuses = self.write_status.lock().unwrap();
        let mut values = self.values.lock().unwrap();
        Ok(items
            .into_iter()
            .map(|item| {
                let status = statuses.get(&item.node_id).copied().unwrap_or(StatusCode::Good);
                if status.is_good() {
                    values.insert(
                        item.node_id,
                        DataValue {
                            value: Some(item.value),
                            status: Some(StatusCode::Good),
                            ..Default::default()
                        },
                    );
                }
                status
            })
            .collect())
    }

    async fn browse(&self, node: &NodeId) -> Result<BrowsePage, StatusCode> {
        self.record(Call::Browse(node.clone()));
        self.wait_gate(&self.browse_gate).await;
        if !self.pages.lock().unwrap().contains_key(node) {
            return Err(StatusCode::BadNodeIdUnknown);
        }
        Ok(self.page(node, 0))
    }

    async fn browse_next(
        &self,
        continuation_point: ByteString,
        release: bool,
    ) -> Result<BrowsePage, StatusCode> {
        self.record(Call::BrowseNext { release });
        let key = continuation_point.value.clone().unwrap_or_default();
        let Some((node, index)) = self.continuations.lock().unwrap().remove(&key) else {
            return Err(StatusCode::BadContinuationPointInvalid);
        };
        if release {
            return Ok(BrowsePage::default());
        }
        self.wait_gate(&self.next_gate).await;
        Ok(self.page(&node, index))
    }

    async fn create_subscription(
        &self,
        _publish_interval: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<u32, StatusCode> {
        self.record(Call::CreateSubscription);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(self.next_subscription_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn create_monitored_items(
        &self,
        _subscription_id: u32,
        items: Vec<MonitoredItemSpec>,
    ) -> Result<Vec<CreatedItem>, StatusCode> {
        self.record(Call::CreateItems(items.clone()));
        let bad = self.bad_items.lock().unwrap().clone();
        let mut live = self.items.lock().unwrap();
        Ok(items
            .into_iter()
            .map(|spec| {
                if bad.contains(&spec.node_id) {
                    return CreatedItem {
                        status: StatusCode::BadNodeIdUnknown,
                        monitored_item_id: 0,
                    };
                }
                let id = self.next_item_id.fetch_add(1, Ordering::SeqCst);
                live.insert(id, spec);
                CreatedItem {
                    status: StatusCode::Good,
                    monitored_item_id: id,
                }
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        _subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.record(Call::DeleteItems(monitored_item_ids.clone()));
        let mut live = self.items.lock().unwrap();
        Ok(monitored_item_ids
            .iter()
            .map(|id| match live.remove(id) {
                Some(_) => StatusCode::Good,
                None => StatusCode::BadMonitoredItemIdInvalid,
            })
            .collect())
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<StatusCode, StatusCode> {
        self.record(Call::DeleteSubscription(subscription_id));
        self.items.lock().unwrap().clear();
        *self.sink.lock().unwrap() = None;
        Ok(StatusCode::Good)
    }

    async fn disconnect(&self) -> Result<(), StatusCode> {
        self.record(Call::Disconnect);
        Ok(())
    }
}

/// Connector handing out [`MockSession`]s.
#[derive(Default)]
pub struct MockConnector {
    endpoints: Mutex<Vec<Endpoint>>,
    refused_urls: Mutex<HashSet<String>>,
    refuse_all: AtomicBool,
    attempts: Mutex<Vec<SessionConfig>>,
    /// Sessions handed out by the next connects, in order; fresh ones afterwards
    queued: Mutex<VecDeque<Arc<MockSession>>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new(endpoints: Vec<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(endpoints),
            ..Default::default()
        })
    }

    /// Advertises one `None` endpoint under a host name different from the
    /// configured address.
    pub fn plain() -> Arc<Self> {
        Self::new(vec![Endpoint::new(
            "opc.tcp://plc-host:4840",
            SecurityPolicy::None.uri(),
            MessageSecurityMode::None,
        )])
    }

    pub fn refuse(&self, url: &str) {
        self.refused_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn queue_session(&self, session: Arc<MockSession>) {
        self.queued.lock().unwrap().push_back(session);
    }

    pub fn attempted_urls(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.endpoint.url.clone())
            .collect()
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.attempts.lock().unwrap().last().cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    /// Simulate a transport loss on the most recent session.
    pub fn drop_connection(&self) {
        if let Some(handler) = self.last_config().and_then(|c| c.on_connection_lost) {
            handler("connection lost: BadConnectionClosed".to_string());
        }
    }
}

#[async_trait]
impl UaConnector for MockConnector {
    async fn get_endpoints(&self, discovery_url: &str) -> DriverResult<Vec<Endpoint>> {
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionError(format!(
                "{discovery_url} unreachable"
            )));
        }
        Ok(self.endpoints.lock().unwrap().clone())
    }

    async fn connect(&self, config: SessionConfig) -> DriverResult<Arc<dyn UaSession>> {
        let url = config.endpoint.url.clone();
        self.attempts.lock().unwrap().push(config);
        if self.refuse_all.load(Ordering::SeqCst) || self.refused_urls.lock().unwrap().contains(&url) {
            return Err(DriverError::ConnectionError(format!("{url} refused")));
        }
        let session = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockSession::new);
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Listener collecting every record it receives.
#[derive(Default)]
pub struct RecordingListener {
    records: Mutex<Vec<ChannelRecord>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<ChannelRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl ChannelListener for RecordingListener {
    fn on_channel_event(&self, event: ChannelEvent) {
        self.records.lock().unwrap().push(event.record);
    }
}

pub fn options() -> OpcUaOptions {
    OpcUaOptions::new("10.0.0.5", 4840)
}

/// Numeric node in namespace 2.
pub fn node(id: u32) -> NodeId {
    NodeId::new(2, id)
}

pub fn variable(id: u32, name: &str) -> BrowseReference {
    BrowseReference {
        node_id: Some(node(id)),
        browse_name: QualifiedName::new(2, name),
        node_class: NodeClass::Variable,
        type_definition: Some(NodeId::new(0, 63u32)),
    }
}

pub fn folder(id: u32, name: &str) -> BrowseReference {
    BrowseReference {
        node_id: Some(node(id)),
        browse_name: QualifiedName::new(2, name),
        node_class: NodeClass::Object,
        type_definition: Some(NodeId::new(0, 61u32)),
    }
}

/// Channel config for numeric node `ns=2;i=id`.
pub fn channel_config(id: u32, name: &str, value_type: &str) -> ChannelConfig {
    let value = json!({
        "node.id": id.to_string(),
        "node.namespace.index": 2,
        "node.id.type": "NUMERIC",
        "+value.type": value_type,
        "+name": name,
    });
    match value {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub fn record(id: u32, name: &str, value_type: DataType) -> ChannelRecord {
    let type_name = match value_type {
        DataType::Int32 => "INTEGER",
        DataType::Float64 => "DOUBLE",
        DataType::Boolean => "BOOLEAN",
        DataType::String => "STRING",
        _ => "INTEGER",
    };
    ChannelRecord::new(name, value_type, channel_config(id, name, type_name))
}

pub fn registration(
    listener: &Arc<dyn ChannelListener>,
    name: &str,
    value_type: DataType,
) -> Arc<ListenRegistration> {
    Arc::new(ListenRegistration::new(
        Arc::clone(listener),
        Arc::from(name),
        value_type,
        Arc::new(ChannelConfig::new()),
    ))
}
