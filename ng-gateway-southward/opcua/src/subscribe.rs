use crate::{
    codec::OpcUaCodec,
    queue::SerialTaskQueue,
    registry::{Dispatcher, ListenerRegistry, RegistryDiff, RegistryObserver},
    request::NodeListenParams,
    session::{
        MonitoredItemSpec, MonitoringFilter, NotificationSink, UaSession, EVENT_FIELDS,
    },
    types::MonitoredItemFailureKind,
};
use dashmap::DashMap;
use futures::future::join_all;
use ng_gateway_sdk::{DriverError, DriverResult};
use opcua::types::{DataValue, Variant};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionSettings {
    /// Label for log fields
    pub scope: &'static str,
    pub publish_interval: Duration,
    /// Max items per create/delete call
    pub batch_size: usize,
}

/// A monitored item as known to the client.
///
/// Items the server refused stay in the active set without a monitored item
/// id; they are never retried and never deleted on the server.
pub struct MonitoredItemHandle {
    params: NodeListenParams,
    client_handle: u32,
    monitored_item_id: Option<u32>,
    open: AtomicBool,
    dispatcher: Dispatcher<NodeListenParams>,
}

impl MonitoredItemHandle {
    #[inline]
    pub fn params(&self) -> &NodeListenParams {
        &self.params
    }

    #[inline]
    pub fn client_handle(&self) -> u32 {
        self.client_handle
    }

    #[inline]
    pub fn monitored_item_id(&self) -> Option<u32> {
        self.monitored_item_id
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.monitored_item_id.is_some()
    }

    /// Stop forwarding samples.
    #[inline]
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.is_valid() && self.open.load(Ordering::Acquire)
    }

    fn on_data_value(&self, value: &DataValue) {
        if self.is_open() {
            self.dispatcher
                .dispatch(|record| OpcUaCodec::fill_value(record, value));
        }
    }

    fn on_event(&self, fields: &[Variant]) {
        if self.is_open() {
            self.dispatcher
                .dispatch(|record| OpcUaCodec::fill_event(record, fields));
        }
    }
}

/// Routes notifications of one subscription to item handles by client handle.
struct ItemRouter {
    items: DashMap<u32, Arc<MonitoredItemHandle>>,
    manager: Weak<SubscriptionManager>,
}

impl ItemRouter {
    #[inline]
    fn get(&self, client_handle: u32) -> Option<Arc<MonitoredItemHandle>> {
        self.items.get(&client_handle).map(|e| Arc::clone(e.value()))
    }
}

impl NotificationSink for ItemRouter {
    fn on_data_value(&self, client_handle: u32, value: DataValue) {
        match self.get(client_handle) {
            Some(handle) => handle.on_data_value(&value),
            None => tracing::trace!(client_handle, "sample for unknown monitored item dropped"),
        }
    }

    fn on_event(&self, client_handle: u32, fields: Vec<Variant>) {
        match self.get(client_handle) {
            Some(handle) => handle.on_event(&fields),
            None => tracing::trace!(client_handle, "event for unknown monitored item dropped"),
        }
    }

    fn on_subscription_lost(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_subscription_transfer_failed();
        }
    }
}

pub enum SubscriptionState {
    Unsubscribed,
    Subscribed {
        subscription_id: u32,
        active: HashMap<NodeListenParams, Arc<MonitoredItemHandle>>,
    },
}

/// Keeps the monitored items of one subscription converged with a registry.
///
/// Registry changes bump `target` and enqueue a reconciliation on the
/// connection queue; a reconciliation records the target it started from in
/// `applied` once it completes, so runs with nothing new to apply are no-ops.
pub struct SubscriptionManager {
    session: Arc<dyn UaSession>,
    registry: Arc<ListenerRegistry<NodeListenParams>>,
    queue: Arc<SerialTaskQueue>,
    settings: SubscriptionSettings,
    state: Mutex<SubscriptionState>,
    router: Arc<ItemRouter>,
    target: AtomicU64,
    applied: AtomicU64,
    next_client_handle: AtomicU32,
    closed: AtomicBool,
    me: Weak<SubscriptionManager>,
}

impl SubscriptionManager {
    /// Create the manager and start observing `registry`.
    pub fn new(
        session: Arc<dyn UaSession>,
        registry: Arc<ListenerRegistry<NodeListenParams>>,
        queue: Arc<SerialTaskQueue>,
        settings: SubscriptionSettings,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me: &Weak<SubscriptionManager>| Self {
            session,
            registry,
            queue,
            settings,
            state: Mutex::new(SubscriptionState::Unsubscribed),
            router: Arc::new(ItemRouter {
                items: DashMap::new(),
                manager: me.clone(),
            }),
            target: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            next_client_handle: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });
        manager.registry.add_observer(manager.observer_handle());
        manager
    }

    #[inline]
    fn observer_handle(&self) -> Weak<dyn RegistryObserver> {
        self.me.clone()
    }

    #[inline]
    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }

    #[inline]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub async fn subscription_id(&self) -> Option<u32> {
        match &*self.state.lock().await {
            SubscriptionState::Subscribed {
                subscription_id, ..
            } => Some(*subscription_id),
            SubscriptionState::Unsubscribed => None,
        }
    }

    /// Handles currently in the active set, valid or not.
    pub async fn active_items(&self) -> Vec<Arc<MonitoredItemHandle>> {
        match &*self.state.lock().await {
            SubscriptionState::Subscribed { active, .. } => active.values().cloned().collect(),
            SubscriptionState::Unsubscribed => Vec::new(),
        }
    }

    /// Record a registry change and enqueue a reconciliation.
    pub fn on_registrations_changed(&self) {
        self.target.fetch_add(1, Ordering::AcqRel);
        let me = self.me.clone();
        self.queue.submit(move || async move {
            match me.upgrade() {
                Some(manager) => manager.update_subscription_state().await,
                None => Ok(()),
            }
        });
    }

    /// The server lost the subscription: forget it and rebuild from the registry.
    pub fn on_subscription_transfer_failed(&self) {
        tracing::warn!(scope = self.settings.scope, "OPC UA subscription lost, recreating");
        self.target.fetch_add(1, Ordering::AcqRel);
        let me = self.me.clone();
        self.queue.submit(move || async move {
            let Some(manager) = me.upgrade() else {
                return Ok(());
            };
            {
                let mut state = manager.state.lock().await;
                if let SubscriptionState::Subscribed { active, .. } =
                    std::mem::replace(&mut *state, SubscriptionState::Unsubscribed)
                {
                    manager.unwire(active.values());
                }
            }
            manager.update_subscription_state().await
        });
    }

    /// Converge the server-side items with the registry.
    pub async fn update_subscription_state(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let target = self.target.load(Ordering::Acquire);
        if self.applied.load(Ordering::Acquire) == target {
            return Ok(());
        }

        if matches!(*state, SubscriptionState::Unsubscribed) {
            if self.registry.is_empty() {
                self.applied.store(target, Ordering::Release);
                return Ok(());
            }
            let sink: Arc<dyn NotificationSink> = self.router.clone();
            let subscription_id = self
                .session
                .create_subscription(self.settings.publish_interval, sink)
                .await
                .map_err(|s| DriverError::SubscriptionError(format!("create subscription: {s}")))?;
            tracing::info!(
                scope = self.settings.scope,
                subscription_id,
                publish_interval_ms = self.settings.publish_interval.as_millis() as u64,
                "OPC UA subscription created"
            );
            *state = SubscriptionState::Subscribed {
                subscription_id,
                active: HashMap::new(),
            };
        }

        let teardown = match &mut *state {
            SubscriptionState::Subscribed {
                subscription_id,
                active,
            } => {
                let diff = self.registry.diff(active);
                if diff.create.is_empty() && diff.delete.len() == active.len() {
                    Some(*subscription_id)
                } else {
                    self.apply_diff(*subscription_id, active, diff).await?;
                    None
                }
            }
            SubscriptionState::Unsubscribed => None,
        };
        if let Some(subscription_id) = teardown {
            if let SubscriptionState::Subscribed { active, .. } =
                std::mem::replace(&mut *state, SubscriptionState::Unsubscribed)
            {
                self.teardown(subscription_id, active).await;
            }
        }

        self.applied.store(target, Ordering::Release);
        Ok(())
    }

    /// Stop observing the registry and delete the subscription, whatever the state.
    pub async fn close(&self) -> DriverResult<()> {
        self.closed.store(true, Ordering::Release);
        self.registry.remove_observer(&self.observer_handle());
        let mut state = self.state.lock().await;
        if let SubscriptionState::Subscribed {
            subscription_id,
            active,
        } = std::mem::replace(&mut *state, SubscriptionState::Unsubscribed)
        {
            self.teardown(subscription_id, active).await;
        }
        Ok(())
    }

    fn unwire<'a>(&self, handles: impl Iterator<Item = &'a Arc<MonitoredItemHandle>>) {
        for handle in handles {
            handle.close();
            self.router.items.remove(&handle.client_handle);
        }
    }

    async fn teardown(
        &self,
        subscription_id: u32,
        active: HashMap<NodeListenParams, Arc<MonitoredItemHandle>>,
    ) {
        self.unwire(active.values());
        match self.session.delete_subscription(subscription_id).await {
            Ok(status) if status.is_good() => tracing::info!(
                scope = self.settings.scope,
                subscription_id,
                "OPC UA subscription deleted"
            ),
            Ok(status) => tracing::warn!(
                scope = self.settings.scope,
                subscription_id,
                %status,
                "OPC UA delete_subscription returned bad status"
            ),
            Err(e) => tracing::warn!(
                scope = self.settings.scope,
                subscription_id,
                error = %e,
                "OPC UA delete_subscription failed"
            ),
        }
    }

    async fn apply_diff(
        &self,
        subscription_id: u32,
        active: &mut HashMap<NodeListenParams, Arc<MonitoredItemHandle>>,
        diff: RegistryDiff<NodeListenParams>,
    ) -> DriverResult<()> {
        tracing::debug!(
            scope = self.settings.scope,
            subscription_id,
            create = diff.create.len(),
            delete = diff.delete.len(),
            "OPC UA reconciling monitored items"
        );

        // Unwire before the server call so late samples are never dispatched.
        let mut delete_ids = Vec::with_capacity(diff.delete.len());
        for params in &diff.delete {
            if let Some(handle) = active.remove(params) {
                self.unwire(std::iter::once(&handle));
                match handle.monitored_item_id() {
                    Some(id) => delete_ids.push(id),
                    None => tracing::debug!(
                        scope = self.settings.scope,
                        node_id = %params.node_id,
                        "dropping invalid monitored item without server delete"
                    ),
                }
            }
        }

        let specs: Vec<(NodeListenParams, MonitoredItemSpec)> = diff
            .create
            .into_iter()
            .map(|params| {
                let client_handle = self.next_client_handle.fetch_add(1, Ordering::Relaxed);
                let spec = build_spec(&params, client_handle);
                (params, spec)
            })
            .collect();

        let ((), (created, error)) = futures::future::join(
            self.delete_items(subscription_id, delete_ids),
            self.create_items(subscription_id, specs),
        )
        .await;

        for handle in created {
            if handle.is_valid() {
                self.router
                    .items
                    .insert(handle.client_handle, Arc::clone(&handle));
            }
            active.insert(handle.params.clone(), handle);
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn create_items(
        &self,
        subscription_id: u32,
        specs: Vec<(NodeListenParams, MonitoredItemSpec)>,
    ) -> (Vec<Arc<MonitoredItemHandle>>, Option<DriverError>) {
        let batch_size = self.settings.batch_size.max(1);
        let batches = specs.chunks(batch_size).map(|chunk| async move {
            let items: Vec<MonitoredItemSpec> = chunk.iter().map(|(_, spec)| spec.clone()).collect();
            let result = self
                .session
                .create_monitored_items(subscription_id, items)
                .await;
            (chunk, result)
        });

        let mut handles = Vec::with_capacity(specs.len());
        let mut error = None;
        for (chunk, result) in join_all(batches).await {
            let results = match result {
                Ok(results) => results,
                Err(status) => {
                    tracing::error!(
                        scope = self.settings.scope,
                        subscription_id,
                        items = chunk.len(),
                        %status,
                        "OPC UA create_monitored_items RPC failed for chunk"
                    );
                    error = Some(DriverError::SubscriptionError(format!(
                        "create monitored items: {status}"
                    )));
                    continue;
                }
            };
            if results.len() != chunk.len() {
                tracing::error!(
                    scope = self.settings.scope,
                    subscription_id,
                    expected = chunk.len(),
                    actual = results.len(),
                    "OPC UA create_monitored_items returned mismatched result length"
                );
            }
            for (i, (params, spec)) in chunk.iter().enumerate() {
                let monitored_item_id = match results.get(i) {
                    Some(created) if created.status.is_good() => Some(created.monitored_item_id),
                    Some(created) => {
                        let failure_kind: MonitoredItemFailureKind = created.status.into();
                        tracing::warn!(
                            scope = self.settings.scope,
                            subscription_id,
                            node_id = %params.node_id,
                            status = %created.status,
                            failure_kind = failure_kind.as_str(),
                            "OPC UA monitored item creation failed for node"
                        );
                        None
                    }
                    None => None,
                };
                handles.push(Arc::new(MonitoredItemHandle {
                    params: params.clone(),
                    client_handle: spec.client_handle,
                    monitored_item_id,
                    open: AtomicBool::new(true),
                    dispatcher: self.registry.dispatcher(params.clone()),
                }));
            }
        }
        (handles, error)
    }

    async fn delete_items(&self, subscription_id: u32, ids: Vec<u32>) {
        if ids.is_empty() {
            return;
        }
        let batch_size = self.settings.batch_size.max(1);
        let batches = ids.chunks(batch_size).map(|chunk| async move {
            let result = self
                .session
                .delete_monitored_items(subscription_id, chunk.to_vec())
                .await;
            (chunk, result)
        });
        for (chunk, result) in join_all(batches).await {
            match result {
                Ok(statuses) => {
                    for (id, status) in chunk.iter().zip(statuses.iter()) {
                        if !status.is_good() {
                            tracing::warn!(
                                scope = self.settings.scope,
                                subscription_id,
                                monitored_item_id = *id,
                                %status,
                                "OPC UA monitored item delete failed"
                            );
                        }
                    }
                }
                Err(status) => tracing::warn!(
                    scope = self.settings.scope,
                    subscription_id,
                    items = chunk.len(),
                    %status,
                    "OPC UA delete_monitored_items RPC failed for chunk"
                ),
            }
        }
    }
}

impl RegistryObserver for SubscriptionManager {
    fn on_registrations_changed(&self) {
        SubscriptionManager::on_registrations_changed(self);
    }
}

fn build_spec(params: &NodeListenParams, client_handle: u32) -> MonitoredItemSpec {
    let (sampling_interval_ms, filter) = if params.is_event() {
        (
            0.0,
            MonitoringFilter::Event {
                fields: EVENT_FIELDS.to_vec(),
            },
        )
    } else {
        (
            params.sampling_interval.as_secs_f64() * 1000.0,
            MonitoringFilter::None,
        )
    };
    MonitoredItemSpec {
        client_handle,
        node_id: params.node_id.clone(),
        attribute_id: params.attribute.id(),
        sampling_interval_ms,
        queue_size: params.queue_size,
        discard_oldest: params.discard_oldest,
        filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeKind;
    use opcua::types::NodeId;

    fn params(attribute: AttributeKind) -> NodeListenParams {
        NodeListenParams {
            node_id: NodeId::new(2, 7u32),
            attribute,
            sampling_interval: Duration::from_millis(250),
            queue_size: 5,
            discard_oldest: false,
        }
    }

    #[test]
    fn test_value_item_uses_listen_settings() {
        let spec = build_spec(&params(AttributeKind::Value), 9);
        assert_eq!(spec.client_handle, 9);
        assert_eq!(spec.attribute_id, 13);
        assert_eq!(spec.sampling_interval_ms, 250.0);
        assert_eq!(spec.queue_size, 5);
        assert!(!spec.discard_oldest);
        assert_eq!(spec.filter, MonitoringFilter::None);
    }

    #[test]
    fn test_event_item_uses_event_filter() {
        let spec = build_spec(&params(AttributeKind::EventNotifier), 1);
        assert_eq!(spec.attribute_id, 12);
        assert_eq!(spec.sampling_interval_ms, 0.0);
        assert_eq!(
            spec.filter,
            MonitoringFilter::Event {
                fields: vec!["Time", "Message"]
            }
        );
    }
}
