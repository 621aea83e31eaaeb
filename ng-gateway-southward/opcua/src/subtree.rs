use crate::{
    browse::{TreeVisit, VisitOutcome},
    queue::SerialTaskQueue,
    registry::{ListenRegistration, ListenerRegistry},
    request::{NodeListenParams, SubtreeListenParams},
    session::{BrowseReference, UaSession},
    subscribe::{SubscriptionManager, SubscriptionSettings},
    types::ChannelNameFormat,
};
use ng_gateway_sdk::{ChannelListener, DriverResult, ListenerKey};
use opcua::types::NodeClass;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct PendingVisit {
    listener: ListenerKey,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Expands subtree listen requests into single-node monitored items.
///
/// Each request starts a [`TreeVisit`]; the variables it finds are registered
/// in one batch into a private registry served by a nested
/// [`SubscriptionManager`].
pub struct SubtreeSubscriptionManager {
    session: Arc<dyn UaSession>,
    registry: Arc<ListenerRegistry<NodeListenParams>>,
    subscriptions: Arc<SubscriptionManager>,
    name_format: ChannelNameFormat,
    pending: Mutex<HashMap<u64, PendingVisit>>,
    next_visit: AtomicU64,
    me: Weak<SubtreeSubscriptionManager>,
}

impl SubtreeSubscriptionManager {
    pub fn new(
        session: Arc<dyn UaSession>,
        queue: Arc<SerialTaskQueue>,
        settings: SubscriptionSettings,
        name_format: ChannelNameFormat,
    ) -> Arc<Self> {
        let registry = ListenerRegistry::new();
        let subscriptions =
            SubscriptionManager::new(Arc::clone(&session), Arc::clone(&registry), queue, settings);
        Arc::new_cyclic(|me| Self {
            session,
            registry,
            subscriptions,
            name_format,
            pending: Mutex::new(HashMap::new()),
            next_visit: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    #[inline]
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingVisit>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registry holding the expanded single-node registrations.
    #[inline]
    pub fn registry(&self) -> &Arc<ListenerRegistry<NodeListenParams>> {
        &self.registry
    }

    #[inline]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    #[inline]
    pub fn pending_visits(&self) -> usize {
        self.lock_pending().len()
    }

    /// Start discovering variables under `params.root` for `registration`.
    pub fn register_channel_listener(
        &self,
        params: SubtreeListenParams,
        registration: Arc<ListenRegistration>,
    ) {
        let id = self.next_visit.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let listener = registration.listener_key();
        let me = self.me.clone();
        let visit_token = token.clone();

        let mut pending = self.lock_pending();
        let task = tokio::spawn(async move {
            if let Some(manager) = me.upgrade() {
                manager.expand(id, params, registration, visit_token).await;
            }
        });
        pending.insert(
            id,
            PendingVisit {
                listener,
                token,
                task,
            },
        );
    }

    async fn expand(
        &self,
        id: u64,
        params: SubtreeListenParams,
        registration: Arc<ListenRegistration>,
        token: CancellationToken,
    ) {
        let visit = TreeVisit::with_token(params.root.clone(), token);
        let found: Mutex<Vec<(NodeListenParams, Arc<ListenRegistration>)>> = Mutex::new(Vec::new());
        let name_format = self.name_format;
        let visitor = |reference: &BrowseReference, path: &[String]| {
            if reference.node_class != NodeClass::Variable {
                return;
            }
            let Some(node_id) = reference.node_id.clone() else {
                return;
            };
            let channel_name: Arc<str> = match name_format {
                ChannelNameFormat::BrowsePath => {
                    Arc::from(format!("{}/{}", registration.channel_name, path.join("/")))
                }
                ChannelNameFormat::NodeId => Arc::from(node_id.to_string()),
            };
            found
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((params.child(node_id), Arc::new(registration.renamed(channel_name))));
        };

        let outcome = visit.run(self.session.as_ref(), &visitor).await;
        let found = found.into_inner().unwrap_or_else(|e| e.into_inner());

        // Decided under the pending lock so a concurrent unregister either
        // cancels before this point or sees the registrations afterwards.
        let mut pending = self.lock_pending();
        match outcome {
            Ok(VisitOutcome::Completed) if !visit.is_cancelled() => {
                pending.remove(&id);
                tracing::info!(
                    root = %params.root,
                    channel = %registration.channel_name,
                    variables = found.len(),
                    "OPC UA subtree expanded"
                );
                self.registry.register_all(found);
            }
            Ok(_) => {
                tracing::debug!(root = %params.root, "OPC UA subtree visit cancelled");
            }
            Err(e) => {
                pending.remove(&id);
                tracing::warn!(
                    root = %params.root,
                    channel = %registration.channel_name,
                    error = %e,
                    "OPC UA subtree visit failed, registration dropped"
                );
            }
        }
    }

    /// Cancel pending visits of `listener` and drop its expanded registrations.
    pub fn unregister_channel_listener(&self, listener: &Arc<dyn ChannelListener>) {
        let key = ListenerKey::of(listener);
        {
            let mut pending = self.lock_pending();
            pending.retain(|_, visit| {
                if visit.listener == key {
                    visit.token.cancel();
                    false
                } else {
                    true
                }
            });
        }
        self.registry.unregister(listener);
    }

    /// Cancel every pending visit, wait for them and close the nested manager.
    pub async fn close(&self) -> DriverResult<()> {
        let visits: Vec<PendingVisit> = self.lock_pending().drain().map(|(_, v)| v).collect();
        for visit in &visits {
            visit.token.cancel();
        }
        for visit in visits {
            if let Err(e) = visit.task.await {
                tracing::debug!(error = %e, "OPC UA subtree visit task ended abnormally");
            }
        }
        self.subscriptions.close().await
    }
}
