use crate::{
    certificate::CertificateManager,
    codec::{now_millis, OpcUaCodec},
    endpoint::{connect_first, discover, select_candidates},
    queue::{FailureHandler, SerialTaskQueue},
    registry::ListenerRegistry,
    request::{NodeListenParams, ReadParams, Request, SubtreeListenParams, WriteParams},
    session::{ConnectionLostHandler, ReadItem, SessionConfig, UaConnector, UaSession, WriteItem},
    subscribe::{SubscriptionManager, SubscriptionSettings},
    subtree::SubtreeSubscriptionManager,
    types::OpcUaOptions,
};
use ng_gateway_sdk::{ChannelStatus, DriverError, DriverResult};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::instrument;

/// Everything a connection attempt reads from its owner.
#[derive(Clone)]
pub struct ConnectionContext {
    pub connector: Arc<dyn UaConnector>,
    pub options: Arc<OpcUaOptions>,
    pub certificates: Arc<dyn CertificateManager>,
    pub node_registry: Arc<ListenerRegistry<NodeListenParams>>,
    pub subtree_registry: Arc<ListenerRegistry<SubtreeListenParams>>,
}

/// One open session with its task queue and subscription managers.
///
/// Never retries on its own: every failure goes to the failure handler and
/// the owner decides what to do with the connection.
pub struct ConnectionManager {
    session: Arc<dyn UaSession>,
    options: Arc<OpcUaOptions>,
    queue: Arc<SerialTaskQueue>,
    subscriptions: Arc<SubscriptionManager>,
    subtrees: Arc<SubtreeSubscriptionManager>,
    failure_handler: FailureHandler,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Discover endpoints, open a session on the first candidate that accepts
    /// and bring the subscriptions in line with the registries.
    #[instrument(level = "info", skip_all, fields(url = %ctx.options.discovery_url()))]
    pub async fn connect(
        ctx: &ConnectionContext,
        failure_handler: FailureHandler,
    ) -> DriverResult<Arc<Self>> {
        let options = Arc::clone(&ctx.options);
        let endpoints = discover(ctx.connector.as_ref(), &options).await?;
        let candidates = select_candidates(endpoints, &options)?;

        let certificate = if options.security_policy.is_secure() {
            ctx.certificates.client_certificate()?
        } else {
            None
        };
        let trust_server_certs = ctx.certificates.trust_server_certificates();
        let lost = Arc::clone(&failure_handler);
        let on_connection_lost: ConnectionLostHandler =
            Arc::new(move |reason: String| lost(DriverError::SessionError(reason)));

        let session = connect_first(ctx.connector.as_ref(), candidates, |endpoint| SessionConfig {
            endpoint,
            identity: options.auth.clone(),
            application_name: options.application_name.clone(),
            application_uri: options.application_uri.clone(),
            request_timeout: options.request_timeout(),
            session_timeout: options.session_timeout(),
            acknowledge_timeout: options.acknowledge_timeout(),
            certificate: certificate.clone(),
            trust_server_certs,
            on_connection_lost: Some(Arc::clone(&on_connection_lost)),
        })
        .await?;

        let queue = Arc::new(SerialTaskQueue::new(Some(Arc::clone(&failure_handler))));
        let settings = SubscriptionSettings {
            scope: "node",
            publish_interval: options.publish_interval(),
            batch_size: options.batch_size(),
        };
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&session),
            Arc::clone(&ctx.node_registry),
            Arc::clone(&queue),
            settings,
        );
        let subtrees = SubtreeSubscriptionManager::new(
            Arc::clone(&session),
            Arc::clone(&queue),
            SubscriptionSettings {
                scope: "subtree",
                ..settings
            },
            options.subtree_channel_name_format,
        );
        for (params, registrations) in ctx.subtree_registry.entries() {
            for registration in registrations {
                subtrees.register_channel_listener(params.clone(), registration);
            }
        }
        subscriptions.on_registrations_changed();

        Ok(Arc::new(Self {
            session,
            options,
            queue,
            subscriptions,
            subtrees,
            failure_handler,
            closed: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn session(&self) -> &Arc<dyn UaSession> {
        &self.session
    }

    #[inline]
    pub fn queue(&self) -> &Arc<SerialTaskQueue> {
        &self.queue
    }

    #[inline]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    #[inline]
    pub fn subtrees(&self) -> &Arc<SubtreeSubscriptionManager> {
        &self.subtrees
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark every record of a failed chunk and report the failure.
    fn fail_chunk<P>(&self, chunk: &mut [Request<'_, P>], error: DriverError) -> DriverError {
        let status = ChannelStatus::from(&error);
        let now = now_millis();
        for request in chunk.iter_mut() {
            request.record.status = status.clone();
            request.record.timestamp = now;
        }
        if !self.is_closed() {
            (self.failure_handler)(error.clone());
        }
        error
    }

    /// Read in batches; every record receives a status, and a value when good.
    #[instrument(level = "debug", skip_all, fields(count = requests.len()))]
    pub async fn read(&self, requests: &mut [Request<'_, ReadParams>]) -> DriverResult<()> {
        let timeout = self.options.request_timeout();
        for chunk in requests.chunks_mut(self.options.batch_size()) {
            let items: Vec<ReadItem> = chunk
                .iter()
                .map(|r| ReadItem {
                    node_id: r.params.node_id.clone(),
                    attribute_id: r.params.attribute.id(),
                })
                .collect();
            let values = match tokio::time::timeout(timeout, self.session.read(items)).await {
                Ok(Ok(values)) => values,
                Ok(Err(status)) => {
                    return Err(self.fail_chunk(
                        chunk,
                        DriverError::ProtocolError(format!("read failed: {status}")),
                    ))
                }
                Err(_) => return Err(self.fail_chunk(chunk, DriverError::Timeout(timeout))),
            };
            for (i, request) in chunk.iter_mut().enumerate() {
                match values.get(i) {
                    Some(dv) => OpcUaCodec::fill_value(request.record, dv),
                    None => {
                        request.record.fail("no read result returned");
                        request.record.timestamp = now_millis();
                    }
                }
            }
        }
        Ok(())
    }

    /// Write in batches. Records whose value cannot be converted fail locally
    /// and are not sent.
    #[instrument(level = "debug", skip_all, fields(count = requests.len()))]
    pub async fn write(&self, requests: &mut [Request<'_, WriteParams>]) -> DriverResult<()> {
        let timeout = self.options.request_timeout();
        for chunk in requests.chunks_mut(self.options.batch_size()) {
            let mut sent = Vec::with_capacity(chunk.len());
            let mut items = Vec::with_capacity(chunk.len());
            for (i, request) in chunk.iter_mut().enumerate() {
                match OpcUaCodec::variant_for_write(request.record) {
                    Ok(value) => {
                        sent.push(i);
                        items.push(WriteItem {
                            node_id: request.params.node_id.clone(),
                            attribute_id: request.params.attribute.id(),
                            value,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(channel = %request.record.channel_name, error = %e, "OPC UA write value rejected");
                        request.record.status = ChannelStatus::from(&e);
                        request.record.timestamp = now_millis();
                    }
                }
            }
            if items.is_empty() {
                continue;
            }

            let sent_at = now_millis();
            let statuses = match tokio::time::timeout(timeout, self.session.write(items)).await {
                Ok(Ok(statuses)) => statuses,
                Ok(Err(status)) => {
                    return Err(self.fail_chunk(
                        chunk,
                        DriverError::ProtocolError(format!("write failed: {status}")),
                    ))
                }
                Err(_) => return Err(self.fail_chunk(chunk, DriverError::Timeout(timeout))),
            };
            for (k, i) in sent.into_iter().enumerate() {
                let record = &mut *chunk[i].record;
                match statuses.get(k) {
                    Some(status) if status.is_good() => record.status = ChannelStatus::success(),
                    Some(status) => record.fail(format!("bad status: {status}")),
                    None => record.fail("no write result returned"),
                }
                record.timestamp = sent_at;
            }
        }
        Ok(())
    }

    /// Close both subscription managers and the session as the last queued task.
    #[instrument(level = "info", skip_all)]
    pub async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let subscriptions = Arc::clone(&self.subscriptions);
        let subtrees = Arc::clone(&self.subtrees);
        let session = Arc::clone(&self.session);
        self.queue
            .shutdown(move || async move {
                let (nodes, subtree) =
                    futures::future::join(subscriptions.close(), subtrees.close()).await;
                for result in [nodes, subtree] {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "OPC UA subscription close failed");
                    }
                }
                match session.disconnect().await {
                    Ok(()) => tracing::info!("OPC UA session closed"),
                    Err(status) => tracing::warn!(%status, "OPC UA disconnect failed"),
                }
                Ok(())
            })
            .await
    }
}
