use crate::{
    session::{
        BrowsePage, BrowseReference, ConnectionLostHandler, CreatedItem, Endpoint,
        MonitoredItemSpec, MonitoringFilter, NotificationSink, ReadItem, SessionConfig,
        UaConnector, UaSession, WriteItem,
    },
    types::OpcUaAuth,
};
use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use ng_gateway_sdk::{DriverError, DriverResult};
use opcua::{
    client::{
        ClientBuilder, IdentityToken, MonitoredItem, Session, SessionActivity,
        SessionEventLoop, SessionPollResult, SubscriptionCallbacks,
    },
    types::{
        enums::MonitoringMode, BrowseDescription, BrowseDirection, BrowseResult, ByteString,
        ContentFilter, DataValue, EndpointDescription, EventFilter, ExtensionObject,
        MonitoredItemCreateRequest, MonitoringParameters, NodeId, QualifiedName, ReadValueId,
        SimpleAttributeOperand, StatusCode, TimestampsToReturn, Variant, WriteValue,
    },
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// HierarchicalReferences
const HIERARCHICAL_REFERENCES: u32 = 33;
/// BaseEventType
const BASE_EVENT_TYPE: u32 = 2041;
/// Object | Variable
const BROWSE_NODE_CLASS_MASK: u32 = 0x1 | 0x2;
/// Every ReferenceDescription field
const BROWSE_RESULT_MASK: u32 = 0x3f;
const VALUE_ATTRIBUTE: u32 = 13;

fn identity_token(auth: &OpcUaAuth) -> IdentityToken {
    match auth {
        OpcUaAuth::Anonymous => IdentityToken::Anonymous,
        OpcUaAuth::UserPassword { username, password } => {
            IdentityToken::UserName(username.clone(), password.clone())
        }
    }
}

fn build_client(config: Option<&SessionConfig>) -> DriverResult<opcua::client::Client> {
    let mut builder = ClientBuilder::new().pki_dir("./pki").session_retry_limit(0);
    builder = match config {
        None => builder
            .application_name("ng-gateway OPC UA discovery")
            .application_uri("urn:ng-gateway:opcua:discovery")
            .trust_server_certs(false)
            .create_sample_keypair(false),
        Some(config) => {
            let secure = config.endpoint.security_policy_uri
                != crate::types::SecurityPolicy::None.uri();
            let builder = builder
                .application_name(&config.application_name)
                .application_uri(&config.application_uri)
                .session_timeout(config.session_timeout.as_millis().min(u32::MAX as u128) as u32)
                .trust_server_certs(config.trust_server_certs || (secure && config.certificate.is_none()));
            match &config.certificate {
                Some(cert) => builder
                    .certificate_path(cert.certificate_path.clone())
                    .private_key_path(cert.private_key_path.clone())
                    .create_sample_keypair(false),
                None => builder.create_sample_keypair(secure),
            }
        }
    };
    builder
        .client()
        .map_err(|e| DriverError::SessionError(format!("OPC UA build client error: {:?}", e)))
}

/// Production connector over async-opcua.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpcUaConnector;

#[async_trait]
impl UaConnector for OpcUaConnector {
    async fn get_endpoints(&self, discovery_url: &str) -> DriverResult<Vec<Endpoint>> {
        let mut client = build_client(None)?;
        let endpoints = client
            .get_server_endpoints_from_url(discovery_url)
            .await
            .map_err(|status| {
                DriverError::ConnectionError(format!(
                    "OPC UA get endpoints error from {discovery_url}: {status}"
                ))
            })?;
        Ok(endpoints
            .into_iter()
            .map(|description| Endpoint {
                url: description.endpoint_url.as_ref().to_string(),
                security_policy_uri: description.security_policy_uri.as_ref().to_string(),
                security_mode: description.security_mode,
                description: Some(Arc::new(description)),
            })
            .collect())
    }

    async fn connect(&self, config: SessionConfig) -> DriverResult<Arc<dyn UaSession>> {
        let mut client = build_client(Some(&config))?;
        let mut description: EndpointDescription = match &config.endpoint.description {
            Some(description) => description.as_ref().clone(),
            None => EndpointDescription {
                security_policy_uri: config.endpoint.security_policy_uri.as_str().into(),
                security_mode: config.endpoint.security_mode,
                ..Default::default()
            },
        };
        description.endpoint_url = config.endpoint.url.as_str().into();

        let (session, event_loop) = client
            .connect_to_endpoint_directly(description, identity_token(&config.identity))
            .map_err(|e| DriverError::ConnectionError(format!("OPC UA connect-direct error: {e}")))?;

        let closing = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_event_loop(
            event_loop,
            ready_tx,
            config.on_connection_lost.clone(),
            Arc::clone(&closing),
            cancel.clone(),
        ));

        let ready = tokio::time::timeout(config.request_timeout, ready_rx).await;
        let failure = match ready {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(DriverError::ConnectionError(reason)),
            Ok(Err(_)) => Some(DriverError::ConnectionError(
                "OPC UA event loop ended before the session activated".to_string(),
            )),
            Err(_) => Some(DriverError::Timeout(config.request_timeout)),
        };
        if let Some(error) = failure {
            closing.store(true, Ordering::Release);
            session.disable_reconnects();
            cancel.cancel();
            return Err(error);
        }

        Ok(Arc::new(OpcUaSession {
            session,
            closing,
            cancel,
        }))
    }
}

/// Drive the session event loop. The first activation is reported on
/// `ready`; a later loss goes to `on_lost` unless the session is closing.
async fn run_event_loop(
    event_loop: SessionEventLoop,
    ready: oneshot::Sender<Result<(), String>>,
    on_lost: Option<ConnectionLostHandler>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let stream = event_loop.enter();
    pin_mut!(stream);
    let mut ready = Some(ready);
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(SessionPollResult::Reconnected(_))) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Some(Ok(SessionPollResult::SessionActivity(SessionActivity::KeepAliveFailed(code)))) => {
                    tracing::warn!(status = %code, "OPC UA keep-alive failed");
                }
                Some(Ok(SessionPollResult::ConnectionLost(code))) => {
                    break format!("connection lost: {code}");
                }
                Some(Ok(_)) => {}
                Some(Err(code)) => break format!("event loop error: {code}"),
                None => break "event loop ended".to_string(),
            }
        }
    };

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(reason));
        return;
    }
    if closing.load(Ordering::Acquire) {
        tracing::debug!(reason = %reason, "OPC UA event loop stopped after disconnect");
        return;
    }
    tracing::warn!(reason = %reason, "OPC UA session lost");
    if let Some(on_lost) = on_lost {
        on_lost(reason);
    }
}

/// An activated async-opcua session.
pub struct OpcUaSession {
    session: Arc<Session>,
    closing: Arc<AtomicBool>,
    cancel: CancellationToken,
}

fn event_filter(fields: &[&'static str]) -> EventFilter {
    EventFilter {
        select_clauses: Some(
            fields
                .iter()
                .map(|field| SimpleAttributeOperand {
                    type_definition_id: NodeId::new(0, BASE_EVENT_TYPE),
                    browse_path: Some(vec![QualifiedName::new(0, *field)]),
                    attribute_id: VALUE_ATTRIBUTE,
                    index_range: Default::default(),
                })
                .collect(),
        ),
        where_clause: ContentFilter { elements: None },
    }
}

fn create_request(spec: MonitoredItemSpec) -> MonitoredItemCreateRequest {
    let filter = match &spec.filter {
        MonitoringFilter::None => ExtensionObject::default(),
        MonitoringFilter::Event { fields } => ExtensionObject::from_message(event_filter(fields)),
    };
    MonitoredItemCreateRequest {
        item_to_monitor: ReadValueId {
            node_id: spec.node_id,
            attribute_id: spec.attribute_id,
            ..Default::default()
        },
        monitoring_mode: MonitoringMode::Reporting,
        requested_parameters: MonitoringParameters {
            client_handle: spec.client_handle,
            sampling_interval: spec.sampling_interval_ms,
            filter,
            queue_size: spec.queue_size,
            discard_oldest: spec.discard_oldest,
        },
    }
}

fn subscription_callbacks(sink: Arc<dyn NotificationSink>) -> SubscriptionCallbacks {
    let status_sink = Arc::clone(&sink);
    let data_sink = Arc::clone(&sink);
    let event_sink = sink;
    SubscriptionCallbacks::new(
        move |notification| {
            if notification.status.is_bad() {
                tracing::warn!(status = %notification.status, "OPC UA subscription status changed");
                status_sink.on_subscription_lost();
            }
        },
        move |dv: DataValue, item: &MonitoredItem| {
            data_sink.on_data_value(item.client_handle(), dv);
        },
        move |fields, item: &MonitoredItem| {
            let fields: Option<Vec<Variant>> = fields;
            event_sink.on_event(item.client_handle(), fields.unwrap_or_default());
        },
    )
}

fn browse_page(results: Vec<BrowseResult>) -> Result<BrowsePage, StatusCode> {
    let Some(result) = results.into_iter().next() else {
        return Err(StatusCode::BadUnexpectedError);
    };
    if result.status_code.is_bad() {
        return Err(result.status_code);
    }
    let references = result
        .references
        .unwrap_or_default()
        .into_iter()
        .map(|r| BrowseReference {
            node_id: (r.node_id.server_index == 0 && r.node_id.namespace_uri.is_null())
                .then_some(r.node_id.node_id),
            browse_name: r.browse_name,
            node_class: r.node_class,
            type_definition: (!r.type_definition.node_id.is_null())
                .then_some(r.type_definition.node_id),
        })
        .collect();
    let continuation_point = (!result.continuation_point.is_null_or_empty())
        .then_some(result.continuation_point);
    Ok(BrowsePage {
        references,
        continuation_point,
    })
}

#[async_trait]
impl UaSession for OpcUaSession {
    async fn read(&self, items: Vec<ReadItem>) -> Result<Vec<DataValue>, StatusCode> {
        let nodes: Vec<ReadValueId> = items
            .into_iter()
            .map(|item| ReadValueId {
                node_id: item.node_id,
                attribute_id: item.attribute_id,
                ..Default::default()
            })
            .collect();
        self.session
            .read(&nodes, TimestampsToReturn::Both, 0.0)
            .await
    }

    async fn write(&self, items: Vec<WriteItem>) -> Result<Vec<StatusCode>, StatusCode> {
        let writes: Vec<WriteValue> = items
            .into_iter()
            .map(|item| WriteValue {
                node_id: item.node_id,
                attribute_id: item.attribute_id,
                index_range: Default::default(),
                value: DataValue::value_only(item.value),
            })
            .collect();
        self.session.write(&writes).await
    }

    async fn browse(&self, node: &NodeId) -> Result<BrowsePage, StatusCode> {
        let description = BrowseDescription {
            node_id: node.clone(),
            browse_direction: BrowseDirection::Forward,
            reference_type_id: NodeId::new(0, HIERARCHICAL_REFERENCES),
            include_subtypes: true,
            node_class_mask: BROWSE_NODE_CLASS_MASK,
            result_mask: BROWSE_RESULT_MASK,
        };
        let results = self.session.browse(&[description], 0, None).await?;
        browse_page(results)
    }

    async fn browse_next(
        &self,
        continuation_point: ByteString,
        release: bool,
    ) -> Result<BrowsePage, StatusCode> {
        let results = self
            .session
            .browse_next(release, &[continuation_point])
            .await?;
        if release {
            return Ok(BrowsePage::default());
        }
        browse_page(results)
    }

    async fn create_subscription(
        &self,
        publish_interval: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<u32, StatusCode> {
        self.session
            .create_subscription(
                publish_interval,
                60,
                20,
                0,
                0,
                true,
                subscription_callbacks(sink),
            )
            .await
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemSpec>,
    ) -> Result<Vec<CreatedItem>, StatusCode> {
        let requests: Vec<MonitoredItemCreateRequest> =
            items.into_iter().map(create_request).collect();
        let results = self
            .session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, requests)
            .await?;
        Ok(results
            .into_iter()
            .map(|res| CreatedItem {
                status: res.status_code,
                monitored_item_id: res.monitored_item_id,
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.session
            .delete_monitored_items(subscription_id, &monitored_item_ids)
            .await
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<StatusCode, StatusCode> {
        self.session.delete_subscription(subscription_id).await
    }

    async fn disconnect(&self) -> Result<(), StatusCode> {
        self.closing.store(true, Ordering::Release);
        self.session.disable_reconnects();
        let result = self.session.disconnect().await;
        self.cancel.cancel();
        result
    }
}
