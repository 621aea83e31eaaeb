//! Narrow async surface between the orchestration core and the protocol stack.
//!
//! Production code runs on [`crate::client::OpcUaConnector`]; tests plug in
//! in-memory sessions that record every call.

use crate::{certificate::ClientCertificate, types::OpcUaAuth};
use async_trait::async_trait;
use ng_gateway_sdk::DriverResult;
use opcua::types::{
    ByteString, DataValue, EndpointDescription, MessageSecurityMode, NodeClass, NodeId, QualifiedName,
    StatusCode, Variant,
};
use std::{sync::Arc, time::Duration};

/// Fields selected by the event filter of `EventNotifier` items, in order.
pub const EVENT_FIELDS: [&str; 2] = ["Time", "Message"];

/// An endpoint returned by discovery.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub security_policy_uri: String,
    pub security_mode: MessageSecurityMode,
    /// Full description when the endpoint came from a real server.
    pub description: Option<Arc<EndpointDescription>>,
}

impl Endpoint {
    pub fn new(
        url: impl Into<String>,
        security_policy_uri: impl Into<String>,
        security_mode: MessageSecurityMode,
    ) -> Self {
        Self {
            url: url.into(),
            security_policy_uri: security_policy_uri.into(),
            security_mode,
            description: None,
        }
    }

    /// Same endpoint reached through another URL.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

pub type ConnectionLostHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Everything needed to open one session against one endpoint.
#[derive(Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub identity: OpcUaAuth,
    pub application_name: String,
    pub application_uri: String,
    pub request_timeout: Duration,
    pub session_timeout: Duration,
    pub acknowledge_timeout: Duration,
    pub certificate: Option<ClientCertificate>,
    pub trust_server_certs: bool,
    /// Invoked once when an open session loses its transport.
    pub on_connection_lost: Option<ConnectionLostHandler>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadItem {
    pub node_id: NodeId,
    pub attribute_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub node_id: NodeId,
    pub attribute_id: u32,
    pub value: Variant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitoringFilter {
    None,
    /// Select the listed `BaseEventType` fields.
    Event { fields: Vec<&'static str> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemSpec {
    pub client_handle: u32,
    pub node_id: NodeId,
    pub attribute_id: u32,
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: MonitoringFilter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreatedItem {
    pub status: StatusCode,
    pub monitored_item_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowseReference {
    /// Target node when it lives on this server.
    pub node_id: Option<NodeId>,
    pub browse_name: QualifiedName,
    pub node_class: NodeClass,
    pub type_definition: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowsePage {
    pub references: Vec<BrowseReference>,
    pub continuation_point: Option<ByteString>,
}

/// Receives notifications of one subscription, routed by client handle.
pub trait NotificationSink: Send + Sync {
    fn on_data_value(&self, client_handle: u32, value: DataValue);

    fn on_event(&self, client_handle: u32, fields: Vec<Variant>);

    /// The server dropped the subscription and it could not be transferred.
    fn on_subscription_lost(&self);
}

#[async_trait]
pub trait UaSession: Send + Sync {
    async fn read(&self, items: Vec<ReadItem>) -> Result<Vec<DataValue>, StatusCode>;

    async fn write(&self, items: Vec<WriteItem>) -> Result<Vec<StatusCode>, StatusCode>;

    /// Forward hierarchical references of `node` to Object and Variable nodes.
    async fn browse(&self, node: &NodeId) -> Result<BrowsePage, StatusCode>;

    /// Next page for `continuation_point`; `release` frees it without reading.
    async fn browse_next(
        &self,
        continuation_point: ByteString,
        release: bool,
    ) -> Result<BrowsePage, StatusCode>;

    async fn create_subscription(
        &self,
        publish_interval: Duration,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<u32, StatusCode>;

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<MonitoredItemSpec>,
    ) -> Result<Vec<CreatedItem>, StatusCode>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode>;

    async fn delete_subscription(&self, subscription_id: u32) -> Result<StatusCode, StatusCode>;

    async fn disconnect(&self) -> Result<(), StatusCode>;
}

#[async_trait]
pub trait UaConnector: Send + Sync {
    async fn get_endpoints(&self, discovery_url: &str) -> DriverResult<Vec<Endpoint>>;

    async fn connect(&self, config: SessionConfig) -> DriverResult<Arc<dyn UaSession>>;
}
