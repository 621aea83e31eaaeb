use crate::request::{ListenParams, NodeListenParams, ReadParams, SubtreeListenParams, WriteParams};
use ng_gateway_sdk::{ChannelConfig, DataType, DriverError, DriverResult, RetryPolicy};
use opcua::types::{ByteString, Guid, NodeId, StatusCode, UAString};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{str::FromStr, sync::Arc, time::Duration};

/// OPC UA driver options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpcUaOptions {
    /// Server host name or address
    pub endpoint_ip: String,
    /// Server port
    #[serde(default = "OpcUaOptions::default_endpoint_port")]
    pub endpoint_port: u16,
    /// Optional server name appended to the discovery URL path
    #[serde(default)]
    pub server_name: Option<String>,
    /// Connect to the locally built URL instead of the advertised endpoint URL
    #[serde(default)]
    pub force_endpoint_url: bool,
    /// Security policy endpoints must match
    #[serde(default = "OpcUaOptions::default_security_policy")]
    pub security_policy: SecurityPolicy,
    /// Authentication configuration
    #[serde(default = "OpcUaOptions::default_auth")]
    pub auth: OpcUaAuth,
    /// Application name
    #[serde(default = "OpcUaOptions::default_application_name")]
    pub application_name: String,
    /// Application URI
    #[serde(default = "OpcUaOptions::default_application_uri")]
    pub application_uri: String,
    /// Deadline for one batched read/write call
    #[serde(default = "OpcUaOptions::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Session timeout
    #[serde(default = "OpcUaOptions::default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Transport acknowledge timeout
    #[serde(default = "OpcUaOptions::default_acknowledge_timeout_ms")]
    pub acknowledge_timeout_ms: u64,
    /// Batch size for read, write and monitored item create/delete calls
    #[serde(default = "OpcUaOptions::default_max_request_items")]
    pub max_request_items: usize,
    /// Publishing interval of the subscription
    #[serde(default = "OpcUaOptions::default_subscription_publish_interval_ms")]
    pub subscription_publish_interval_ms: u64,
    /// How channels discovered under a subtree are named
    #[serde(default = "OpcUaOptions::default_subtree_channel_name_format")]
    pub subtree_channel_name_format: ChannelNameFormat,
    /// Client certificate and trust configuration
    #[serde(default)]
    pub certificate: Option<CertificateOptions>,
    /// Backoff used by the reconnect loop
    #[serde(default)]
    pub reconnect: RetryPolicy,
}

impl OpcUaOptions {
    fn default_endpoint_port() -> u16 {
        4840
    }

    fn default_security_policy() -> SecurityPolicy {
        SecurityPolicy::None
    }

    fn default_auth() -> OpcUaAuth {
        OpcUaAuth::Anonymous
    }

    fn default_application_name() -> String {
        "ng-gateway OPC UA driver".to_string()
    }

    fn default_application_uri() -> String {
        "urn:ng-gateway:opcua:client".to_string()
    }

    fn default_request_timeout_ms() -> u64 {
        60_000
    }

    fn default_session_timeout_ms() -> u64 {
        120_000
    }

    fn default_acknowledge_timeout_ms() -> u64 {
        60_000
    }

    fn default_max_request_items() -> usize {
        10
    }

    fn default_subscription_publish_interval_ms() -> u64 {
        1_000
    }

    fn default_subtree_channel_name_format() -> ChannelNameFormat {
        ChannelNameFormat::BrowsePath
    }

    /// Build options for `ip:port` with every other field at its default.
    pub fn new(endpoint_ip: impl Into<String>, endpoint_port: u16) -> Self {
        Self {
            endpoint_ip: endpoint_ip.into(),
            endpoint_port,
            server_name: None,
            force_endpoint_url: false,
            security_policy: Self::default_security_policy(),
            auth: Self::default_auth(),
            application_name: Self::default_application_name(),
            application_uri: Self::default_application_uri(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            session_timeout_ms: Self::default_session_timeout_ms(),
            acknowledge_timeout_ms: Self::default_acknowledge_timeout_ms(),
            max_request_items: Self::default_max_request_items(),
            subscription_publish_interval_ms: Self::default_subscription_publish_interval_ms(),
            subtree_channel_name_format: Self::default_subtree_channel_name_format(),
            certificate: None,
            reconnect: RetryPolicy::default(),
        }
    }

    /// `opc.tcp://ip:port[/serverName]`
    pub fn discovery_url(&self) -> String {
        let mut url = format!("opc.tcp://{}:{}", self.endpoint_ip.trim(), self.endpoint_port);
        if let Some(name) = self.server_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            url.push('/');
            url.push_str(name.trim_start_matches('/'));
        }
        url
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    #[inline]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    #[inline]
    pub fn acknowledge_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledge_timeout_ms)
    }

    #[inline]
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_publish_interval_ms)
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.max_request_items.max(1)
    }
}

/// OPC UA authentication types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum OpcUaAuth {
    Anonymous,
    UserPassword { username: String, password: String },
}

/// OPC UA security policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i16)]
pub enum SecurityPolicy {
    None = 0,
    Basic128Rsa15 = 1,
    Basic256 = 2,
    Basic256Sha256 = 3,
    Aes128Sha256RsaOaep = 4,
    Aes256Sha256RsaPss = 5,
}

impl SecurityPolicy {
    /// Policy URI as advertised in endpoint descriptions.
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            SecurityPolicy::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            SecurityPolicy::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
            SecurityPolicy::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            SecurityPolicy::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        !matches!(self, SecurityPolicy::None)
    }
}

/// Naming of channels discovered under a subtree root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(i16)]
pub enum ChannelNameFormat {
    /// Root channel name followed by the browse names below the root, joined with `/`
    BrowsePath = 0,
    /// String form of the node id
    NodeId = 1,
}

/// Client certificate files and server trust decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateOptions {
    pub certificate_path: String,
    pub private_key_path: String,
    #[serde(default)]
    pub trust_server_certs: bool,
}

/// Node attributes a channel can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    NodeId,
    NodeClass,
    BrowseName,
    DisplayName,
    Description,
    EventNotifier,
    Value,
    DataType,
    ValueRank,
    AccessLevel,
    UserAccessLevel,
    MinimumSamplingInterval,
    Historizing,
}

impl AttributeKind {
    /// Numeric attribute id on the wire.
    pub fn id(&self) -> u32 {
        match self {
            AttributeKind::NodeId => 1,
            AttributeKind::NodeClass => 2,
            AttributeKind::BrowseName => 3,
            AttributeKind::DisplayName => 4,
            AttributeKind::Description => 5,
            AttributeKind::EventNotifier => 12,
            AttributeKind::Value => 13,
            AttributeKind::DataType => 14,
            AttributeKind::ValueRank => 15,
            AttributeKind::AccessLevel => 17,
            AttributeKind::UserAccessLevel => 18,
            AttributeKind::MinimumSamplingInterval => 19,
            AttributeKind::Historizing => 20,
        }
    }
}

impl FromStr for AttributeKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "nodeid" => AttributeKind::NodeId,
            "nodeclass" => AttributeKind::NodeClass,
            "browsename" => AttributeKind::BrowseName,
            "displayname" => AttributeKind::DisplayName,
            "description" => AttributeKind::Description,
            "eventnotifier" => AttributeKind::EventNotifier,
            "value" => AttributeKind::Value,
            "datatype" => AttributeKind::DataType,
            "valuerank" => AttributeKind::ValueRank,
            "accesslevel" => AttributeKind::AccessLevel,
            "useraccesslevel" => AttributeKind::UserAccessLevel,
            "minimumsamplinginterval" => AttributeKind::MinimumSamplingInterval,
            "historizing" => AttributeKind::Historizing,
            other => {
                return Err(DriverError::ConfigurationError(format!(
                    "unsupported attribute: {other}"
                )))
            }
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIdType {
    Numeric,
    String,
    Guid,
    Opaque,
}

impl FromStr for NodeIdType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NUMERIC" => Ok(NodeIdType::Numeric),
            "STRING" => Ok(NodeIdType::String),
            "GUID" => Ok(NodeIdType::Guid),
            "OPAQUE" => Ok(NodeIdType::Opaque),
            other => Err(DriverError::ConfigurationError(format!(
                "unsupported node id type: {other}"
            ))),
        }
    }
}

impl NodeIdType {
    fn build(&self, namespace: u16, id: &str) -> DriverResult<NodeId> {
        let invalid = || DriverError::ConfigurationError(format!("invalid {self:?} node id: {id}"));
        Ok(match self {
            NodeIdType::Numeric => NodeId::new(namespace, id.trim().parse::<u32>().map_err(|_| invalid())?),
            NodeIdType::String => NodeId::new(namespace, UAString::from(id)),
            NodeIdType::Guid => NodeId::new(namespace, Guid::from_str(id.trim()).map_err(|_| invalid())?),
            NodeIdType::Opaque => NodeId::new(namespace, ByteString::from_base64(id.trim()).ok_or_else(invalid)?),
        })
    }
}

/// Channel configuration keys
pub mod keys {
    pub const NODE_ID: &str = "node.id";
    pub const NAMESPACE_INDEX: &str = "node.namespace.index";
    pub const NODE_ID_TYPE: &str = "node.id.type";
    pub const ATTRIBUTE: &str = "attribute";
    pub const SAMPLING_INTERVAL: &str = "listen.sampling.interval";
    pub const QUEUE_SIZE: &str = "listen.queue.size";
    pub const DISCARD_OLDEST: &str = "listen.discard.oldest";
    pub const SUBSCRIBE_TO_CHILDREN: &str = "listen.subscribe.to.children";
    pub const VALUE_TYPE: &str = "+value.type";
    pub const NAME: &str = "+name";
}

/// Listen parameters of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub subscribe_to_children: bool,
}

/// Parsed per-channel configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OpcUaChannelDescriptor {
    pub channel_name: Arc<str>,
    pub node_id: NodeId,
    pub attribute: AttributeKind,
    pub value_type: DataType,
    pub listen: ListenOptions,
}

impl OpcUaChannelDescriptor {
    pub fn from_config(config: &ChannelConfig) -> DriverResult<Self> {
        let raw_id = config_str(config, keys::NODE_ID)?.ok_or_else(|| missing(keys::NODE_ID))?;
        let namespace = match config_f64(config, keys::NAMESPACE_INDEX)? {
            Some(ns) if (0.0..=u16::MAX as f64).contains(&ns) && ns.fract() == 0.0 => ns as u16,
            Some(ns) => {
                return Err(DriverError::ConfigurationError(format!(
                    "invalid namespace index: {ns}"
                )))
            }
            None => 0,
        };
        let id_type = config_str(config, keys::NODE_ID_TYPE)?
            .map(|s| s.parse::<NodeIdType>())
            .transpose()?
            .unwrap_or(NodeIdType::String);
        let node_id = id_type.build(namespace, &raw_id)?;
        let attribute = config_str(config, keys::ATTRIBUTE)?
            .map(|s| s.parse::<AttributeKind>())
            .transpose()?
            .unwrap_or(AttributeKind::Value);
        let value_type = config_str(config, keys::VALUE_TYPE)?
            .ok_or_else(|| missing(keys::VALUE_TYPE))?
            .parse::<DataType>()
            .map_err(DriverError::ConfigurationError)?;
        let channel_name: Arc<str> = config_str(config, keys::NAME)?
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(raw_id.as_str()));

        let sampling_secs = config_f64(config, keys::SAMPLING_INTERVAL)?.unwrap_or(1.0);
        let sampling_interval = Duration::try_from_secs_f64(sampling_secs).map_err(|e| {
            DriverError::ConfigurationError(format!(
                "invalid sampling interval {sampling_secs}: {e}"
            ))
        })?;
        let queue_size = match config_f64(config, keys::QUEUE_SIZE)? {
            Some(q) if q >= 0.0 && q <= u32::MAX as f64 => q as u32,
            Some(q) => {
                return Err(DriverError::ConfigurationError(format!("invalid queue size: {q}")))
            }
            None => 10,
        };
        let listen = ListenOptions {
            sampling_interval,
            queue_size,
            discard_oldest: config_bool(config, keys::DISCARD_OLDEST)?.unwrap_or(true),
            subscribe_to_children: config_bool(config, keys::SUBSCRIBE_TO_CHILDREN)?.unwrap_or(false),
        };

        Ok(Self {
            channel_name,
            node_id,
            attribute,
            value_type,
            listen,
        })
    }

    pub fn read_params(&self) -> ReadParams {
        ReadParams {
            node_id: self.node_id.clone(),
            attribute: self.attribute,
        }
    }

    pub fn write_params(&self) -> WriteParams {
        WriteParams {
            node_id: self.node_id.clone(),
            attribute: self.attribute,
        }
    }

    pub fn listen_params(&self) -> ListenParams {
        if self.listen.subscribe_to_children {
            ListenParams::Subtree(SubtreeListenParams {
                root: self.node_id.clone(),
                attribute: self.attribute,
                sampling_interval: self.listen.sampling_interval,
                queue_size: self.listen.queue_size,
                discard_oldest: self.listen.discard_oldest,
            })
        } else {
            ListenParams::Node(NodeListenParams {
                node_id: self.node_id.clone(),
                attribute: self.attribute,
                sampling_interval: self.listen.sampling_interval,
                queue_size: self.listen.queue_size,
                discard_oldest: self.listen.discard_oldest,
            })
        }
    }
}

fn missing(key: &str) -> DriverError {
    DriverError::ConfigurationError(format!("missing channel property: {key}"))
}

fn config_str(config: &ChannelConfig, key: &str) -> DriverResult<Option<String>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(DriverError::ConfigurationError(format!(
            "property {key} must be a string, got {other}"
        ))),
    }
}

fn config_f64(config: &ChannelConfig, key: &str) -> DriverResult<Option<f64>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| {
            DriverError::ConfigurationError(format!("property {key} is not a number: {s}"))
        }),
        Some(other) => Err(DriverError::ConfigurationError(format!(
            "property {key} must be a number, got {other}"
        ))),
    }
}

fn config_bool(config: &ChannelConfig, key: &str) -> DriverResult<Option<bool>> {
    match config.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(DriverError::ConfigurationError(format!(
                "property {key} is not a boolean: {s}"
            ))),
        },
        Some(other) => Err(DriverError::ConfigurationError(format!(
            "property {key} must be a boolean, got {other}"
        ))),
    }
}

/// Classification for OPC UA monitored item creation failures.
///
/// This type groups low-level `StatusCode` values into a small number of
/// meaningful categories that can be used consistently in logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitoredItemFailureKind {
    /// Capacity or resource related limits (too many items, server too busy, etc.).
    CapacityOrResources,
    /// Configuration problems (invalid/unknown NodeId, bad attribute, etc.).
    Configuration,
    /// Authentication / authorization / access control problems.
    PermissionOrAuth,
    /// Any other error code that does not fit the above categories.
    Other,
}

impl MonitoredItemFailureKind {
    /// Return a stable string label for use in structured logging.
    #[inline]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MonitoredItemFailureKind::CapacityOrResources => "capacity_or_resources",
            MonitoredItemFailureKind::Configuration => "configuration",
            MonitoredItemFailureKind::PermissionOrAuth => "permission_or_auth",
            MonitoredItemFailureKind::Other => "other",
        }
    }
}

impl From<StatusCode> for MonitoredItemFailureKind {
    #[inline]
    fn from(status: StatusCode) -> Self {
        if status == StatusCode::BadTooManyMonitoredItems
            || status == StatusCode::BadTooManyOperations
            || status == StatusCode::BadOutOfMemory
            || status == StatusCode::BadResourceUnavailable
            || status == StatusCode::BadServerTooBusy
        {
            MonitoredItemFailureKind::CapacityOrResources
        } else if status == StatusCode::BadNodeIdInvalid
            || status == StatusCode::BadNodeIdUnknown
            || status == StatusCode::BadAttributeIdInvalid
            || status == StatusCode::BadFilterNotAllowed
        {
            MonitoredItemFailureKind::Configuration
        } else if status == StatusCode::BadUserAccessDenied
            || status == StatusCode::BadIdentityTokenInvalid
            || status == StatusCode::BadIdentityTokenRejected
        {
            MonitoredItemFailureKind::PermissionOrAuth
        } else {
            MonitoredItemFailureKind::Other
        }
    }
}
