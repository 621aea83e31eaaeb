use crate::types::AttributeKind;
use ng_gateway_sdk::ChannelRecord;
use opcua::types::NodeId;
use std::time::Duration;

/// Identity of a single monitored node; used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeListenParams {
    pub node_id: NodeId,
    pub attribute: AttributeKind,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl NodeListenParams {
    #[inline]
    pub fn is_event(&self) -> bool {
        self.attribute == AttributeKind::EventNotifier
    }
}

/// A subtree root whose variable descendants are monitored with the same settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubtreeListenParams {
    pub root: NodeId,
    pub attribute: AttributeKind,
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl SubtreeListenParams {
    /// Single-node params for a node found under this root.
    pub fn child(&self, node_id: NodeId) -> NodeListenParams {
        NodeListenParams {
            node_id,
            attribute: self.attribute,
            sampling_interval: self.sampling_interval,
            queue_size: self.queue_size,
            discard_oldest: self.discard_oldest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenParams {
    Node(NodeListenParams),
    Subtree(SubtreeListenParams),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadParams {
    pub node_id: NodeId,
    pub attribute: AttributeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    pub node_id: NodeId,
    pub attribute: AttributeKind,
}

/// Params paired with the caller's record that receives the outcome.
#[derive(Debug)]
pub struct Request<'a, P> {
    pub params: P,
    pub record: &'a mut ChannelRecord,
}

impl<'a, P> Request<'a, P> {
    pub fn new(params: P, record: &'a mut ChannelRecord) -> Self {
        Self { params, record }
    }
}
