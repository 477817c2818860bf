//! Cluster seams: discovery, messaging, and compute fan-out.
//!
//! The coordinator consumes these as passive interfaces; the in-process
//! implementations below back single-node deployments and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::path::MeshPath;
use crate::types::FileId;

/// Identifier of a cluster node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a fresh node identifier.
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Topology change delivered to local listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A node left the cluster cleanly.
    NodeLeft(NodeId),
    /// A node was detected as failed.
    NodeFailed(NodeId),
}

impl TopologyEvent {
    /// The node the event concerns.
    pub fn node(&self) -> NodeId {
        match self {
            TopologyEvent::NodeLeft(n) | TopologyEvent::NodeFailed(n) => *n,
        }
    }
}

/// Cluster membership view.
pub trait DiscoveryService: Send + Sync {
    /// This process's node identifier.
    fn local_node(&self) -> NodeId;

    /// Names of the mesh filesystems a node participates in, from its
    /// advertised attributes. Unknown nodes yield an empty list.
    fn node_filesystems(&self, node: NodeId) -> Vec<String>;

    /// Subscribes to node-left / node-failed events.
    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent>;
}

/// Peer notification that an asynchronous trash purge finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCompleted {
    /// Identifier of the purged entry.
    pub id: FileId,
    /// Error text if the purge failed.
    pub error: Option<String>,
}

/// A message together with its sender.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Node the message originated from.
    pub sender: NodeId,
    /// Message payload.
    pub message: DeleteCompleted,
}

/// Topic-based peer messaging.
pub trait Messaging: Send + Sync {
    /// Subscribes to a topic; every published envelope is delivered to all
    /// current subscribers.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope>;
}

/// Fan-out execution of the space probe across cluster nodes.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Runs the probe on every node hosting `fs_name`, returning one
    /// `(used, max)` pair per node. Jobs never fail over.
    async fn space_probe(&self, fs_name: &str) -> Result<Vec<(u64, u64)>>;
}

/// Block eviction exclusion policy.
pub trait EvictionPolicy: Send + Sync {
    /// Whether blocks of `path` are excluded from eviction.
    fn exclude(&self, path: &MeshPath) -> bool;
}

/// Single-process discovery: one local node, programmable peer attributes.
pub struct LocalDiscovery {
    local: NodeId,
    attrs: Mutex<HashMap<NodeId, Vec<String>>>,
    topology: broadcast::Sender<TopologyEvent>,
}

impl LocalDiscovery {
    /// Creates a discovery view around a fresh local node carrying `fs_name`.
    pub fn new(fs_name: &str) -> Self {
        let local = NodeId::random();
        let (topology, _) = broadcast::channel(64);

        let mut attrs = HashMap::new();
        attrs.insert(local, vec![fs_name.to_string()]);

        LocalDiscovery {
            local,
            attrs: Mutex::new(attrs),
            topology,
        }
    }

    /// Registers a peer node with the filesystems it advertises.
    pub fn add_node(&self, node: NodeId, filesystems: Vec<String>) {
        self.attrs.lock().unwrap().insert(node, filesystems);
    }

    /// Publishes a topology event to all subscribers.
    pub fn publish(&self, event: TopologyEvent) {
        let _ = self.topology.send(event);
    }
}

impl DiscoveryService for LocalDiscovery {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn node_filesystems(&self, node: NodeId) -> Vec<String> {
        self.attrs.lock().unwrap().get(&node).cloned().unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }
}

/// In-process topic messaging backed by broadcast channels.
#[derive(Default)]
pub struct LocalMessaging {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalMessaging {
    /// Creates an empty messaging fabric.
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Publishes an envelope to a topic; silently dropped without subscribers.
    pub fn publish(&self, topic: &str, envelope: Envelope) {
        let _ = self.topic_sender(topic).send(envelope);
    }
}

impl Messaging for LocalMessaging {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.topic_sender(topic).subscribe()
    }
}

/// Compute service answering the space probe from a fixed response table.
#[derive(Default)]
pub struct LocalCompute {
    responses: Mutex<Vec<(u64, u64)>>,
}

impl LocalCompute {
    /// Creates a compute service with no nodes responding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the per-node `(used, max)` responses the probe returns.
    pub fn set_responses(&self, responses: Vec<(u64, u64)>) {
        *self.responses.lock().unwrap() = responses;
    }
}

#[async_trait]
impl ComputeService for LocalCompute {
    async fn space_probe(&self, _fs_name: &str) -> Result<Vec<(u64, u64)>> {
        Ok(self.responses.lock().unwrap().clone())
    }
}

/// Eviction policy excluding paths under a fixed set of prefixes.
pub struct PrefixEvictionPolicy {
    prefixes: Vec<MeshPath>,
}

impl PrefixEvictionPolicy {
    /// Creates a policy excluding everything at or below the given prefixes.
    pub fn new(prefixes: Vec<MeshPath>) -> Self {
        PrefixEvictionPolicy { prefixes }
    }
}

impl EvictionPolicy for PrefixEvictionPolicy {
    fn exclude(&self, path: &MeshPath) -> bool {
        self.prefixes
            .iter()
            .any(|p| path.is_same(p) || path.is_subdirectory_of(p))
    }
}
