//! Node resource view
//!
//! The scheduler reads node liveness and available resources through
//! [`NodeResourceView`]. Each read hands out an immutable, versioned
//! [`NodeSnapshot`]; heartbeats produce a new snapshot rather than mutating
//! the one a scheduling attempt is looking at.

use async_trait::async_trait;
use pgsched_core::{Node, NodeAddress, NodeId, ResourceSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Immutable view of the fleet at one point in time
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    version: u64,
    /// Sorted by node id
    nodes: Vec<Node>,
}

impl NodeSnapshot {
    /// Build a snapshot, ordering nodes by id
    pub fn new(version: u64, mut nodes: Vec<Node>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self { version, nodes }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Alive nodes in stable id order
    pub fn alive_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.alive)
    }

    pub fn alive_count(&self) -> usize {
        self.alive_nodes().count()
    }

    /// Look up a node, alive or not
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

/// Read access to the fleet's liveness and resource state
#[async_trait]
pub trait NodeResourceView: Send + Sync {
    /// Latest snapshot
    async fn snapshot(&self) -> Arc<NodeSnapshot>;

    /// Alive nodes in stable order
    async fn all_alive_nodes(&self) -> Vec<Node> {
        let snapshot = self.snapshot().await;
        let nodes = snapshot.alive_nodes().cloned().collect();
        nodes
    }

    /// Available resources of an alive node
    async fn available_resources(&self, node_id: &NodeId) -> Option<ResourceSet> {
        let snapshot = self.snapshot().await;
        let available = snapshot
            .get(node_id)
            .filter(|n| n.alive)
            .map(|n| n.available.clone());
        available
    }
}

/// In-memory node view updated by membership and heartbeat reports
pub struct ClusterView {
    current: RwLock<Arc<NodeSnapshot>>,
}

impl ClusterView {
    /// Create an empty view
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(NodeSnapshot::default())),
        }
    }

    /// Apply `update` to a copy of the node list and publish it as the next version
    async fn publish<R>(&self, update: impl FnOnce(&mut Vec<Node>) -> R) -> R {
        let mut current = self.current.write().await;
        let mut nodes = current.nodes.clone();
        let result = update(&mut nodes);
        let next = NodeSnapshot::new(current.version + 1, nodes);
        debug!(version = next.version, nodes = next.nodes.len(), "Published node snapshot");
        *current = Arc::new(next);
        result
    }

    /// Register a node, replacing any node with the same id
    pub async fn add_node(&self, node: Node) {
        self.publish(|nodes| {
            nodes.retain(|n| n.id != node.id);
            nodes.push(node);
        })
        .await;
    }

    /// Convenience for registering an idle node with the given capacity
    pub async fn add(&self, id: &str, address: NodeAddress, total: ResourceSet) {
        self.add_node(Node::new(NodeId::new(id), address, total)).await;
    }

    /// Apply a heartbeat; returns `false` for unknown nodes
    pub async fn update_available(&self, id: &NodeId, available: ResourceSet) -> bool {
        self.publish(|nodes| match nodes.iter_mut().find(|n| &n.id == id) {
            Some(node) => {
                node.available = available;
                true
            }
            None => false,
        })
        .await
    }

    /// Mark a node dead; returns `false` for unknown nodes
    pub async fn mark_dead(&self, id: &NodeId) -> bool {
        self.publish(|nodes| match nodes.iter_mut().find(|n| &n.id == id) {
            Some(node) => {
                node.alive = false;
                true
            }
            None => false,
        })
        .await
    }

    /// Forget a node entirely
    pub async fn remove_node(&self, id: &NodeId) -> bool {
        self.publish(|nodes| {
            let before = nodes.len();
            nodes.retain(|n| &n.id != id);
            nodes.len() != before
        })
        .await
    }
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeResourceView for ClusterView {
    async fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.current.read().await.clone()
    }
}
