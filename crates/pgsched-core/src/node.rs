//! Node identity and resource state

use serde::{Deserialize, Serialize};

use crate::ResourceSet;

/// Identifier of a worker node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// RPC address of a node's lease service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A worker node as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier
    pub id: NodeId,
    /// Address of the node's lease service
    pub address: NodeAddress,
    /// Total resource capacity
    pub total: ResourceSet,
    /// Resources currently available, as of the last heartbeat
    pub available: ResourceSet,
    /// Whether the node is considered alive
    pub alive: bool,
}

impl Node {
    /// Create an alive node whose available resources equal its total
    pub fn new(id: NodeId, address: NodeAddress, total: ResourceSet) -> Self {
        Self {
            id,
            address,
            available: total.clone(),
            total,
            alive: true,
        }
    }
}
