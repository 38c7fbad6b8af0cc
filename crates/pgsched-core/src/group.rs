//! Placement group and bundle type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{NodeId, ResourceSet};

/// Handle to a placement group shared between the caller and the scheduler
pub type SharedPlacementGroup = Arc<RwLock<PlacementGroup>>;

/// Unique identifier of a placement group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlacementGroupId(pub Uuid);

impl PlacementGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlacementGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlacementGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one bundle on the wire: the owning group plus its index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId {
    pub group_id: PlacementGroupId,
    pub index: usize,
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group_id, self.index)
    }
}

/// Strategy governing how bundles of one group are spread across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementStrategy {
    /// Pack bundles onto as few nodes as possible
    Pack,
    /// All bundles on a single node, or none
    StrictPack,
    /// Spread bundles across nodes on a best-effort basis
    Spread,
    /// Every bundle on a distinct node, or none
    StrictSpread,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementStrategy::Pack => write!(f, "PACK"),
            PlacementStrategy::StrictPack => write!(f, "STRICT_PACK"),
            PlacementStrategy::Spread => write!(f, "SPREAD"),
            PlacementStrategy::StrictSpread => write!(f, "STRICT_SPREAD"),
        }
    }
}

/// Lifecycle state of a placement group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementGroupState {
    /// Created, never placed
    Pending,
    /// A scheduling attempt is in flight
    Preparing,
    /// Every bundle is committed on its node
    Committed,
    /// Waiting to be placed again after losing a previous placement
    Rescheduling,
    /// Given up on by the driver
    Failed,
    /// Removed by the driver
    Removed,
}

impl std::fmt::Display for PlacementGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementGroupState::Pending => write!(f, "Pending"),
            PlacementGroupState::Preparing => write!(f, "Preparing"),
            PlacementGroupState::Committed => write!(f, "Committed"),
            PlacementGroupState::Rescheduling => write!(f, "Rescheduling"),
            PlacementGroupState::Failed => write!(f, "Failed"),
            PlacementGroupState::Removed => write!(f, "Removed"),
        }
    }
}

/// Placement state of a single bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleState {
    Unplaced,
    Reserved,
    Committed,
}

/// Minimal unit of resource requirement within a placement group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Index within the owning group
    pub index: usize,
    /// Resources this bundle needs on its node
    pub resources: ResourceSet,
    /// Node the bundle is assigned to (lookup key only)
    pub node_id: Option<NodeId>,
    /// Placement state
    pub state: BundleState,
}

impl Bundle {
    /// Create an unplaced bundle
    pub fn new(index: usize, resources: ResourceSet) -> Self {
        Self {
            index,
            resources,
            node_id: None,
            state: BundleState::Unplaced,
        }
    }

    /// Forget any placement and return to `Unplaced`
    pub fn reset(&mut self) {
        self.node_id = None;
        self.state = BundleState::Unplaced;
    }
}

/// A set of bundles scheduled together under one strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementGroup {
    /// Unique identifier
    pub id: PlacementGroupId,
    /// Human-readable name
    pub name: String,
    /// Bundles in group order
    pub bundles: Vec<Bundle>,
    /// Placement strategy
    pub strategy: PlacementStrategy,
    /// Lifecycle state
    pub state: PlacementGroupState,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last state change
    pub updated_at: DateTime<Utc>,
}

impl PlacementGroup {
    /// Create a pending group with one bundle per resource requirement
    pub fn new(
        name: impl Into<String>,
        strategy: PlacementStrategy,
        bundles: impl IntoIterator<Item = ResourceSet>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PlacementGroupId::new(),
            name: name.into(),
            bundles: bundles
                .into_iter()
                .enumerate()
                .map(|(index, resources)| Bundle::new(index, resources))
                .collect(),
            strategy,
            state: PlacementGroupState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Wrap the group in a shared handle
    pub fn into_shared(self) -> SharedPlacementGroup {
        Arc::new(RwLock::new(self))
    }

    /// Identifier of the bundle at `index`
    pub fn bundle_id(&self, index: usize) -> BundleId {
        BundleId {
            group_id: self.id,
            index,
        }
    }

    /// Transition to a new lifecycle state
    pub fn set_state(&mut self, state: PlacementGroupState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Clear every bundle's placement
    pub fn reset_bundles(&mut self) {
        for bundle in &mut self.bundles {
            bundle.reset();
        }
    }

    /// Sum of all bundle requirements
    pub fn total_resources(&self) -> ResourceSet {
        ResourceSet::sum(self.bundles.iter().map(|b| &b.resources))
    }

    /// Whether every bundle is committed
    pub fn is_fully_committed(&self) -> bool {
        !self.bundles.is_empty() && self.bundles.iter().all(|b| b.state == BundleState::Committed)
    }

    /// Distinct nodes currently hosting at least one bundle, in bundle order
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        for node in self.bundles.iter().filter_map(|b| b.node_id.as_ref()) {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(n: f64) -> ResourceSet {
        ResourceSet::new().with("CPU", n)
    }

    #[test]
    fn test_placement_group_new() {
        let group = PlacementGroup::new("pg", PlacementStrategy::Pack, vec![cpu(1.0), cpu(2.0)]);
        assert_eq!(group.state, PlacementGroupState::Pending);
        assert_eq!(group.bundles.len(), 2);
        assert_eq!(group.bundles[1].index, 1);
        assert!(group.bundles.iter().all(|b| b.node_id.is_none()));
        assert_eq!(group.total_resources().get("CPU"), 3.0);
    }

    #[test]
    fn test_reset_bundles() {
        let mut group = PlacementGroup::new("pg", PlacementStrategy::Pack, vec![cpu(1.0)]);
        group.bundles[0].node_id = Some(NodeId::new("node-0"));
        group.bundles[0].state = BundleState::Committed;
        assert!(group.is_fully_committed());

        group.reset_bundles();
        assert_eq!(group.bundles[0].state, BundleState::Unplaced);
        assert!(group.bundles[0].node_id.is_none());
        assert!(!group.is_fully_committed());
    }

    #[test]
    fn test_nodes_are_distinct() {
        let mut group = PlacementGroup::new(
            "pg",
            PlacementStrategy::Pack,
            vec![cpu(1.0), cpu(1.0), cpu(1.0)],
        );
        group.bundles[0].node_id = Some(NodeId::new("a"));
        group.bundles[1].node_id = Some(NodeId::new("b"));
        group.bundles[2].node_id = Some(NodeId::new("a"));
        assert_eq!(group.nodes(), vec![NodeId::new("a"), NodeId::new("b")]);
    }

    #[test]
    fn test_strategy_serde() {
        let s: PlacementStrategy = serde_json::from_str("\"STRICT_PACK\"").unwrap();
        assert_eq!(s, PlacementStrategy::StrictPack);
        assert_eq!(PlacementStrategy::StrictSpread.to_string(), "STRICT_SPREAD");
    }
}
