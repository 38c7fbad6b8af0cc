//! Bundle placement decisions
//!
//! A [`PlacementPolicy`] maps a group's bundles onto alive nodes of a
//! [`NodeSnapshot`], or reports that the group cannot be placed. Policies
//! only read the snapshot's available resources; nodes have the final word
//! when the reservations arrive.

use pgsched_core::{Bundle, Node, NodeId, PlacementStrategy, ResourceSet};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::view::NodeSnapshot;

/// Node chosen for each bundle, indexed like the group's bundles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub bundle_nodes: Vec<NodeId>,
}

impl PlacementDecision {
    /// Distinct nodes in first-use order
    pub fn nodes(&self) -> Vec<&NodeId> {
        let mut seen = HashSet::new();
        self.bundle_nodes
            .iter()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Strategy for choosing nodes for a group's bundles
pub trait PlacementPolicy: Send {
    /// Place every bundle, or return `None` if the group does not fit
    fn select(&mut self, bundles: &[Bundle], view: &NodeSnapshot) -> Option<PlacementDecision>;
}

/// Per-node resources left after the bundles placed so far in one selection
fn tentative(view: &NodeSnapshot) -> Vec<(&Node, ResourceSet)> {
    view.alive_nodes().map(|n| (n, n.available.clone())).collect()
}

/// All bundles on one node
///
/// Equally qualified nodes are used in least-recently-used order so that a
/// homogeneous fleet receives an even share of groups.
#[derive(Debug, Default)]
pub struct StrictPackPolicy {
    /// Logical time each node was last chosen
    last_used: HashMap<NodeId, u64>,
    clock: u64,
}

impl StrictPackPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlacementPolicy for StrictPackPolicy {
    fn select(&mut self, bundles: &[Bundle], view: &NodeSnapshot) -> Option<PlacementDecision> {
        if bundles.is_empty() {
            return None;
        }
        let required = ResourceSet::sum(bundles.iter().map(|b| &b.resources));

        let chosen = view
            .alive_nodes()
            .filter(|n| n.available.is_superset_of(&required))
            .min_by_key(|n| self.last_used.get(&n.id).copied().unwrap_or(0))?;
        let chosen = chosen.id.clone();

        self.clock += 1;
        self.last_used.insert(chosen.clone(), self.clock);
        self.last_used.retain(|id, _| view.get(id).is_some());

        debug!(node = %chosen, required = %required, "STRICT_PACK selected node");
        Some(PlacementDecision {
            bundle_nodes: vec![chosen; bundles.len()],
        })
    }
}

/// First-fit bin packing in bundle order over the stable node order
#[derive(Debug, Default)]
pub struct PackPolicy;

impl PlacementPolicy for PackPolicy {
    fn select(&mut self, bundles: &[Bundle], view: &NodeSnapshot) -> Option<PlacementDecision> {
        if bundles.is_empty() {
            return None;
        }
        let mut remaining = tentative(view);
        let mut bundle_nodes = Vec::with_capacity(bundles.len());

        for bundle in bundles {
            let Some((node, left)) = remaining
                .iter_mut()
                .find(|(_, left)| left.is_superset_of(&bundle.resources))
            else {
                debug!(bundle = bundle.index, required = %bundle.resources, "PACK found no node");
                return None;
            };
            left.subtract(&bundle.resources);
            bundle_nodes.push(node.id.clone());
        }

        Some(PlacementDecision { bundle_nodes })
    }
}

/// Best-effort spread: each bundle goes to the feasible node holding the
/// fewest bundles of this group so far
#[derive(Debug, Default)]
pub struct SpreadPolicy;

impl PlacementPolicy for SpreadPolicy {
    fn select(&mut self, bundles: &[Bundle], view: &NodeSnapshot) -> Option<PlacementDecision> {
        if bundles.is_empty() {
            return None;
        }
        let mut remaining = tentative(view);
        let mut placed = vec![0usize; remaining.len()];
        let mut bundle_nodes = Vec::with_capacity(bundles.len());

        for bundle in bundles {
            let slot = remaining
                .iter()
                .enumerate()
                .filter(|(_, (_, left))| left.is_superset_of(&bundle.resources))
                .min_by_key(|(i, _)| placed[*i])
                .map(|(i, _)| i)?;

            let (node, left) = &mut remaining[slot];
            left.subtract(&bundle.resources);
            placed[slot] += 1;
            bundle_nodes.push(node.id.clone());
        }

        Some(PlacementDecision { bundle_nodes })
    }
}

/// Every bundle on a distinct node
#[derive(Debug, Default)]
pub struct StrictSpreadPolicy;

impl PlacementPolicy for StrictSpreadPolicy {
    fn select(&mut self, bundles: &[Bundle], view: &NodeSnapshot) -> Option<PlacementDecision> {
        if bundles.is_empty() || bundles.len() > view.alive_count() {
            return None;
        }
        let mut used: HashSet<&NodeId> = HashSet::new();
        let mut bundle_nodes = Vec::with_capacity(bundles.len());

        for bundle in bundles {
            let node = view
                .alive_nodes()
                .find(|n| !used.contains(&n.id) && n.available.is_superset_of(&bundle.resources))?;
            used.insert(&node.id);
            bundle_nodes.push(node.id.clone());
        }

        Some(PlacementDecision { bundle_nodes })
    }
}

/// One policy instance per strategy
///
/// Policies keep state across attempts (the STRICT_PACK rotation), so the
/// set lives as long as the scheduler.
pub struct PolicySet {
    pack: PackPolicy,
    strict_pack: StrictPackPolicy,
    spread: SpreadPolicy,
    strict_spread: StrictSpreadPolicy,
}

impl PolicySet {
    pub fn new() -> Self {
        Self {
            pack: PackPolicy,
            strict_pack: StrictPackPolicy::new(),
            spread: SpreadPolicy,
            strict_spread: StrictSpreadPolicy,
        }
    }

    /// Policy implementing `strategy`
    pub fn for_strategy(&mut self, strategy: PlacementStrategy) -> &mut dyn PlacementPolicy {
        match strategy {
            PlacementStrategy::Pack => &mut self.pack,
            PlacementStrategy::StrictPack => &mut self.strict_pack,
            PlacementStrategy::Spread => &mut self.spread,
            PlacementStrategy::StrictSpread => &mut self.strict_spread,
        }
    }

    /// Select nodes for `bundles` under `strategy`
    pub fn select(
        &mut self,
        strategy: PlacementStrategy,
        bundles: &[Bundle],
        view: &NodeSnapshot,
    ) -> Option<PlacementDecision> {
        self.for_strategy(strategy).select(bundles, view)
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new()
    }
}
