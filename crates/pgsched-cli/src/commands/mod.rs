//! CLI commands implementation

use anyhow::Result;
use futures::future::join_all;
use pgsched_core::{
    NodeAddress, NodeId, PlacementGroup, PlacementStrategy, ResourceSet, SimulationConfig,
};
use pgsched_lease::{LeaseClient, LeaseClientFactory, LocalLeaseClient};
use pgsched_scheduler::{ClusterView, ScheduleOutcome, Scheduler, SchedulerStats};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// In-process cluster: a node view plus one accounting lease client per node
pub struct SimulatedCluster {
    view: Arc<ClusterView>,
    clients: HashMap<NodeAddress, Arc<LocalLeaseClient>>,
    nodes: Vec<(NodeId, NodeAddress)>,
}

impl SimulatedCluster {
    /// Register every node of `config` with the view
    pub async fn build(config: &SimulationConfig) -> Self {
        let view = Arc::new(ClusterView::new());
        let mut clients = HashMap::new();
        let mut nodes = Vec::with_capacity(config.nodes.len());

        for settings in &config.nodes {
            let address = NodeAddress::new(settings.host.clone(), settings.port);
            view.add(&settings.id, address.clone(), settings.resources.clone())
                .await;
            clients.insert(
                address.clone(),
                Arc::new(LocalLeaseClient::new(
                    address.clone(),
                    settings.resources.clone(),
                )),
            );
            nodes.push((NodeId::new(settings.id.clone()), address));
        }

        Self {
            view,
            clients,
            nodes,
        }
    }

    /// Factory handing out the node's own client
    pub fn lease_clients(&self) -> LeaseClientFactory {
        let clients = self.clients.clone();
        Arc::new(move |address: &NodeAddress| match clients.get(address) {
            Some(client) => client.clone() as Arc<dyn LeaseClient>,
            None => {
                warn!(address = %address, "No simulated node at address");
                Arc::new(LocalLeaseClient::new(address.clone(), ResourceSet::new()))
            }
        })
    }

    /// Report every node's current availability to the view
    pub async fn publish_heartbeats(&self) {
        for (id, address) in &self.nodes {
            if let Some(client) = self.clients.get(address) {
                self.view.update_available(id, client.available().await).await;
            }
        }
    }

    async fn node_reports(&self) -> Vec<NodeReport> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for (id, address) in &self.nodes {
            if let Some(client) = self.clients.get(address) {
                reports.push(NodeReport {
                    id: id.to_string(),
                    address: address.to_string(),
                    total: client.total().clone(),
                    available: client.available().await,
                    leases: client.lease_count().await,
                });
            }
        }
        reports
    }
}

/// One scheduled group in the report
#[derive(Debug, Serialize)]
pub struct GroupReport {
    pub name: String,
    pub strategy: PlacementStrategy,
    pub committed: bool,
    pub nodes: Vec<String>,
}

/// One node in the report
#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub id: String,
    pub address: String,
    pub total: ResourceSet,
    pub available: ResourceSet,
    pub leases: usize,
}

/// Full simulation result
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub groups: Vec<GroupReport>,
    pub nodes: Vec<NodeReport>,
    pub stats: SchedulerStats,
}

/// Schedule every configured group and collect the result
///
/// All rounds of one group are submitted together, so later rounds may race
/// for capacity the view still shows as free.
pub async fn run_simulation(config: &SimulationConfig) -> Result<SimulationReport> {
    let cluster = SimulatedCluster::build(config).await;
    let scheduler = Scheduler::start(
        cluster.view.clone(),
        cluster.lease_clients(),
        config.scheduler.clone(),
    );

    let mut groups = Vec::new();
    for settings in &config.groups {
        let batch: Vec<_> = (0..settings.rounds)
            .map(|round| {
                PlacementGroup::new(
                    format!("{}-{}", settings.name, round),
                    settings.strategy,
                    settings.bundles.clone(),
                )
                .into_shared()
            })
            .collect();

        let outcomes =
            join_all(batch.iter().map(|pg| scheduler.schedule_and_wait(pg.clone()))).await;
        cluster.publish_heartbeats().await;

        for (pg, outcome) in batch.iter().zip(outcomes) {
            let g = pg.read().await;
            groups.push(GroupReport {
                name: g.name.clone(),
                strategy: g.strategy,
                committed: outcome == ScheduleOutcome::Committed,
                nodes: g.nodes().iter().map(ToString::to_string).collect(),
            });
        }
        info!(group = %settings.name, rounds = settings.rounds, "Scheduled group");
    }

    let stats = scheduler.stats().await?;
    scheduler.shutdown();

    Ok(SimulationReport {
        groups,
        nodes: cluster.node_reports().await,
        stats,
    })
}

/// Run the simulation and print its report
pub async fn simulate(config: SimulationConfig, json: bool) -> Result<()> {
    let report = run_simulation(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.groups.is_empty() {
        println!("No placement groups configured");
    } else {
        println!(
            "{:<24} {:<14} {:<10} {:<30}",
            "GROUP", "STRATEGY", "RESULT", "NODES"
        );
        println!("{}", "-".repeat(80));
        for group in &report.groups {
            let result = if group.committed { "COMMITTED" } else { "FAILED" };
            println!(
                "{:<24} {:<14} {:<10} {:<30}",
                group.name,
                group.strategy.to_string(),
                result,
                group.nodes.join(",")
            );
        }
    }

    println!();
    print_nodes(&report.nodes);

    let stats = &report.stats;
    println!();
    println!("Attempts: {}", stats.attempts);
    println!("Committed: {}", stats.committed);
    println!("Failed (no capacity): {}", stats.failed_no_capacity);
    println!("Failed (reservation): {}", stats.failed_reservation);
    println!("Failed (transport): {}", stats.failed_transport);
    println!("Failed (timeout): {}", stats.failed_timeout);
    if stats.failed_internal > 0 {
        println!("Failed (internal): {}", stats.failed_internal);
    }
    println!("Rejected: {}", stats.rejected);
    if stats.commit_failures > 0 {
        println!("Unacknowledged commits: {}", stats.commit_failures);
    }

    Ok(())
}

fn print_nodes(nodes: &[NodeReport]) {
    if nodes.is_empty() {
        println!("No nodes configured");
        return;
    }
    println!(
        "{:<16} {:<22} {:<24} {:<24} {:<6}",
        "NODE", "ADDRESS", "TOTAL", "AVAILABLE", "LEASES"
    );
    println!("{}", "-".repeat(96));
    for node in nodes {
        println!(
            "{:<16} {:<22} {:<24} {:<24} {:<6}",
            node.id,
            node.address,
            node.total.to_string(),
            node.available.to_string(),
            node.leases
        );
    }
}

/// Print a summary of a validated cluster file
pub fn check(config: &SimulationConfig) -> Result<()> {
    println!("Configuration OK");
    println!();

    let capacity = ResourceSet::sum(config.nodes.iter().map(|n| &n.resources));
    println!("Nodes: {}", config.nodes.len());
    for node in &config.nodes {
        println!("  {} {}:{} {}", node.id, node.host, node.port, node.resources);
    }

    println!("Groups: {}", config.groups.len());
    let mut demand = ResourceSet::new();
    for group in &config.groups {
        let per_round = ResourceSet::sum(group.bundles.iter());
        for _ in 0..group.rounds {
            demand.add(&per_round);
        }
        println!(
            "  {} {} x{} bundles={} {}",
            group.name,
            group.strategy,
            group.rounds,
            group.bundles.len(),
            per_round
        );
    }

    println!();
    println!("Cluster capacity: {}", capacity);
    println!("Total demand: {}", demand);
    if !capacity.is_superset_of(&demand) {
        println!("Warning: total demand exceeds cluster capacity");
    }
    println!(
        "Scheduler: reservation timeout {}ms, {} commit attempts",
        config.scheduler.reservation_timeout_ms, config.scheduler.commit_max_attempts
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: &str = r#"
[[nodes]]
id = "node-0"
port = 7000
resources = { CPU = 4.0 }

[[nodes]]
id = "node-1"
port = 7001
resources = { CPU = 4.0 }

[[groups]]
name = "packed"
strategy = "STRICT_PACK"
bundles = [{ CPU = 1.0 }, { CPU = 1.0 }]

[[groups]]
name = "wide"
strategy = "PACK"
bundles = [{ CPU = 1.0 }, { CPU = 1.0 }, { CPU = 1.0 }, { CPU = 1.0 }, { CPU = 1.0 }]
"#;

    fn config() -> SimulationConfig {
        let config: SimulationConfig = toml::from_str(CLUSTER).unwrap();
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn test_simulation_commits_groups_that_fit() {
        let report = run_simulation(&config()).await.unwrap();

        assert_eq!(report.groups.len(), 2);
        assert!(report.groups[0].committed);
        assert_eq!(report.groups[0].nodes.len(), 1);

        // Two CPUs are left on the packed node, so the wide group spills over
        assert!(report.groups[1].committed);
        assert_eq!(report.groups[1].nodes.len(), 2);

        assert_eq!(report.stats.committed, 2);
        let free: f64 = report.nodes.iter().map(|n| n.available.get("CPU")).sum();
        assert_eq!(free, 1.0);
    }

    #[tokio::test]
    async fn test_heartbeats_publish_node_availability() {
        let config = config();
        let cluster = SimulatedCluster::build(&config).await;
        let address = NodeAddress::new("127.0.0.1", 7000);
        let bundle = PlacementGroup::new("g", PlacementStrategy::Pack, vec![ResourceSet::new()])
            .bundle_id(0);

        let factory = cluster.lease_clients();
        let client = factory(&address);
        client
            .request_reservation(bundle, &ResourceSet::new().with("CPU", 3.0))
            .await
            .unwrap();
        cluster.publish_heartbeats().await;

        let snapshot = pgsched_scheduler::NodeResourceView::snapshot(cluster.view.as_ref()).await;
        let node = snapshot.get(&NodeId::new("node-0")).unwrap();
        assert_eq!(node.available.get("CPU"), 1.0);
    }

    #[test]
    fn test_check_accepts_valid_config() {
        assert!(check(&config()).is_ok());
    }
}
