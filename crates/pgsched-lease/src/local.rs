//! In-process lease client with node-side admission accounting
//!
//! Stands in for a remote node: it debits its own available resources when
//! granting a reservation and credits them back on cancel. This is the
//! accounting that keeps reserved + committed bundles within the node's
//! total, so the scheduler never has to re-check it.

use async_trait::async_trait;
use pgsched_core::{BundleId, NodeAddress, PgschedError, PgschedResult, ResourceSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::traits::{LeaseClient, ReservationReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Reserved,
    Committed,
}

#[derive(Debug)]
struct Lease {
    resources: ResourceSet,
    state: LeaseState,
}

#[derive(Debug)]
struct Accounting {
    available: ResourceSet,
    leases: HashMap<BundleId, Lease>,
}

/// Lease client that owns a node's resource accounting
pub struct LocalLeaseClient {
    address: NodeAddress,
    total: ResourceSet,
    accounting: Mutex<Accounting>,
    reachable: AtomicBool,
}

impl LocalLeaseClient {
    /// Create a client for a node with the given total capacity
    pub fn new(address: NodeAddress, total: ResourceSet) -> Self {
        Self {
            address,
            accounting: Mutex::new(Accounting {
                available: total.clone(),
                leases: HashMap::new(),
            }),
            total,
            reachable: AtomicBool::new(true),
        }
    }

    /// Total capacity of the node
    pub fn total(&self) -> &ResourceSet {
        &self.total
    }

    /// Resources not held by any lease
    pub async fn available(&self) -> ResourceSet {
        self.accounting.lock().await.available.clone()
    }

    /// Number of leases (reserved or committed) currently held
    pub async fn lease_count(&self) -> usize {
        self.accounting.lock().await.leases.len()
    }

    /// Number of committed leases
    pub async fn committed_count(&self) -> usize {
        self.accounting
            .lock()
            .await
            .leases
            .values()
            .filter(|l| l.state == LeaseState::Committed)
            .count()
    }

    /// Simulate the node dropping off the network
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> PgschedResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PgschedError::Transport(format!("node {} unreachable", self.address)))
        }
    }
}

#[async_trait]
impl LeaseClient for LocalLeaseClient {
    async fn request_reservation(
        &self,
        bundle: BundleId,
        resources: &ResourceSet,
    ) -> PgschedResult<ReservationReply> {
        self.check_reachable()?;
        let mut accounting = self.accounting.lock().await;

        if accounting.leases.contains_key(&bundle) {
            debug!(bundle = %bundle, node = %self.address, "Reservation already held");
            return Ok(ReservationReply::Granted);
        }

        if !accounting.available.is_superset_of(resources) {
            debug!(
                bundle = %bundle,
                node = %self.address,
                requested = %resources,
                available = %accounting.available,
                "Reservation denied"
            );
            return Ok(ReservationReply::Denied);
        }

        accounting.available.subtract(resources);
        accounting.leases.insert(
            bundle,
            Lease {
                resources: resources.clone(),
                state: LeaseState::Reserved,
            },
        );

        debug!(bundle = %bundle, node = %self.address, "Reservation granted");
        Ok(ReservationReply::Granted)
    }

    async fn commit(&self, bundle: BundleId) -> PgschedResult<()> {
        self.check_reachable()?;
        let mut accounting = self.accounting.lock().await;
        let lease = accounting.leases.get_mut(&bundle).ok_or_else(|| {
            PgschedError::CommitFailure(format!("no reservation for bundle {}", bundle))
        })?;
        lease.state = LeaseState::Committed;

        info!(bundle = %bundle, node = %self.address, "Lease committed");
        Ok(())
    }

    async fn cancel(&self, bundle: BundleId) -> PgschedResult<()> {
        self.check_reachable()?;
        let mut accounting = self.accounting.lock().await;
        if let Some(lease) = accounting.leases.remove(&bundle) {
            accounting.available.add(&lease.resources);
            debug!(bundle = %bundle, node = %self.address, "Lease returned");
        }
        Ok(())
    }

    fn address(&self) -> &NodeAddress {
        &self.address
    }
}
