//! Manually driven lease client
//!
//! Reservation requests park until the test answers them with
//! [`ManualLeaseClient::grant_next`]. Commits and cancels are acknowledged
//! immediately and counted.

use async_trait::async_trait;
use pgsched_core::{BundleId, NodeAddress, PgschedError, PgschedResult, ResourceSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use crate::traits::{LeaseClient, ReservationReply};

struct PendingReservation {
    bundle: BundleId,
    reply: oneshot::Sender<PgschedResult<ReservationReply>>,
}

/// Lease client whose reservation replies are supplied by the caller
pub struct ManualLeaseClient {
    address: NodeAddress,
    pending: Mutex<VecDeque<PendingReservation>>,
    committed: Mutex<Vec<BundleId>>,
    cancelled: Mutex<Vec<BundleId>>,
    reservations_requested: AtomicUsize,
    commits_requested: AtomicUsize,
    cancels_requested: AtomicUsize,
    fail_commits: AtomicBool,
}

impl ManualLeaseClient {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            pending: Mutex::new(VecDeque::new()),
            committed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            reservations_requested: AtomicUsize::new(0),
            commits_requested: AtomicUsize::new(0),
            cancels_requested: AtomicUsize::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Answer the oldest parked reservation
    ///
    /// Returns `false` if nothing was waiting.
    pub async fn grant_next(&self, granted: bool) -> bool {
        let reply = if granted {
            ReservationReply::Granted
        } else {
            ReservationReply::Denied
        };
        self.reply_next(Ok(reply)).await
    }

    /// Fail the oldest parked reservation as if the node were unreachable
    pub async fn fail_next(&self) -> bool {
        let error = PgschedError::Transport(format!("node {} unreachable", self.address));
        self.reply_next(Err(error)).await
    }

    async fn reply_next(&self, reply: PgschedResult<ReservationReply>) -> bool {
        let next = self.pending.lock().await.pop_front();
        match next {
            Some(pending) => {
                // The requester may have timed out already
                let _ = pending.reply.send(reply);
                true
            }
            None => false,
        }
    }

    /// Wait until at least `count` reservations are parked
    pub async fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                if self.pending.lock().await.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Number of reservations currently parked
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Bundles of the parked reservations, oldest first
    pub async fn pending_bundles(&self) -> Vec<BundleId> {
        self.pending.lock().await.iter().map(|p| p.bundle).collect()
    }

    /// Make every following commit fail
    pub fn set_commit_failure(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn num_reservations_requested(&self) -> usize {
        self.reservations_requested.load(Ordering::SeqCst)
    }

    pub fn num_commits_requested(&self) -> usize {
        self.commits_requested.load(Ordering::SeqCst)
    }

    pub fn num_cancels_requested(&self) -> usize {
        self.cancels_requested.load(Ordering::SeqCst)
    }

    /// Bundles whose commit was acknowledged
    pub async fn committed_bundles(&self) -> Vec<BundleId> {
        self.committed.lock().await.clone()
    }

    /// Bundles that received a cancel
    pub async fn cancelled_bundles(&self) -> Vec<BundleId> {
        self.cancelled.lock().await.clone()
    }
}

#[async_trait]
impl LeaseClient for ManualLeaseClient {
    async fn request_reservation(
        &self,
        bundle: BundleId,
        _resources: &ResourceSet,
    ) -> PgschedResult<ReservationReply> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .push_back(PendingReservation { bundle, reply: tx });
        self.reservations_requested.fetch_add(1, Ordering::SeqCst);

        rx.await.map_err(|_| {
            PgschedError::Transport(format!("reservation to {} dropped", self.address))
        })?
    }

    async fn commit(&self, bundle: BundleId) -> PgschedResult<()> {
        self.commits_requested.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(PgschedError::CommitFailure(format!(
                "node {} rejected commit of {}",
                self.address, bundle
            )));
        }
        self.committed.lock().await.push(bundle);
        Ok(())
    }

    async fn cancel(&self, bundle: BundleId) -> PgschedResult<()> {
        self.cancels_requested.fetch_add(1, Ordering::SeqCst);
        self.cancelled.lock().await.push(bundle);
        Ok(())
    }

    fn address(&self) -> &NodeAddress {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgsched_core::PlacementGroupId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_grant_releases_parked_request() {
        let client = Arc::new(ManualLeaseClient::new(NodeAddress::new("127.0.0.1", 0)));
        let bundle = BundleId {
            group_id: PlacementGroupId::new(),
            index: 0,
        };

        let requester = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request_reservation(bundle, &ResourceSet::new().with("CPU", 1.0))
                    .await
            })
        };

        assert!(client.wait_for_pending(1, Duration::from_secs(5)).await);
        assert_eq!(client.pending_bundles().await, vec![bundle]);
        assert!(client.grant_next(true).await);
        assert_eq!(requester.await.unwrap().unwrap(), ReservationReply::Granted);
        assert_eq!(client.num_reservations_requested(), 1);
        assert!(!client.grant_next(true).await);
    }

    #[tokio::test]
    async fn test_commit_failure_injection() {
        let client = ManualLeaseClient::new(NodeAddress::new("127.0.0.1", 0));
        let bundle = BundleId {
            group_id: PlacementGroupId::new(),
            index: 0,
        };

        client.set_commit_failure(true);
        assert!(client.commit(bundle).await.is_err());
        assert_eq!(client.num_commits_requested(), 1);
        assert!(client.committed_bundles().await.is_empty());
    }
}
