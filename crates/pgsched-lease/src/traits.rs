//! Lease client trait definitions

use async_trait::async_trait;
use pgsched_core::{BundleId, NodeAddress, PgschedResult, ResourceSet};

/// A node's answer to a reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationReply {
    Granted,
    Denied,
}

/// Lease protocol against a single node
///
/// An `Err` from any call means the node could not be reached; the
/// scheduler treats a failed reservation like a denial.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Ask the node to hold `resources` for `bundle`
    async fn request_reservation(
        &self,
        bundle: BundleId,
        resources: &ResourceSet,
    ) -> PgschedResult<ReservationReply>;

    /// Confirm a granted reservation
    async fn commit(&self, bundle: BundleId) -> PgschedResult<()>;

    /// Release a reservation held for `bundle`
    async fn cancel(&self, bundle: BundleId) -> PgschedResult<()>;

    /// Address of the node this client talks to
    fn address(&self) -> &NodeAddress;
}
