//! pgsched-lease: Node lease clients
//!
//! This crate provides the node-facing side of the reservation protocol:
//! - The `LeaseClient` trait (reserve, commit, cancel against one node)
//! - A registry that lazily creates one client per node address
//! - An in-process client with node-side admission accounting
//! - A manually driven client for tests

pub mod local;
pub mod manual;
pub mod registry;
pub mod traits;

pub use local::LocalLeaseClient;
pub use manual::ManualLeaseClient;
pub use registry::{LeaseClientFactory, LeaseClientRegistry};
pub use traits::{LeaseClient, ReservationReply};
