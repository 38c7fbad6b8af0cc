//! pgsched-scheduler: Placement group scheduling
//!
//! This crate turns a placement group into reserved resources on nodes:
//! - Node resource view (versioned snapshots of alive nodes)
//! - Placement policies per strategy (STRICT_PACK, PACK, SPREAD, STRICT_SPREAD)
//! - Lease coordinator driving the reserve / commit / cancel protocol
//! - Scheduler control loop and its caller-facing handle

pub mod coordinator;
pub mod placement;
pub mod scheduler;
pub mod view;

pub use coordinator::{AttemptId, ReservationOutcome};
pub use placement::{PlacementDecision, PlacementPolicy, PolicySet};
pub use scheduler::{ScheduleOutcome, Scheduler, SchedulerStats};
pub use view::{ClusterView, NodeResourceView, NodeSnapshot};
