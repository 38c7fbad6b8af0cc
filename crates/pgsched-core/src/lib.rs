//! pgsched-core: Core types for the placement group scheduler
//!
//! This crate provides the fundamental types used throughout pgsched:
//! - Placement groups, bundles and their lifecycle states
//! - Nodes and scalar resource sets
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod group;
pub mod node;
pub mod resources;

pub use config::*;
pub use error::*;
pub use group::*;
pub use node::*;
pub use resources::*;
