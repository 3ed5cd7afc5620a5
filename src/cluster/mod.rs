//! Cluster state model
//!
//! [`ClusterDescription`] is the single authoritative document of
//! desired and observed cluster state; [`ClusterStore`] wraps it in one
//! lock and publishes consistent JSON snapshots.

mod description;
mod store;

pub use description::{ClusterDescription, ClusterNode, ClusterPhase, NodeRole, NodeState};
pub use store::ClusterStore;
