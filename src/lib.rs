//! Hoist Application Master library
//!
//! Hoist deploys an HBase-style distributed database (one master process
//! plus N region-server workers) as a long-running workload on a generic
//! cluster resource manager, then supervises it: a reconciliation engine
//! drives the observed cluster toward the desired role counts under an
//! asynchronous, lossy container-lifecycle protocol.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod resource;
pub mod rpc;
pub mod supervisor;

// Re-export commonly used types
pub use cluster::{ClusterDescription, ClusterStore};
pub use error::AmError;
pub use lifecycle::{AmHandle, AmOutcome, ApplicationMaster};
