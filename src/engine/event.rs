//! The single serialized event stream feeding the reconciler

use crate::resource::{Container, ContainerId, ContainerStatus, NodeReport};

/// Everything the reconciler reacts to.
///
/// Producers: the RM adapter (allocations, completions, node updates,
/// shutdown, transport errors), the NM adapter (per-container start and
/// stop results), the process supervisor (master lifecycle) and the
/// control RPC (flex requests). Events of one kind are delivered in
/// arrival order; no ordering holds across kinds — in particular a
/// completion may arrive before the matching start result.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Containers granted by the resource manager.
    Allocated(Vec<Container>),

    /// Containers that reached a terminal state.
    Completed(Vec<ContainerStatus>),

    /// A node manager accepted the launch request.
    ContainerStarted(ContainerId),

    /// A node manager confirmed a stop request.
    ContainerStopped(ContainerId),

    /// The launch request failed on the node manager.
    ContainerStartFailed { id: ContainerId, reason: String },

    /// A stop request failed on the node manager.
    ContainerStopFailed { id: ContainerId, reason: String },

    /// Cluster-node health reports from the resource manager.
    NodesUpdated(Vec<NodeReport>),

    /// The supervised master process is up.
    MasterStarted,

    /// The supervised master process terminated.
    MasterExited(i32),

    /// The resource manager (or an operator) asked the AM to shut down.
    ShutdownRequested(String),

    /// The RM transport is persistently failing.
    TransportFailed(String),

    /// Operator intent to grow the worker set.
    AddWorkers(u32),

    /// Operator intent to shrink the worker set.
    RemoveWorkers(u32),
}
