//! Protocol trait definitions
//!
//! The AM never speaks the resource manager's wire format directly;
//! it goes through these traits so the transport can be swapped out
//! (the HTTP implementation in production, in-memory fakes in tests).

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    ContainerId, HeartbeatRequest, HeartbeatResponse, LaunchContext, NodeAddr, RegisterRequest,
    RegistrationResponse, RemoteContainerState, UnregisterRequest,
};

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("retries exhausted: {0}")]
    RetryExhausted(String),
}

impl TransportError {
    /// Whether the operation is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(_) => true,
            TransportError::Endpoint { status, .. } => *status >= 500,
            TransportError::InvalidAddress(_) | TransportError::RetryExhausted(_) => false,
        }
    }
}

/// The application-master side of the resource-manager protocol.
#[async_trait]
pub trait ResourceManagerProtocol: Send + Sync {
    /// Register this AM; must precede any container traffic.
    async fn register(&self, req: &RegisterRequest) -> Result<RegistrationResponse, TransportError>;

    /// One heartbeat: progress plus pending asks and releases; the
    /// response carries every allocation, completion and node update
    /// that arrived since the previous beat, in arrival order.
    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError>;

    /// Unregister with a final status; the resource manager tears down
    /// any containers still assigned to the application.
    async fn unregister(&self, req: &UnregisterRequest) -> Result<(), TransportError>;
}

/// The application-master side of the node-manager protocol.
#[async_trait]
pub trait NodeManagerProtocol: Send + Sync {
    /// Launch a process inside an allocated container.
    async fn start_container(
        &self,
        node: &NodeAddr,
        id: &ContainerId,
        ctx: &LaunchContext,
    ) -> Result<(), TransportError>;

    /// Stop a running container.
    async fn stop_container(&self, node: &NodeAddr, id: &ContainerId)
        -> Result<(), TransportError>;

    /// Query a container's lifecycle state.
    async fn container_status(
        &self,
        node: &NodeAddr,
        id: &ContainerId,
    ) -> Result<RemoteContainerState, TransportError>;
}
