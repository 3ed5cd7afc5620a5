//! Node-manager adapter
//!
//! Start, stop and status calls are non-blocking from the caller's
//! point of view: each runs to completion on its own task and resolves
//! to an engine event carrying the container id and, on failure, the
//! transport diagnostics.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::engine::EngineEvent;

use super::protocol::NodeManagerProtocol;
use super::types::{Container, ContainerId, LaunchContext, NodeAddr};

/// Adapter over the node-manager protocol.
pub struct NmAdapter {
    protocol: Arc<dyn NodeManagerProtocol>,
    events: UnboundedSender<EngineEvent>,
}

impl NmAdapter {
    pub fn new(protocol: Arc<dyn NodeManagerProtocol>, events: UnboundedSender<EngineEvent>) -> Self {
        Self { protocol, events }
    }

    /// Submit a launch request and report the outcome as an event.
    ///
    /// Run this on its own task; it blocks until the node manager
    /// acknowledges (or rejects) the launch.
    pub async fn start_container(&self, container: Container, ctx: LaunchContext) {
        let id = container.id.clone();
        debug!(container = %id, node = %container.node, "submitting container launch");
        match self.protocol.start_container(&container.node, &id, &ctx).await {
            Ok(()) => {
                let _ = self.events.send(EngineEvent::ContainerStarted(id));
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(EngineEvent::ContainerStartFailed { id, reason: e.to_string() });
            }
        }
    }

    /// Ask the node manager to stop a container. Non-blocking.
    pub fn stop_container(self: &Arc<Self>, id: ContainerId, node: NodeAddr) {
        let adapter = self.clone();
        tokio::spawn(async move {
            match adapter.protocol.stop_container(&node, &id).await {
                Ok(()) => {
                    let _ = adapter.events.send(EngineEvent::ContainerStopped(id));
                }
                Err(e) => {
                    let _ = adapter
                        .events
                        .send(EngineEvent::ContainerStopFailed { id, reason: e.to_string() });
                }
            }
        });
    }

    /// Query a container's state; the result is logged, not routed.
    pub fn query_status(self: &Arc<Self>, id: ContainerId, node: NodeAddr) {
        let adapter = self.clone();
        tokio::spawn(async move {
            match adapter.protocol.container_status(&node, &id).await {
                Ok(state) => debug!(container = %id, ?state, "container status"),
                Err(e) => debug!(container = %id, error = %e, "container status query failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use crate::resource::{RemoteContainerState, Resource, TransportError};

    #[derive(Default)]
    struct FakeNm {
        fail_start: bool,
        started: Mutex<Vec<ContainerId>>,
    }

    #[async_trait]
    impl NodeManagerProtocol for FakeNm {
        async fn start_container(
            &self,
            _node: &NodeAddr,
            id: &ContainerId,
            _ctx: &LaunchContext,
        ) -> Result<(), TransportError> {
            if self.fail_start {
                return Err(TransportError::Request("no such image".into()));
            }
            self.started.lock().push(id.clone());
            Ok(())
        }

        async fn stop_container(
            &self,
            _node: &NodeAddr,
            _id: &ContainerId,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn container_status(
            &self,
            _node: &NodeAddr,
            _id: &ContainerId,
        ) -> Result<RemoteContainerState, TransportError> {
            Ok(RemoteContainerState::Running)
        }
    }

    fn container(id: &str) -> Container {
        Container {
            id: ContainerId::new(id),
            node: NodeAddr::new("n1", 8041),
            resource: Resource::megabytes(256),
        }
    }

    fn ctx() -> LaunchContext {
        LaunchContext {
            commands: vec!["/bin/true".into()],
            env: Default::default(),
            resource: Resource::megabytes(256),
        }
    }

    #[tokio::test]
    async fn test_start_success_emits_started() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = NmAdapter::new(Arc::new(FakeNm::default()), tx);

        adapter.start_container(container("c1"), ctx()).await;

        match rx.try_recv().unwrap() {
            EngineEvent::ContainerStarted(id) => assert_eq!(id, ContainerId::new("c1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_failure_emits_error_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter =
            NmAdapter::new(Arc::new(FakeNm { fail_start: true, ..Default::default() }), tx);

        adapter.start_container(container("c2"), ctx()).await;

        match rx.try_recv().unwrap() {
            EngineEvent::ContainerStartFailed { id, reason } => {
                assert_eq!(id, ContainerId::new("c2"));
                assert!(reason.contains("no such image"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
