//! Resource-manager adapter
//!
//! Owns the pending ask/release queues and the heartbeat loop. Asks and
//! releases enqueue without blocking; each beat drains the queues,
//! reports progress and maps the response into engine events. A bounded
//! run of consecutive heartbeat failures is tolerated before the
//! adapter declares the transport dead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::EngineEvent;

use super::protocol::{ResourceManagerProtocol, TransportError};
use super::types::{
    ContainerAsk, ContainerId, FinalAppStatus, HeartbeatRequest, RegisterRequest,
    RegistrationResponse, Resource, UnregisterRequest,
};

/// Heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Consecutive heartbeat failures tolerated before the transport is
/// declared dead.
const MAX_HEARTBEAT_FAILURES: u32 = 5;

/// Progress reported to the resource manager on every heartbeat.
///
/// 0 until the master process runs, 50 afterwards; 100 is implicit in
/// unregistration.
#[derive(Debug, Default)]
pub struct ProgressSource {
    master_live: AtomicBool,
}

impl ProgressSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_master_live(&self, live: bool) {
        self.master_live.store(live, Ordering::SeqCst);
    }

    pub fn percent(&self) -> f32 {
        if self.master_live.load(Ordering::SeqCst) {
            50.0
        } else {
            0.0
        }
    }
}

/// Adapter over the resource-manager protocol.
pub struct RmAdapter {
    protocol: Arc<dyn ResourceManagerProtocol>,
    events: UnboundedSender<EngineEvent>,
    progress: Arc<ProgressSource>,
    asks: Mutex<Vec<ContainerAsk>>,
    releases: Mutex<Vec<ContainerId>>,
    heartbeat_failures: Mutex<u32>,
}

impl RmAdapter {
    pub fn new(
        protocol: Arc<dyn ResourceManagerProtocol>,
        events: UnboundedSender<EngineEvent>,
        progress: Arc<ProgressSource>,
    ) -> Self {
        Self {
            protocol,
            events,
            progress,
            asks: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            heartbeat_failures: Mutex::new(0),
        }
    }

    /// Register with the resource manager. Blocking; retried by the
    /// transport. Must precede any container request.
    pub async fn register(
        &self,
        host: &str,
        port: u16,
        tracking_url: &str,
    ) -> Result<RegistrationResponse, TransportError> {
        let req = RegisterRequest {
            host: host.to_string(),
            port,
            tracking_url: tracking_url.to_string(),
        };
        let resp = self.protocol.register(&req).await?;
        info!(
            host,
            port,
            max_memory_mb = resp.maximum_capability.memory_mb,
            "registered with resource manager"
        );
        Ok(resp)
    }

    /// Queue a request for `count` worker containers. Non-blocking; the
    /// ask goes out with the next heartbeat.
    pub fn request_containers(&self, resource: Resource, count: u32) {
        if count == 0 {
            return;
        }
        debug!(count, memory_mb = resource.memory_mb, "queueing container ask");
        self.asks.lock().push(ContainerAsk {
            resource,
            count,
            priority: 0,
            host_hints: Vec::new(),
            rack_hints: Vec::new(),
        });
    }

    /// Queue a container release. Non-blocking.
    pub fn release_container(&self, id: ContainerId) {
        debug!(container = %id, "queueing container release");
        self.releases.lock().push(id);
    }

    /// Unregister with a final status. Blocking; retried by the
    /// transport.
    pub async fn unregister(
        &self,
        final_status: FinalAppStatus,
        diagnostics: String,
    ) -> Result<(), TransportError> {
        info!(?final_status, "unregistering from resource manager");
        self.protocol
            .unregister(&UnregisterRequest { final_status, diagnostics })
            .await
    }

    /// Perform one heartbeat: drain the queues, report progress, map
    /// the response into engine events in arrival order.
    pub async fn heartbeat_once(&self) {
        let asks: Vec<ContainerAsk> = std::mem::take(&mut *self.asks.lock());
        let releases: Vec<ContainerId> = std::mem::take(&mut *self.releases.lock());

        let req = HeartbeatRequest {
            progress: self.progress.percent(),
            asks: asks.clone(),
            releases: releases.clone(),
        };

        match self.protocol.heartbeat(&req).await {
            Ok(resp) => {
                *self.heartbeat_failures.lock() = 0;

                if !resp.allocated.is_empty() {
                    let _ = self.events.send(EngineEvent::Allocated(resp.allocated));
                }
                if !resp.completed.is_empty() {
                    let _ = self.events.send(EngineEvent::Completed(resp.completed));
                }
                if !resp.updated_nodes.is_empty() {
                    let _ = self.events.send(EngineEvent::NodesUpdated(resp.updated_nodes));
                }
                if resp.shutdown {
                    let _ = self.events.send(EngineEvent::ShutdownRequested(
                        "resource manager requested shutdown".into(),
                    ));
                }
            }
            Err(e) => {
                // Requeue so the asks and releases go out with the next
                // successful beat.
                self.asks.lock().splice(0..0, asks);
                self.releases.lock().splice(0..0, releases);

                let failures = {
                    let mut guard = self.heartbeat_failures.lock();
                    *guard += 1;
                    *guard
                };
                warn!(failures, error = %e, "resource manager heartbeat failed");

                if failures >= MAX_HEARTBEAT_FAILURES {
                    error!("resource manager unreachable after {failures} heartbeats");
                    let _ = self.events.send(EngineEvent::TransportFailed(e.to_string()));
                }
            }
        }
    }

    /// Spawn the heartbeat loop. Runs until `shutdown` is cancelled.
    pub fn start_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("heartbeat loop stopped");
                        return;
                    }
                    _ = ticker.tick() => adapter.heartbeat_once().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::resource::{
        Container, HeartbeatResponse, NodeAddr, RegistrationResponse, RemoteContainerState,
    };

    struct ScriptedRm {
        responses: Mutex<Vec<Result<HeartbeatResponse, TransportError>>>,
        seen: Mutex<Vec<HeartbeatRequest>>,
    }

    #[async_trait]
    impl ResourceManagerProtocol for ScriptedRm {
        async fn register(
            &self,
            _req: &RegisterRequest,
        ) -> Result<RegistrationResponse, TransportError> {
            Ok(RegistrationResponse { maximum_capability: Resource::megabytes(8192) })
        }

        async fn heartbeat(
            &self,
            req: &HeartbeatRequest,
        ) -> Result<HeartbeatResponse, TransportError> {
            self.seen.lock().push(req.clone());
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(HeartbeatResponse::default())
            } else {
                responses.remove(0)
            }
        }

        async fn unregister(&self, _req: &UnregisterRequest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn adapter(
        responses: Vec<Result<HeartbeatResponse, TransportError>>,
    ) -> (Arc<ScriptedRm>, RmAdapter, mpsc::UnboundedReceiver<EngineEvent>) {
        let rm = Arc::new(ScriptedRm {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = RmAdapter::new(rm.clone(), tx, Arc::new(ProgressSource::new()));
        (rm, adapter, rx)
    }

    #[tokio::test]
    async fn test_heartbeat_drains_queues_and_emits_events() {
        let container = Container {
            id: ContainerId::new("c1"),
            node: NodeAddr::new("n1", 8041),
            resource: Resource::megabytes(256),
        };
        let (rm, adapter, mut rx) = adapter(vec![Ok(HeartbeatResponse {
            allocated: vec![container],
            ..Default::default()
        })]);

        adapter.request_containers(Resource::megabytes(256), 2);
        adapter.release_container(ContainerId::new("c0"));
        adapter.heartbeat_once().await;

        let seen = rm.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].asks.len(), 1);
        assert_eq!(seen[0].asks[0].count, 2);
        assert_eq!(seen[0].releases, vec![ContainerId::new("c0")]);

        match rx.try_recv().unwrap() {
            EngineEvent::Allocated(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_heartbeat_requeues_asks() {
        let (rm, adapter, _rx) =
            adapter(vec![Err(TransportError::Request("down".into())), Ok(Default::default())]);

        adapter.request_containers(Resource::megabytes(256), 3);
        adapter.heartbeat_once().await;
        // The ask was not lost; the next beat carries it.
        adapter.heartbeat_once().await;

        let seen = rm.seen.lock();
        assert_eq!(seen[1].asks.len(), 1);
        assert_eq!(seen[1].asks[0].count, 3);
    }

    #[tokio::test]
    async fn test_transport_declared_dead_after_bounded_failures() {
        let responses =
            (0..MAX_HEARTBEAT_FAILURES).map(|_| Err(TransportError::Request("down".into())));
        let (_rm, adapter, mut rx) = adapter(responses.collect());

        for _ in 0..MAX_HEARTBEAT_FAILURES {
            adapter.heartbeat_once().await;
        }

        let mut saw_failure = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, EngineEvent::TransportFailed(_)) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_completed_shutdown_mapping() {
        let status = crate::resource::ContainerStatus {
            container_id: ContainerId::new("c9"),
            state: RemoteContainerState::Complete,
            exit_code: 1,
            diagnostics: "oom".into(),
        };
        let (_rm, adapter, mut rx) = adapter(vec![Ok(HeartbeatResponse {
            completed: vec![status],
            shutdown: true,
            ..Default::default()
        })]);

        adapter.heartbeat_once().await;

        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::Completed(_)));
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::ShutdownRequested(_)));
    }
}
