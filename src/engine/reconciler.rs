//! The reconciliation state machine
//!
//! Consumes the serialized event stream and drives the observed
//! cluster toward the desired worker count: surplus allocations are
//! released, real completions re-open capacity and trigger replacement
//! asks, and the termination conditions collapse into one idempotent
//! completion signal that wakes the AM lifecycle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterStore, NodeRole};
use crate::resource::{
    Container, ContainerId, ContainerStatus, NodeReport, ProgressSource, Resource, RmAdapter,
};
use crate::supervisor::ProcessSupervisor;

use super::event::EngineEvent;
use super::gauges::Gauges;
use super::launcher::ContainerLauncher;

/// Completed-with-failure count at which the cluster is declared
/// unviable and the AM terminates.
pub const MAX_TOLERABLE_FAILURES: u32 = 10;

/// Static policy inputs of the reconciler.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// True when no master is desired; the cluster then runs to
    /// completion and `completed == desired` terminates the AM.
    pub no_master: bool,
    /// Capability of every worker container.
    pub worker_resource: Resource,
    /// Failure threshold; see [`MAX_TOLERABLE_FAILURES`].
    pub max_failures: u32,
}

/// The reconciliation engine.
pub struct Reconciler {
    policy: EnginePolicy,
    store: Arc<ClusterStore>,
    gauges: Arc<Gauges>,
    rm: Arc<RmAdapter>,
    launcher: Arc<ContainerLauncher>,
    supervisor: Arc<ProcessSupervisor>,
    progress: Arc<ProgressSource>,
    completion: CancellationToken,
    allocated: DashMap<ContainerId, Container>,
    events: UnboundedReceiver<EngineEvent>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: EnginePolicy,
        store: Arc<ClusterStore>,
        gauges: Arc<Gauges>,
        rm: Arc<RmAdapter>,
        launcher: Arc<ContainerLauncher>,
        supervisor: Arc<ProcessSupervisor>,
        progress: Arc<ProgressSource>,
        completion: CancellationToken,
        events: UnboundedReceiver<EngineEvent>,
    ) -> Self {
        Self {
            policy,
            store,
            gauges,
            rm,
            launcher,
            supervisor,
            progress,
            completion,
            allocated: DashMap::new(),
            events,
        }
    }

    /// Consume events until every producer is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        debug!("event stream closed, reconciler exiting");
    }

    /// Spawn the reconciler task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Allocated(containers) => self.on_allocated(containers),
            EngineEvent::Completed(statuses) => self.on_completed(statuses),
            EngineEvent::ContainerStarted(id) => self.on_container_started(id),
            EngineEvent::ContainerStopped(id) => self.store.mark_stopped(&id),
            EngineEvent::ContainerStartFailed { id, reason } => {
                self.on_container_start_failed(id, reason)
            }
            EngineEvent::ContainerStopFailed { id, reason } => {
                warn!(container = %id, reason, "container stop failed");
                self.store.note_diagnostics(&id, &reason);
            }
            EngineEvent::NodesUpdated(reports) => self.on_nodes_updated(reports),
            EngineEvent::MasterStarted => {
                info!("master process is up");
                self.progress.set_master_live(true);
                self.store.master_started();
            }
            EngineEvent::MasterExited(code) => self.on_master_exited(code),
            EngineEvent::ShutdownRequested(reason) => {
                info!(reason, "shutdown requested");
                self.signal_complete();
            }
            EngineEvent::TransportFailed(message) => {
                error!(message, "resource-manager transport failed, terminating");
                self.signal_complete();
            }
            EngineEvent::AddWorkers(n) => {
                warn!(n, "add-nodes requested; cluster flexing is not implemented");
            }
            EngineEvent::RemoveWorkers(n) => {
                warn!(n, "delete-nodes requested; cluster flexing is not implemented");
            }
        }
    }

    /// Accept allocations up to the desired count; release the rest.
    ///
    /// The event loop is the only writer of the allocation map and the
    /// counters, so two grants can never both squeeze past the bound.
    fn on_allocated(&mut self, containers: Vec<Container>) {
        for container in containers {
            if self.gauges.allocated() >= self.gauges.desired() {
                info!(container = %container.id, "surplus allocation, releasing");
                self.rm.release_container(container.id);
                continue;
            }

            debug!(container = %container.id, node = %container.node, "allocation accepted");
            self.gauges.inc_allocated();
            self.allocated.insert(container.id.clone(), container.clone());
            self.launcher.launch(container, NodeRole::Worker);
        }
    }

    fn on_completed(&mut self, statuses: Vec<ContainerStatus>) {
        for status in statuses {
            if !status.state.is_terminal() {
                warn!(
                    container = %status.container_id,
                    state = ?status.state,
                    "completion report with non-terminal state, treating as terminal"
                );
            }

            let tracked = self.allocated.remove(&status.container_id).is_some();

            if status.is_aborted() {
                // Induced by our own release; not churn, not failure.
                debug!(container = %status.container_id, "released container completed");
                self.gauges.inc_released();
                if tracked {
                    self.gauges.dec_allocated();
                    self.store.retire_node(
                        &status.container_id,
                        status.exit_code,
                        &status.diagnostics,
                    );
                }
                continue;
            }

            if tracked {
                self.gauges.dec_allocated();
            }
            self.gauges.dec_requested();
            self.gauges.inc_completed();
            if status.exit_code != 0 {
                self.gauges.inc_failed();
            }
            info!(
                container = %status.container_id,
                exit_code = status.exit_code,
                diagnostics = %status.diagnostics,
                "worker completed"
            );
            self.store.retire_node(&status.container_id, status.exit_code, &status.diagnostics);
        }

        if !self.evaluate_completion() {
            self.refill();
        }
    }

    fn on_container_started(&mut self, id: ContainerId) {
        if self.store.promote_live(&id) {
            debug!(container = %id, "worker is live");
        } else {
            // Its completion may already have been processed.
            debug!(container = %id, "start confirmation for unknown container");
        }
    }

    /// A launch the node manager rejected: the container is useless,
    /// so hand it back and let the refill ask for a replacement.
    fn on_container_start_failed(&mut self, id: ContainerId, reason: String) {
        warn!(container = %id, reason, "container start failed");
        self.store.fail_node(&id, &reason);
        self.gauges.inc_failed();
        if self.allocated.remove(&id).is_some() {
            self.gauges.dec_allocated();
        }
        self.gauges.dec_requested();
        self.rm.release_container(id);

        if !self.evaluate_completion() {
            self.refill();
        }
    }

    fn on_nodes_updated(&mut self, reports: Vec<NodeReport>) {
        for report in reports {
            if report.healthy {
                debug!(node = %report.node, "node report");
            } else {
                warn!(node = %report.node, diagnostics = %report.diagnostics, "node unhealthy");
            }
        }
    }

    fn on_master_exited(&mut self, code: i32) {
        info!(code, "master process exited, terminating cluster");
        self.progress.set_master_live(false);
        self.store.master_exited(code, self.supervisor.recent_output());
        self.signal_complete();
    }

    /// Check the termination rules. Returns true when the AM is done;
    /// callers must not issue further requests in that case.
    fn evaluate_completion(&self) -> bool {
        let failed = self.gauges.failed();
        if failed >= self.policy.max_failures {
            warn!(failed, threshold = self.policy.max_failures, "failure threshold reached");
            self.signal_complete();
            return true;
        }

        if self.policy.no_master && self.gauges.completed() >= self.gauges.desired() {
            info!(completed = self.gauges.completed(), "all workers completed");
            self.signal_complete();
            return true;
        }

        self.completion.is_cancelled()
    }

    /// Ask for replacements up to the desired count. Never runs once
    /// completion has been signalled.
    fn refill(&self) {
        let desired = self.gauges.desired();
        let requested = self.gauges.requested();
        if desired > requested {
            let ask = desired - requested;
            info!(ask, "requesting replacement containers");
            self.gauges.add_requested(ask);
            self.rm.request_containers(self.policy.worker_resource, ask);
        }
    }

    /// Wake the AM lifecycle; collapsing duplicate signals.
    fn signal_complete(&self) {
        if !self.completion.is_cancelled() {
            info!("signalling AM completion");
            self.completion.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use tokio::sync::mpsc::{self, UnboundedSender};

    use crate::cluster::ClusterDescription;
    use crate::engine::LaunchSpec;
    use crate::resource::{
        HeartbeatRequest, HeartbeatResponse, LaunchContext, NmAdapter, NodeAddr,
        NodeManagerProtocol, RegisterRequest, RegistrationResponse, RemoteContainerState,
        ResourceManagerProtocol, TransportError, UnregisterRequest, ABORTED_EXIT_CODE,
    };

    #[derive(Default)]
    struct RecordingRm {
        beats: Mutex<Vec<HeartbeatRequest>>,
    }

    #[async_trait]
    impl ResourceManagerProtocol for RecordingRm {
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
            self.beats.lock().push(req.clone());
            Ok(HeartbeatResponse::default())
        }

        async fn unregister(&self, _req: &UnregisterRequest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct QuietNm;

    #[async_trait]
    impl NodeManagerProtocol for QuietNm {
        async fn start_container(
            &self,
            _node: &NodeAddr,
            _id: &ContainerId,
            _ctx: &LaunchContext,
        ) -> Result<(), TransportError> {
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

    struct Fixture {
        engine: Reconciler,
        rm_protocol: Arc<RecordingRm>,
        rm: Arc<RmAdapter>,
        store: Arc<ClusterStore>,
        gauges: Arc<Gauges>,
        completion: CancellationToken,
        _tx: UnboundedSender<EngineEvent>,
    }

    fn fixture(desired: u32, no_master: bool, max_failures: u32) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(ClusterStore::new(ClusterDescription::new("t", 1)));
        let gauges = Arc::new(Gauges::new(desired));
        let progress = Arc::new(ProgressSource::new());
        let rm_protocol = Arc::new(RecordingRm::default());
        let rm = Arc::new(RmAdapter::new(rm_protocol.clone(), tx.clone(), progress.clone()));
        let nm = Arc::new(NmAdapter::new(Arc::new(QuietNm), tx.clone()));
        let launcher = Arc::new(ContainerLauncher::new(
            nm,
            store.clone(),
            LaunchSpec {
                backing_home: PathBuf::from("/opt/hbase"),
                conf_dir: PathBuf::from("/conf"),
                log_dir: PathBuf::from("/logs"),
                worker_heap: 256,
                master_heap: 256,
            },
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(tx.clone()));
        let completion = CancellationToken::new();

        let engine = Reconciler::new(
            EnginePolicy { no_master, worker_resource: Resource::megabytes(256), max_failures },
            store.clone(),
            gauges.clone(),
            rm.clone(),
            launcher,
            supervisor,
            progress,
            completion.clone(),
            rx,
        );

        Fixture { engine, rm_protocol, rm, store, gauges, completion, _tx: tx }
    }

    fn container(id: &str) -> Container {
        Container {
            id: ContainerId::new(id),
            node: NodeAddr::new("n1", 8041),
            resource: Resource::megabytes(256),
        }
    }

    fn completed(id: &str, exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            container_id: ContainerId::new(id),
            state: RemoteContainerState::Complete,
            exit_code,
            diagnostics: String::new(),
        }
    }

    /// Drain the adapter queues into the recording protocol.
    async fn beat(f: &Fixture) -> HeartbeatRequest {
        f.rm.heartbeat_once().await;
        f.rm_protocol.beats.lock().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_surplus_allocation_is_released() {
        let mut f = fixture(2, true, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(2);

        f.engine.handle(EngineEvent::Allocated(vec![
            container("c1"),
            container("c2"),
            container("c3"),
        ]));

        assert_eq!(f.gauges.allocated(), 2);
        let beat = beat(&f).await;
        assert_eq!(beat.releases, vec![ContainerId::new("c3")]);
        assert_eq!(f.store.snapshot().requested_nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_started_promotes_node_to_live() {
        let mut f = fixture(1, true, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        f.engine.handle(EngineEvent::ContainerStarted(ContainerId::new("c1")));

        let snap = f.store.snapshot();
        assert_eq!(snap.worker_nodes.len(), 1);
        assert_eq!(snap.worker_nodes[0].state, crate::cluster::NodeState::Live);
        assert!(snap.requested_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_failed_completion_refills_capacity() {
        let mut f = fixture(2, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(2);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1"), container("c2")]));
        f.engine.handle(EngineEvent::ContainerStarted(ContainerId::new("c1")));
        f.engine.handle(EngineEvent::ContainerStarted(ContainerId::new("c2")));

        f.engine.handle(EngineEvent::Completed(vec![completed("c1", 1)]));

        assert_eq!(f.gauges.completed(), 1);
        assert_eq!(f.gauges.failed(), 1);
        assert_eq!(f.gauges.allocated(), 1);
        // Capacity re-opened and re-asked.
        assert_eq!(f.gauges.requested(), 2);
        let beat = beat(&f).await;
        assert_eq!(beat.asks.len(), 1);
        assert_eq!(beat.asks[0].count, 1);

        let snap = f.store.snapshot();
        assert_eq!(snap.completed_nodes.len(), 1);
        assert_eq!(snap.worker_nodes.len(), 1);
        assert!(!f.completion.is_cancelled());
    }

    #[tokio::test]
    async fn test_aborted_completion_counts_released_only() {
        let mut f = fixture(1, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        f.engine.handle(EngineEvent::Completed(vec![completed("c1", ABORTED_EXIT_CODE)]));

        assert_eq!(f.gauges.released(), 1);
        assert_eq!(f.gauges.completed(), 0);
        assert_eq!(f.gauges.failed(), 0);
        // A release does not re-open request capacity.
        assert_eq!(f.gauges.requested(), 1);
        let beat = beat(&f).await;
        assert!(beat.asks.is_empty());
    }

    #[tokio::test]
    async fn test_no_requests_after_completion_signal() {
        let mut f = fixture(2, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(2);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1"), container("c2")]));

        f.engine.handle(EngineEvent::ShutdownRequested("operator stop".into()));
        assert!(f.completion.is_cancelled());

        f.engine.handle(EngineEvent::Completed(vec![completed("c1", 1)]));

        let beat = beat(&f).await;
        assert!(beat.asks.is_empty(), "no container request may follow the completion signal");
    }

    #[tokio::test]
    async fn test_masterless_cluster_terminates_when_workers_complete() {
        let mut f = fixture(1, true, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        f.engine.handle(EngineEvent::Completed(vec![completed("c1", 0)]));

        assert!(f.completion.is_cancelled());
        assert_eq!(f.gauges.failed(), 0);
    }

    #[tokio::test]
    async fn test_completion_with_master_does_not_terminate() {
        let mut f = fixture(1, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        f.engine.handle(EngineEvent::Completed(vec![completed("c1", 0)]));

        assert!(!f.completion.is_cancelled());
        // The worker is replaced instead.
        assert_eq!(f.gauges.requested(), 1);
    }

    #[tokio::test]
    async fn test_failure_threshold_terminates() {
        let mut f = fixture(2, false, 3);
        for i in 0..3 {
            f.gauges.add_requested(1);
            let id = format!("c{i}");
            f.engine.handle(EngineEvent::Allocated(vec![container(&id)]));
            f.engine.handle(EngineEvent::Completed(vec![completed(&id, 1)]));
        }

        assert_eq!(f.gauges.failed(), 3);
        assert!(f.completion.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_failure_releases_and_reasks() {
        let mut f = fixture(1, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        f.engine.handle(EngineEvent::ContainerStartFailed {
            id: ContainerId::new("c1"),
            reason: "image missing".into(),
        });

        assert_eq!(f.gauges.failed(), 1);
        assert_eq!(f.gauges.allocated(), 0);
        let snap = f.store.snapshot();
        assert_eq!(snap.failed_nodes.len(), 1);

        let beat = beat(&f).await;
        assert_eq!(beat.releases, vec![ContainerId::new("c1")]);
        assert_eq!(beat.asks.len(), 1);
    }

    #[tokio::test]
    async fn test_completion_before_start_confirmation() {
        let mut f = fixture(1, false, MAX_TOLERABLE_FAILURES);
        f.gauges.add_requested(1);
        f.engine.handle(EngineEvent::Allocated(vec![container("c1")]));

        // RM reports the terminal state before the NM start result.
        f.engine.handle(EngineEvent::Completed(vec![completed("c1", 137)]));
        f.engine.handle(EngineEvent::ContainerStarted(ContainerId::new("c1")));

        let snap = f.store.snapshot();
        assert_eq!(snap.completed_nodes.len(), 1);
        assert!(snap.worker_nodes.is_empty());
        assert!(snap.requested_nodes.is_empty());
    }
}
