//! AM lifecycle
//!
//! Ordered startup (validate config, start the control RPC, register,
//! spawn the master, request workers), a single wait on the completion
//! signal, and cooperative shutdown (stop the child, join launchers
//! within a bounded budget, unregister, stop the RPC).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterDescription, ClusterNode, ClusterPhase, ClusterStore, NodeRole, NodeState};
use crate::config::{AmEnvironment, LaunchOptions, SiteConfig};
use crate::engine::{
    ContainerLauncher, EnginePolicy, GaugeSnapshot, Gauges, LaunchSpec, Reconciler,
    MAX_TOLERABLE_FAILURES,
};
use crate::error::{AmError, EXIT_INTERNAL_ERROR, EXIT_SUCCESS};
use crate::resource::{
    FinalAppStatus, NmAdapter, NodeManagerProtocol, ProgressSource, Resource,
    ResourceManagerProtocol, RmAdapter, DEFAULT_HEARTBEAT_INTERVAL,
};
use crate::rpc::{self, AppState, ControlServer};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

/// Timing knobs of the lifecycle. Production uses the defaults; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Resource-manager heartbeat period.
    pub heartbeat_interval: Duration,
    /// Pause between the completion signal and teardown, so in-flight
    /// RPC replies can drain.
    pub drain_delay: Duration,
    /// Join budget granted to each launcher task at shutdown.
    pub launcher_join: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            drain_delay: Duration::from_secs(1),
            launcher_join: Duration::from_secs(10),
        }
    }
}

/// Final report of one AM run.
#[derive(Debug, Clone)]
pub struct AmOutcome {
    pub final_status: FinalAppStatus,
    pub gauges: GaugeSnapshot,
}

impl AmOutcome {
    pub fn succeeded(&self) -> bool {
        self.final_status == FinalAppStatus::Succeeded
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            EXIT_SUCCESS
        } else {
            EXIT_INTERNAL_ERROR
        }
    }
}

/// A started application master, ready to be joined.
pub struct AmHandle {
    /// Address of the control RPC server.
    pub rpc_addr: SocketAddr,
    pub store: Arc<ClusterStore>,
    pub gauges: Arc<Gauges>,
    completion: CancellationToken,
    teardown: CancellationToken,
    supervisor: Arc<ProcessSupervisor>,
    launcher: Arc<ContainerLauncher>,
    rm: Arc<RmAdapter>,
    rpc_server: ControlServer,
    engine_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    tuning: Tuning,
}

impl std::fmt::Debug for AmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmHandle").field("rpc_addr", &self.rpc_addr).finish_non_exhaustive()
    }
}

/// The application master entry point.
pub struct ApplicationMaster;

impl ApplicationMaster {
    /// Run the ordered startup sequence and return a handle blocked on
    /// nothing: the caller decides when to `join`.
    ///
    /// Configuration problems surface here, before any traffic reaches
    /// the resource manager.
    pub async fn start(
        options: LaunchOptions,
        env: AmEnvironment,
        tuning: Tuning,
        rm_protocol: Arc<dyn ResourceManagerProtocol>,
        nm_protocol: Arc<dyn NodeManagerProtocol>,
    ) -> Result<AmHandle, AmError> {
        options.validate()?;
        let site = SiteConfig::load(&options.generated_conf_dir)?;

        let store = Arc::new(ClusterStore::new(build_description(&options, &site)));
        let gauges = Arc::new(Gauges::new(options.workers));
        let progress = Arc::new(ProgressSource::new());
        let completion = CancellationToken::new();
        let teardown = CancellationToken::new();

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let supervisor = Arc::new(ProcessSupervisor::new(events_tx.clone()));
        let rm = Arc::new(RmAdapter::new(rm_protocol, events_tx.clone(), progress.clone()));
        let nm = Arc::new(NmAdapter::new(nm_protocol, events_tx.clone()));

        let spec = LaunchSpec {
            backing_home: options.backing_home.clone(),
            conf_dir: options.generated_conf_dir.clone(),
            log_dir: env.log_dir.clone(),
            worker_heap: options.worker_heap,
            master_heap: options.master_heap,
        };
        let launcher = Arc::new(ContainerLauncher::new(nm, store.clone(), spec.clone()));

        // The RPC server comes up first so registration can carry its
        // port; registration must precede any container request.
        let rpc_server = rpc::start(
            AppState {
                store: store.clone(),
                supervisor: supervisor.clone(),
                completion: completion.clone(),
                events: events_tx.clone(),
            },
            teardown.clone(),
        )
        .await?;
        let rpc_addr = rpc_server.addr;

        let tracking_url = format!("http://{}:{}/ws/v1/cluster/status", env.nm_host, rpc_addr.port());
        if let Err(e) = rm.register(&env.nm_host, rpc_addr.port(), &tracking_url).await {
            teardown.cancel();
            rpc_server.stop().await;
            return Err(e.into());
        }

        let worker_resource = Resource::megabytes(options.worker_heap);
        let engine_task = Reconciler::new(
            EnginePolicy {
                no_master: options.masters == 0,
                worker_resource,
                max_failures: MAX_TOLERABLE_FAILURES,
            },
            store.clone(),
            gauges.clone(),
            rm.clone(),
            launcher.clone(),
            supervisor.clone(),
            progress.clone(),
            completion.clone(),
            events_rx,
        )
        .spawn();

        if options.masters > 0 {
            if let Err(e) = spawn_master(&options, &env, &spec, &store, &supervisor) {
                // Already registered; report the failure before dying.
                let _ = rm
                    .unregister(FinalAppStatus::Failed, format!("master launch failed: {e}"))
                    .await;
                teardown.cancel();
                rpc_server.stop().await;
                engine_task.abort();
                return Err(e);
            }
        }

        if options.workers > 0 {
            info!(workers = options.workers, "requesting worker containers");
            gauges.add_requested(options.workers);
            rm.request_containers(worker_resource, options.workers);
        }

        let heartbeat_task = rm.start_heartbeat(tuning.heartbeat_interval, teardown.clone());

        store.set_phase(ClusterPhase::Live);
        info!(cluster = %options.name, "application master is live");

        if options.x_test {
            info!("test mode: completing immediately after startup");
            completion.cancel();
        }

        Ok(AmHandle {
            rpc_addr,
            store,
            gauges,
            completion,
            teardown,
            supervisor,
            launcher,
            rm,
            rpc_server,
            engine_task,
            heartbeat_task,
            tuning,
        })
    }
}

impl AmHandle {
    /// Idempotent completion signal; equivalent to the RPC stop.
    pub fn signal_complete(&self) {
        self.completion.cancel();
    }

    /// Block until the completion signal, then run the shutdown
    /// sequence and report the final status.
    pub async fn join(self) -> Result<AmOutcome, AmError> {
        self.completion.cancelled().await;

        // Deliberate pause so in-flight control replies can drain.
        tokio::time::sleep(self.tuning.drain_delay).await;

        info!("shutting down cluster");
        self.store.set_phase(ClusterPhase::Stopped);

        self.supervisor.stop().await;
        self.launcher.join_all(self.tuning.launcher_join).await;

        let snapshot = self.gauges.snapshot();
        let (final_status, diagnostics) = if snapshot.failed == 0 {
            (FinalAppStatus::Succeeded, String::new())
        } else {
            (
                FinalAppStatus::Failed,
                format!(
                    "{} of {} containers failed (completed {}, released {})",
                    snapshot.failed, snapshot.requested, snapshot.completed, snapshot.released
                ),
            )
        };

        if let Err(e) = self.rm.unregister(final_status, diagnostics).await {
            warn!(error = %e, "unregistration failed");
        }

        self.teardown.cancel();
        self.rpc_server.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.heartbeat_task).await;
        self.engine_task.abort();

        info!(?final_status, "application master finished");
        Ok(AmOutcome { final_status, gauges: snapshot })
    }
}

fn build_description(options: &LaunchOptions, site: &SiteConfig) -> ClusterDescription {
    let now = Utc::now().timestamp_millis();
    let mut desc = ClusterDescription::new(options.name.clone(), now);
    desc.state = ClusterPhase::Submitted;
    desc.masters = options.masters;
    desc.workers = options.workers;
    desc.master_heap = options.master_heap;
    desc.worker_heap = options.worker_heap;
    desc.client_properties = site.properties.clone();
    desc.root_path = site.root_path.clone();
    desc.zk_hosts = site.zk_hosts.clone();
    desc.zk_port = site.zk_port;
    desc.zk_path = site.zk_path.clone();
    desc
}

fn spawn_master(
    options: &LaunchOptions,
    env: &AmEnvironment,
    spec: &LaunchSpec,
    store: &ClusterStore,
    supervisor: &ProcessSupervisor,
) -> Result<(), AmError> {
    let command = spec
        .master_command(options.x_master_command.as_deref())
        .map_err(AmError::Launch)?;

    if let Err(e) = std::fs::create_dir_all(&spec.log_dir) {
        warn!(dir = %spec.log_dir.display(), error = %e, "cannot create log directory");
    }

    let mut node = ClusterNode::requested(
        env.container_id.clone(),
        NodeRole::Master,
        env.nm_host.clone(),
        command.join(" "),
    );
    node.state = NodeState::Submitted;
    store.add_master(node);

    info!(command = %command.join(" "), "spawning master process");
    supervisor.spawn(&command, &spec.master_env()).map_err(|e| match e {
        SupervisorError::AlreadyRunning => AmError::Internal(e.to_string()),
        other => AmError::Launch(other.to_string()),
    })
}
