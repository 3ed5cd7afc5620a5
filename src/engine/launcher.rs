//! Container launcher
//!
//! For each allocated container, builds the launch context — command
//! vector, environment, resource tags — registers a REQUESTED node in
//! the store and submits the launch through the NM adapter on its own
//! task. The node is promoted to LIVE only when the node manager
//! confirms the start. Launch tasks are joined at shutdown with a
//! bounded per-task deadline; stragglers are abandoned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::cluster::{ClusterNode, ClusterStore, NodeRole};
use crate::resource::{Container, ContainerId, LaunchContext, NmAdapter};

/// Static inputs of every worker launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Installation root of the backing service.
    pub backing_home: PathBuf,
    /// Staged configuration directory passed to every process.
    pub conf_dir: PathBuf,
    /// Log directory exported to the child environment.
    pub log_dir: PathBuf,
    /// Worker heap size in MB.
    pub worker_heap: u32,
    /// Master heap size in MB.
    pub master_heap: u32,
}

impl LaunchSpec {
    /// Command vector for a region-server worker.
    fn worker_command(&self) -> Vec<String> {
        vec![
            self.backing_home.join("bin/hbase").to_string_lossy().into_owned(),
            "--config".to_string(),
            self.conf_dir.to_string_lossy().into_owned(),
            "regionserver".to_string(),
            "start".to_string(),
        ]
    }

    /// Environment added to the worker's inherited environment.
    fn worker_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert("LOG_DIR".to_string(), self.log_dir.to_string_lossy().into_owned());
        env.insert("HBASE_HEAPSIZE".to_string(), format!("{}m", self.worker_heap));
        env
    }

    /// Command vector for the supervised master process, honoring the
    /// test-hook override when present.
    pub fn master_command(&self, override_command: Option<&str>) -> Result<Vec<String>, String> {
        if let Some(raw) = override_command {
            return shell_words::split(raw).map_err(|e| format!("bad master command: {e}"));
        }
        Ok(vec![
            self.backing_home.join("bin/hbase").to_string_lossy().into_owned(),
            "--config".to_string(),
            self.conf_dir.to_string_lossy().into_owned(),
            "master".to_string(),
            "start".to_string(),
        ])
    }

    /// Environment added to the master's inherited environment.
    pub fn master_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert("LOG_DIR".to_string(), self.log_dir.to_string_lossy().into_owned());
        env.insert("HBASE_HEAPSIZE".to_string(), format!("{}m", self.master_heap));
        env
    }
}

/// Launches workers into allocated containers.
pub struct ContainerLauncher {
    nm: Arc<NmAdapter>,
    store: Arc<ClusterStore>,
    spec: LaunchSpec,
    handles: Mutex<Vec<(ContainerId, JoinHandle<()>)>>,
}

impl ContainerLauncher {
    pub fn new(nm: Arc<NmAdapter>, store: Arc<ClusterStore>, spec: LaunchSpec) -> Self {
        Self { nm, store, spec, handles: Mutex::new(Vec::new()) }
    }

    /// Build the launch context for `container` and submit it. Returns
    /// immediately; the outcome arrives as an engine event.
    pub fn launch(&self, container: Container, role: NodeRole) {
        let commands = self.spec.worker_command();
        let ctx = LaunchContext {
            commands: commands.clone(),
            env: self.spec.worker_env(),
            resource: container.resource,
        };

        self.store.add_requested(ClusterNode::requested(
            container.id.as_str(),
            role,
            container.node.host.clone(),
            commands.join(" "),
        ));

        let id = container.id.clone();
        debug!(container = %id, node = %container.node, "launching worker");

        let nm = self.nm.clone();
        let span = info_span!("launch", container = %id);
        let handle = tokio::spawn(
            async move {
                nm.start_container(container, ctx).await;
            }
            .instrument(span),
        );
        self.handles.lock().push((id, handle));
    }

    /// Join every launch task, granting each the per-task deadline.
    /// Tasks that overrun are abandoned; their node state stays in the
    /// store.
    pub async fn join_all(&self, per_task: Duration) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for (id, handle) in handles {
            match tokio::time::timeout(per_task, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(container = %id, error = %e, "launch task panicked"),
                Err(_) => warn!(container = %id, "launch task did not finish, abandoning"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            backing_home: PathBuf::from("/opt/hbase"),
            conf_dir: PathBuf::from("/var/conf"),
            log_dir: PathBuf::from("/var/log/hoist"),
            worker_heap: 512,
            master_heap: 1024,
        }
    }

    #[test]
    fn test_worker_command_shape() {
        let cmd = spec().worker_command();
        assert_eq!(
            cmd,
            vec!["/opt/hbase/bin/hbase", "--config", "/var/conf", "regionserver", "start"]
        );
    }

    #[test]
    fn test_worker_env_carries_heap_and_logs() {
        let env = spec().worker_env();
        assert_eq!(env.get("LOG_DIR").unwrap(), "/var/log/hoist");
        assert_eq!(env.get("HBASE_HEAPSIZE").unwrap(), "512m");
    }

    #[test]
    fn test_master_command_default_and_override() {
        let cmd = spec().master_command(None).unwrap();
        assert_eq!(cmd, vec!["/opt/hbase/bin/hbase", "--config", "/var/conf", "master", "start"]);

        let cmd = spec().master_command(Some("/bin/sh -c 'sleep 30'")).unwrap();
        assert_eq!(cmd, vec!["/bin/sh", "-c", "sleep 30"]);

        assert!(spec().master_command(Some("unbalanced 'quote")).is_err());
    }
}
