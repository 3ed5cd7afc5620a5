//! Thread-safe wrapper around the cluster description
//!
//! Exactly one lock protects the document; every mutation and every
//! published snapshot happens under it, so no reader can observe a
//! partial transition. `statusTime` only moves forward.

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::resource::ContainerId;

use super::description::{ClusterDescription, ClusterNode, ClusterPhase, NodeState};

/// The single authoritative store of cluster state for one AM process.
pub struct ClusterStore {
    inner: Mutex<ClusterDescription>,
}

impl ClusterStore {
    pub fn new(description: ClusterDescription) -> Self {
        Self { inner: Mutex::new(description) }
    }

    /// Run `f` under the document lock.
    pub fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ClusterDescription) -> R,
    {
        f(&mut self.inner.lock())
    }

    /// Clone the document under the lock.
    pub fn snapshot(&self) -> ClusterDescription {
        self.inner.lock().clone()
    }

    /// Serialize a consistent snapshot. The serialization itself runs
    /// under the document lock.
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        let guard = self.inner.lock();
        serde_json::to_string_pretty(&*guard)
    }

    /// Refresh `statusTime` (monotonically) and serialize under the
    /// lock. This is the publication path of the control RPC.
    pub fn publish_json(&self) -> Result<String, serde_json::Error> {
        let mut guard = self.inner.lock();
        guard.status_time = Utc::now().timestamp_millis().max(guard.status_time + 1);
        serde_json::to_string_pretty(&*guard)
    }

    pub fn set_phase(&self, phase: ClusterPhase) {
        self.mutate(|d| d.state = phase);
    }

    // ========================================================================
    // Worker-node transitions
    // ========================================================================

    /// Record a freshly requested node.
    pub fn add_requested(&self, node: ClusterNode) {
        self.mutate(|d| d.requested_nodes.push(node));
    }

    /// Promote a requested node to LIVE once its node manager confirms
    /// the launch. Returns false when the node is unknown (it may have
    /// completed before the start result arrived).
    pub fn promote_live(&self, id: &ContainerId) -> bool {
        self.mutate(|d| {
            if let Some(pos) = d.requested_nodes.iter().position(|n| n.name == id.as_str()) {
                let mut node = d.requested_nodes.remove(pos);
                node.state = NodeState::Live;
                d.worker_nodes.push(node);
                true
            } else {
                false
            }
        })
    }

    /// Mark a live node as stopping; the terminal move happens when the
    /// resource manager reports completion.
    pub fn mark_stopped(&self, id: &ContainerId) {
        self.mutate(|d| {
            if let Some(node) = d.worker_nodes.iter_mut().find(|n| n.name == id.as_str()) {
                node.state = NodeState::Stopped;
            }
        });
    }

    /// Move a node (live or still requested) to `completedNodes` with
    /// its reported exit code and diagnostics.
    pub fn retire_node(&self, id: &ContainerId, exit_code: i32, diagnostics: &str) {
        self.mutate(|d| {
            if let Some(mut node) = take_node(d, id) {
                node.state = NodeState::Destroyed;
                node.exit_code = Some(exit_code);
                node.diagnostics = diagnostics.to_string();
                d.completed_nodes.push(node);
            }
        });
    }

    /// Move a node to `failedNodes` after its launch was rejected.
    pub fn fail_node(&self, id: &ContainerId, diagnostics: &str) {
        self.mutate(|d| {
            if let Some(mut node) = take_node(d, id) {
                node.state = NodeState::Destroyed;
                node.diagnostics = diagnostics.to_string();
                d.failed_nodes.push(node);
            } else {
                warn!(container = %id, "launch failure for unknown node");
            }
        });
    }

    /// Append diagnostics to a node wherever it currently lives.
    pub fn note_diagnostics(&self, id: &ContainerId, note: &str) {
        self.mutate(|d| {
            let all = d
                .requested_nodes
                .iter_mut()
                .chain(d.worker_nodes.iter_mut())
                .chain(d.master_nodes.iter_mut());
            for node in all {
                if node.name == id.as_str() {
                    if !node.diagnostics.is_empty() {
                        node.diagnostics.push('\n');
                    }
                    node.diagnostics.push_str(note);
                    return;
                }
            }
        });
    }

    // ========================================================================
    // Master-node transitions
    // ========================================================================

    /// Record the master node at spawn time.
    pub fn add_master(&self, node: ClusterNode) {
        self.mutate(|d| d.master_nodes.push(node));
    }

    pub fn master_started(&self) {
        self.mutate(|d| {
            if let Some(node) = d.master_nodes.first_mut() {
                node.state = NodeState::Live;
            }
            if d.start_time == 0 {
                d.start_time = Utc::now().timestamp_millis();
            }
        });
    }

    /// Move the master to its terminal list once the child exits.
    pub fn master_exited(&self, exit_code: i32, output: Vec<String>) {
        self.mutate(|d| {
            if let Some(mut node) = d.master_nodes.pop() {
                node.state = NodeState::Stopped;
                node.exit_code = Some(exit_code);
                node.output = output;
                if exit_code == 0 {
                    d.completed_nodes.push(node);
                } else {
                    d.failed_nodes.push(node);
                }
            }
        });
    }

    /// Reconcile the live master node's observable fields with the
    /// process supervisor before publishing a snapshot.
    pub fn sync_master(&self, output: Vec<String>, exit_code: Option<i32>) {
        self.mutate(|d| {
            if let Some(node) = d.master_nodes.first_mut() {
                node.output = output;
                node.exit_code = exit_code;
            }
        });
    }
}

/// Remove the node with the given container id from whichever of the
/// non-terminal sequences it lives in.
fn take_node(d: &mut ClusterDescription, id: &ContainerId) -> Option<ClusterNode> {
    if let Some(pos) = d.worker_nodes.iter().position(|n| n.name == id.as_str()) {
        return Some(d.worker_nodes.remove(pos));
    }
    if let Some(pos) = d.requested_nodes.iter().position(|n| n.name == id.as_str()) {
        return Some(d.requested_nodes.remove(pos));
    }
    None
}
