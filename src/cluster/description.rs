//! The cluster description document
//!
//! Field names and their JSON spelling are an external contract: the
//! control RPC serves this document verbatim and clients parse it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterPhase {
    Created,
    Submitted,
    Live,
    Stopped,
    Destroyed,
    Incomplete,
    Failed,
}

/// Lifecycle state of one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Requested,
    Submitted,
    Live,
    Stopped,
    Destroyed,
}

/// Role a process instance plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
    Unknown,
}

/// One process instance, live or terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    /// Container identity as a string.
    pub name: String,
    pub role: NodeRole,
    pub state: NodeState,
    pub host: String,
    /// Effective launch command, joined by spaces.
    pub command: String,
    #[serde(default)]
    pub diagnostics: String,
    pub exit_code: Option<i32>,
    /// Recent combined output lines, bounded.
    #[serde(default)]
    pub output: Vec<String>,
}

impl ClusterNode {
    /// A freshly requested node, not yet confirmed by its node manager.
    pub fn requested(name: impl Into<String>, role: NodeRole, host: impl Into<String>, command: String) -> Self {
        Self {
            name: name.into(),
            role,
            state: NodeState::Requested,
            host: host.into(),
            command,
            diagnostics: String::new(),
            exit_code: None,
            output: Vec::new(),
        }
    }
}

/// The root status document: desired topology, observed topology and
/// the configuration the cluster was deployed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDescription {
    pub name: String,
    pub state: ClusterPhase,
    pub create_time: i64,
    pub start_time: i64,
    pub status_time: i64,

    /// Desired master count (0 or 1).
    pub masters: u32,
    /// Desired worker count.
    pub workers: u32,
    pub master_heap: u32,
    pub worker_heap: u32,

    /// Backing-service properties copied from the staged site file, in
    /// file order.
    pub client_properties: IndexMap<String, String>,

    pub master_nodes: Vec<ClusterNode>,
    pub worker_nodes: Vec<ClusterNode>,
    pub completed_nodes: Vec<ClusterNode>,
    pub failed_nodes: Vec<ClusterNode>,
    pub requested_nodes: Vec<ClusterNode>,

    pub root_path: String,
    pub zk_hosts: String,
    pub zk_port: u16,
    pub zk_path: String,
}

impl ClusterDescription {
    pub fn new(name: impl Into<String>, create_time: i64) -> Self {
        Self {
            name: name.into(),
            state: ClusterPhase::Created,
            create_time,
            start_time: 0,
            status_time: create_time,
            masters: 0,
            workers: 0,
            master_heap: 0,
            worker_heap: 0,
            client_properties: IndexMap::new(),
            master_nodes: Vec::new(),
            worker_nodes: Vec::new(),
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            requested_nodes: Vec::new(),
            root_path: String::new(),
            zk_hosts: String::new(),
            zk_port: 0,
            zk_path: String::new(),
        }
    }
}
