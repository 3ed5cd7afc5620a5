//! Container-protocol data types
//!
//! These mirror the resource manager's view of the world: opaque
//! container identities, allocations, terminal statuses and node
//! reports. All wire bodies serialize as camelCase JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code the resource manager reports for a container that
/// terminated because the application released it, rather than because
/// the process inside it failed.
pub const ABORTED_EXIT_CODE: i32 = -100;

/// Opaque container identity handed out by the resource manager.
///
/// Equality-comparable and stringifiable; the AM never inspects its
/// structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Address of a node manager (host plus IPC port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resource capability of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub memory_mb: u32,
}

impl Resource {
    pub fn megabytes(memory_mb: u32) -> Self {
        Self { memory_mb }
    }
}

/// An allocation granted by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: ContainerId,
    pub node: NodeAddr,
    pub resource: Resource,
}

/// Remote view of a container's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteContainerState {
    New,
    Running,
    Complete,
}

impl RemoteContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteContainerState::Complete)
    }
}

/// Terminal report for a container, delivered by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub state: RemoteContainerState,
    pub exit_code: i32,
    #[serde(default)]
    pub diagnostics: String,
}

impl ContainerStatus {
    /// True when this completion was induced by the AM's own release
    /// request rather than a process failure.
    pub fn is_aborted(&self) -> bool {
        self.exit_code == ABORTED_EXIT_CODE
    }
}

/// Health report for a cluster node, delivered by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub node: NodeAddr,
    pub healthy: bool,
    #[serde(default)]
    pub diagnostics: String,
}

/// Final status reported to the resource manager at unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FinalAppStatus {
    Succeeded,
    Failed,
}

/// A request for `count` containers of a given capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerAsk {
    pub resource: Resource,
    pub count: u32,
    pub priority: u32,
    #[serde(default)]
    pub host_hints: Vec<String>,
    #[serde(default)]
    pub rack_hints: Vec<String>,
}

/// Registration request sent once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    pub tracking_url: String,
}

/// Registration response; carries the largest container the scheduler
/// will grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub maximum_capability: Resource,
}

/// One heartbeat to the resource manager: progress plus any pending
/// asks and releases, drained from the adapter queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub progress: f32,
    #[serde(default)]
    pub asks: Vec<ContainerAsk>,
    #[serde(default)]
    pub releases: Vec<ContainerId>,
}

/// Heartbeat response: everything that happened since the last beat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub allocated: Vec<Container>,
    #[serde(default)]
    pub completed: Vec<ContainerStatus>,
    #[serde(default)]
    pub updated_nodes: Vec<NodeReport>,
    #[serde(default)]
    pub shutdown: bool,
}

/// Unregistration request sent once at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterRequest {
    pub final_status: FinalAppStatus,
    pub diagnostics: String,
}

/// Launch context submitted to a node manager: the command vector, the
/// process environment and the resource tags for the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchContext {
    pub commands: Vec<String>,
    pub env: indexmap::IndexMap<String, String>,
    pub resource: Resource,
}
