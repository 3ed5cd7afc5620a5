//! Resource-manager and node-manager integration
//!
//! The wire protocol is abstracted behind the traits in [`protocol`];
//! [`http`] provides the JSON-over-HTTP implementation used by the real
//! binary, and the adapters in [`rm`] and [`nm`] turn the two-sided
//! asynchronous protocol into a single ordered event stream for the
//! reconciliation engine.

mod http;
mod nm;
mod protocol;
mod rm;
mod types;

pub use http::{HttpNodeManager, HttpResourceManager};
pub use nm::NmAdapter;
pub use protocol::{NodeManagerProtocol, ResourceManagerProtocol, TransportError};
pub use rm::{ProgressSource, RmAdapter, DEFAULT_HEARTBEAT_INTERVAL};
pub use types::*;
