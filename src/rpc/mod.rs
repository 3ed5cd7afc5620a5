//! Control RPC server
//!
//! Exposes cluster status and control operations to external clients
//! over a small JSON API. Binds an ephemeral loopback port; the
//! captured address is what the AM registers with the resource
//! manager as its tracking endpoint.

mod handlers;

pub use handlers::{build_router, AppState, PROTOCOL_SIGNATURE, PROTOCOL_VERSION};

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::AmError;

/// A running control server.
pub struct ControlServer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

/// Bind an ephemeral loopback port and serve the control API until
/// `shutdown` is cancelled.
pub async fn start(state: AppState, shutdown: CancellationToken) -> Result<ControlServer, AmError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| AmError::Internal(format!("cannot bind control port: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| AmError::Internal(format!("cannot read control address: {e}")))?;

    info!(%addr, "control RPC server listening");

    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "control RPC server failed");
        }
    });

    Ok(ControlServer { addr, handle })
}

impl ControlServer {
    /// Await server shutdown; the caller cancels the shutdown token
    /// first.
    pub async fn stop(self) {
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
