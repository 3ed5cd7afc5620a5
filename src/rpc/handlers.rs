//! Control API routes and handlers

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cluster::ClusterStore;
use crate::engine::EngineEvent;
use crate::supervisor::ProcessSupervisor;

/// Concurrent control requests served at once.
const HANDLER_POOL: usize = 5;

/// Version negotiated with control clients.
pub const PROTOCOL_VERSION: u32 = 1;

/// Signature negotiated with control clients.
pub const PROTOCOL_SIGNATURE: &str = "hoist-am-control-1";

/// State shared across control handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ClusterStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub completion: CancellationToken,
    pub events: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
}

/// Control API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// Build the control router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/cluster/status", get(cluster_status))
        .route("/ws/v1/cluster/actions/stop", post(stop_cluster))
        .route("/ws/v1/cluster/nodes/add", post(add_nodes))
        .route("/ws/v1/cluster/nodes/delete", post(delete_nodes))
        .route("/ws/v1/version", get(version))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(HANDLER_POOL))
        .with_state(state)
}

/// Serve the status document. The master node's observable fields are
/// reconciled with the supervisor and `statusTime` is refreshed before
/// the snapshot is serialized under the document lock.
async fn cluster_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    state
        .store
        .sync_master(state.supervisor.recent_output(), state.supervisor.exit_code());

    let body = state.store.publish_json().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopping: bool,
}

/// Signal AM completion and return immediately; teardown happens on
/// the lifecycle task.
async fn stop_cluster(State(state): State<AppState>) -> Json<StopResponse> {
    info!("stop requested over control RPC");
    state.completion.cancel();
    Json(StopResponse { stopping: true })
}

#[derive(Debug, Deserialize)]
struct FlexRequest {
    count: u32,
}

#[derive(Debug, Serialize)]
struct FlexResponse {
    accepted: bool,
    message: String,
}

/// Record the intent to grow the cluster. Live flexing is not
/// implemented; the request is acknowledged but not acted on.
async fn add_nodes(
    State(state): State<AppState>,
    Json(req): Json<FlexRequest>,
) -> Json<FlexResponse> {
    let _ = state.events.send(EngineEvent::AddWorkers(req.count));
    Json(FlexResponse {
        accepted: false,
        message: "cluster flexing is not implemented".to_string(),
    })
}

/// Record the intent to shrink the cluster. See [`add_nodes`].
async fn delete_nodes(
    State(state): State<AppState>,
    Json(req): Json<FlexRequest>,
) -> Json<FlexResponse> {
    let _ = state.events.send(EngineEvent::RemoveWorkers(req.count));
    Json(FlexResponse {
        accepted: false,
        message: "cluster flexing is not implemented".to_string(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    protocol_version: u32,
    protocol_signature: String,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        protocol_version: PROTOCOL_VERSION,
        protocol_signature: PROTOCOL_SIGNATURE.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cluster::{ClusterDescription, ClusterPhase};

    fn state() -> AppState {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut desc = ClusterDescription::new("rpc-test", 1_000);
        desc.state = ClusterPhase::Live;
        AppState {
            store: Arc::new(ClusterStore::new(desc)),
            supervisor: Arc::new(ProcessSupervisor::new(tx.clone())),
            completion: CancellationToken::new(),
            events: tx,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_cluster_status_serves_document() {
        let app = build_router(state());
        let response = app
            .oneshot(Request::get("/ws/v1/cluster/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "rpc-test");
        assert_eq!(json["state"], "LIVE");
        assert!(json["statusTime"].as_i64().unwrap() >= 1_000);
    }

    #[tokio::test]
    async fn test_stop_signals_completion() {
        let state = state();
        let completion = state.completion.clone();
        let app = build_router(state);

        let response = app
            .oneshot(Request::post("/ws/v1/cluster/actions/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(completion.is_cancelled());
    }

    #[tokio::test]
    async fn test_add_nodes_records_intent_only() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut st = state();
        st.events = tx;
        let app = build_router(st);

        let response = app
            .oneshot(
                Request::post("/ws/v1/cluster/nodes/add")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"count":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], false);
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::AddWorkers(3)));
    }

    #[tokio::test]
    async fn test_version_negotiation() {
        let app = build_router(state());
        let response = app
            .oneshot(Request::get("/ws/v1/version").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["protocolVersion"], 1);
        assert_eq!(json["protocolSignature"], PROTOCOL_SIGNATURE);
    }
}
