//! JSON-over-HTTP protocol implementations
//!
//! Production transport for the RM and NM protocols, with bounded
//! retry and exponential backoff on transient failures for the
//! one-shot calls (register, unregister). Heartbeats are periodic and
//! never retried here; the adapter tolerates a bounded run of failed
//! beats instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::protocol::{NodeManagerProtocol, ResourceManagerProtocol, TransportError};
use super::types::{
    ContainerId, HeartbeatRequest, HeartbeatResponse, LaunchContext, NodeAddr, RegisterRequest,
    RegistrationResponse, RemoteContainerState, UnregisterRequest,
};

/// Maximum number of retry attempts for one-shot calls.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries (exponentially increased).
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn build_client() -> Result<Client, TransportError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| TransportError::Request(e.to_string()))
}

/// Normalize `host:port` (or a full URL) into a base URL.
fn base_url(address: &str) -> Result<String, TransportError> {
    let address = address.trim_end_matches('/');
    if address.is_empty() {
        return Err(TransportError::InvalidAddress("empty address".into()));
    }
    if address.starts_with("http://") || address.starts_with("https://") {
        return Ok(address.to_string());
    }
    if !address.contains(':') {
        return Err(TransportError::InvalidAddress(format!(
            "expected host:port, got {address}"
        )));
    }
    Ok(format!("http://{address}"))
}

fn calculate_backoff(attempt: u32) -> Duration {
    let delay = BASE_RETRY_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1));
    delay.min(MAX_RETRY_DELAY)
}

async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Request(format!("malformed response body: {e}")));
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unreadable error body".to_string());

    Err(TransportError::Endpoint { status: status.as_u16(), message })
}

async fn post_json<B: Serialize, T: DeserializeOwned>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<T, TransportError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| TransportError::Request(e.to_string()))?;

    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return Err(TransportError::Endpoint {
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            message: "rate limited".into(),
        });
    }

    parse_response(response).await
}

/// POST with automatic retry on transient failures.
async fn post_with_retry<B: Serialize, T: DeserializeOwned>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<T, TransportError> {
    let mut last_error: Option<TransportError> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = calculate_backoff(attempt);
            debug!("retrying {} (attempt {}/{}), waiting {:?}", url, attempt + 1, MAX_RETRIES + 1, delay);
            tokio::time::sleep(delay).await;
        }

        match post_json(client, url, body).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                warn!("request to {} failed (attempt {}): {}", url, attempt + 1, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(TransportError::RetryExhausted(
        last_error.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string()),
    ))
}

/// HTTP client for the resource-manager protocol.
pub struct HttpResourceManager {
    client: Client,
    base_url: String,
}

impl HttpResourceManager {
    /// Create a client for the RM at `address` (`host:port` or URL).
    pub fn new(address: &str) -> Result<Self, TransportError> {
        Ok(Self { client: build_client()?, base_url: base_url(address)? })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/master/{}", self.base_url, path)
    }
}

#[async_trait]
impl ResourceManagerProtocol for HttpResourceManager {
    async fn register(&self, req: &RegisterRequest) -> Result<RegistrationResponse, TransportError> {
        post_with_retry(&self.client, &self.url("register"), req).await
    }

    async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        post_json(&self.client, &self.url("heartbeat"), req).await
    }

    async fn unregister(&self, req: &UnregisterRequest) -> Result<(), TransportError> {
        // The response body is an empty object; discard it.
        let _: serde_json::Value =
            post_with_retry(&self.client, &self.url("unregister"), req).await?;
        Ok(())
    }
}

/// HTTP client for the node-manager protocol.
///
/// Node managers are addressed per call; one client instance serves
/// every node in the cluster.
pub struct HttpNodeManager {
    client: Client,
}

impl HttpNodeManager {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self { client: build_client()? })
    }

    fn url(&self, node: &NodeAddr, id: &ContainerId, op: &str) -> String {
        format!("http://{}/v1/containers/{}/{}", node, id, op)
    }
}

#[async_trait]
impl NodeManagerProtocol for HttpNodeManager {
    async fn start_container(
        &self,
        node: &NodeAddr,
        id: &ContainerId,
        ctx: &LaunchContext,
    ) -> Result<(), TransportError> {
        let _: serde_json::Value =
            post_json(&self.client, &self.url(node, id, "start"), ctx).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        node: &NodeAddr,
        id: &ContainerId,
    ) -> Result<(), TransportError> {
        let _: serde_json::Value =
            post_json(&self.client, &self.url(node, id, "stop"), &serde_json::json!({})).await?;
        Ok(())
    }

    async fn container_status(
        &self,
        node: &NodeAddr,
        id: &ContainerId,
    ) -> Result<RemoteContainerState, TransportError> {
        let response = self
            .client
            .get(self.url(node, id, "status"))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        parse_response(response).await
    }
}
