//! Seams between the discovery service and the registry it consults, and
//! the caller-supplied fallback

use async_trait::async_trait;
use router_core::{Request, Result, RouterError, ServerInfo};
use router_registry::ServerRegistry;
use router_transport::{JsonRpcRequest, Transport};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// A response and the server that produced it
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub server_id: String,
    pub result: Value,
}

/// A failed routing attempt and the server it reached, if any
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RoutedError {
    /// `None` when no server was selected
    pub server_id: Option<String>,
    #[source]
    pub error: RouterError,
}

impl RoutedError {
    pub fn at(server_id: impl Into<String>, error: RouterError) -> Self {
        Self {
            server_id: Some(server_id.into()),
            error,
        }
    }
}

impl From<RouterError> for RoutedError {
    fn from(error: RouterError) -> Self {
        Self {
            server_id: None,
            error,
        }
    }
}

pub type RoutedResult = std::result::Result<RoutedResponse, RoutedError>;

/// Client view of a (possibly remote) server registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_servers(&self) -> Result<Vec<ServerInfo>>;

    /// Route `request` to a server chosen by the registry and return its
    /// JSON-RPC result. Failures name the server that produced them.
    async fn send_request(&self, request: &Request) -> RoutedResult;
}

/// Registry and transport living in the same process
pub struct LocalRegistryClient {
    registry: Arc<ServerRegistry>,
    transport: Arc<dyn Transport>,
}

impl LocalRegistryClient {
    pub fn new(registry: Arc<ServerRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }
}

#[async_trait]
impl RegistryClient for LocalRegistryClient {
    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        Ok(self.registry.discover_servers().await)
    }

    async fn send_request(&self, request: &Request) -> RoutedResult {
        let server = self.registry.select_server(request).await.ok_or_else(|| {
            RouterError::TransportError(format!(
                "No MCP server available for capabilities [{}]",
                request.capability_key()
            ))
        })?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            request.timeout(),
            self.transport
                .send_request(&server, JsonRpcRequest::from_request(request)),
        )
        .await;
        self.registry.request_completed(&server.server_id);

        let result = match outcome {
            Ok(response) => response.and_then(|r| r.into_result()),
            Err(_) => Err(RouterError::TimeoutError(format!(
                "Server '{}' did not answer {} within {:?}",
                server.server_id,
                request.method,
                request.timeout()
            ))),
        };

        match result {
            Ok(result) => {
                debug!(
                    "Server '{}' answered {} in {:?}",
                    server.server_id,
                    request.method,
                    started.elapsed()
                );
                Ok(RoutedResponse {
                    server_id: server.server_id,
                    result,
                })
            }
            Err(error) => Err(RoutedError::at(server.server_id, error)),
        }
    }
}

/// Produces an answer when no MCP server can
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(&self, request: &Request) -> Result<Value>;
}

/// Adapts an async closure into a `FallbackHandler`
pub struct FnFallback<F> {
    handler: F,
}

impl<F> FnFallback<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> FallbackHandler for FnFallback<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, request: &Request) -> Result<Value> {
        (self.handler)(request.clone()).await
    }
}
