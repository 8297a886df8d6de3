//! Transport layer for MCP communication
//!
//! Provides the health-check and send primitives the registry and discovery service
//! use to reach MCP servers:
//! - HTTP (JSON-RPC POST) transport
//! - Stdio (child process, newline-delimited JSON-RPC) transport

use async_trait::async_trait;
use router_config::TransportSettings;
use router_core::{Result, RetryPolicy, RouterError, ServerInfo};
use serde_json::Value;
use std::sync::Arc;

pub mod dispatch;
pub mod http;
pub mod stdio;
pub mod types;

pub use dispatch::ToolDispatcher;
pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

use types::{
    methods, ListResourcesResult, ListToolsResult, McpResource, McpTool, ReadResourceParams,
    ReadResourceResult, ToolCallParams, ToolCallResult,
};

/// Health-check and send primitives for reaching MCP servers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the server looks alive. Never fails; problems read as `false`.
    async fn check_server_health(&self, server: &ServerInfo) -> bool;

    /// Send one JSON-RPC request and wait for its response
    async fn send_request(
        &self,
        server: &ServerInfo,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse>;

    /// Establish whatever state is needed before the first request
    async fn connect(&self, _server: &ServerInfo) -> Result<()> {
        Ok(())
    }

    /// Drop everything held for one server; called when it leaves the registry
    async fn release(&self, _server: &ServerInfo) {}

    /// Release all connections and child processes. Safe to call repeatedly.
    async fn cleanup(&self) {}
}

/// Routes each call to the stdio or HTTP transport depending on the server
pub struct TransportRouter {
    http: Arc<dyn Transport>,
    stdio: Arc<dyn Transport>,
}

impl TransportRouter {
    pub fn new(http: Arc<dyn Transport>, stdio: Arc<dyn Transport>) -> Self {
        Self { http, stdio }
    }

    /// Build both transports from configuration
    pub fn from_settings(settings: &TransportSettings, retry: RetryPolicy) -> Result<Self> {
        let http = HttpTransport::new(settings)?;
        let stdio = StdioTransport::new(settings, retry);
        Ok(Self::new(Arc::new(http), Arc::new(stdio)))
    }

    fn pick(&self, server: &ServerInfo) -> &Arc<dyn Transport> {
        if server.is_stdio() {
            &self.stdio
        } else {
            &self.http
        }
    }
}

#[async_trait]
impl Transport for TransportRouter {
    async fn check_server_health(&self, server: &ServerInfo) -> bool {
        self.pick(server).check_server_health(server).await
    }

    async fn send_request(
        &self,
        server: &ServerInfo,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        self.pick(server).send_request(server, request).await
    }

    async fn connect(&self, server: &ServerInfo) -> Result<()> {
        self.pick(server).connect(server).await
    }

    async fn release(&self, server: &ServerInfo) {
        self.pick(server).release(server).await
    }

    async fn cleanup(&self) {
        self.stdio.cleanup().await;
        self.http.cleanup().await;
    }
}

async fn call(
    transport: &dyn Transport,
    server: &ServerInfo,
    method: &str,
    params: Option<Value>,
) -> Result<Value> {
    transport
        .send_request(server, JsonRpcRequest::new(method, params))
        .await?
        .into_result()
}

/// `tools/list` against a server
pub async fn list_tools(transport: &dyn Transport, server: &ServerInfo) -> Result<Vec<McpTool>> {
    let result = call(transport, server, methods::TOOLS_LIST, None).await?;
    let listed: ListToolsResult = serde_json::from_value(result)
        .map_err(|e| RouterError::InvalidResponse(format!("Bad tools/list result: {}", e)))?;
    Ok(listed.tools)
}

/// `tools/call` against a server; a result flagged `isError` becomes a server error
pub async fn call_tool(
    transport: &dyn Transport,
    server: &ServerInfo,
    name: &str,
    arguments: Value,
) -> Result<ToolCallResult> {
    let params = serde_json::to_value(ToolCallParams {
        name: name.to_string(),
        arguments,
    })?;
    let result = call(transport, server, methods::TOOLS_CALL, Some(params)).await?;
    let outcome: ToolCallResult = serde_json::from_value(result)
        .map_err(|e| RouterError::InvalidResponse(format!("Bad tools/call result: {}", e)))?;

    if outcome.is_error.unwrap_or(false) {
        return Err(RouterError::server(format!("Tool '{}' returned an error", name)));
    }
    Ok(outcome)
}

pub async fn list_resources(
    transport: &dyn Transport,
    server: &ServerInfo,
) -> Result<Vec<McpResource>> {
    let result = call(transport, server, methods::RESOURCES_LIST, None).await?;
    let listed: ListResourcesResult = serde_json::from_value(result)
        .map_err(|e| RouterError::InvalidResponse(format!("Bad resources/list result: {}", e)))?;
    Ok(listed.resources)
}

pub async fn read_resource(
    transport: &dyn Transport,
    server: &ServerInfo,
    uri: &str,
) -> Result<ReadResourceResult> {
    let params = serde_json::to_value(ReadResourceParams { uri: uri.to_string() })?;
    let result = call(transport, server, methods::RESOURCES_READ, Some(params)).await?;
    serde_json::from_value(result)
        .map_err(|e| RouterError::InvalidResponse(format!("Bad resources/read result: {}", e)))
}
