//! HTTP transport for network-addressable MCP servers

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use router_config::{resolve_env_value, TransportSettings};
use router_core::{Result, RouterError, ServerInfo};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::Transport;

/// JSON-RPC over HTTP POST, with a GET health endpoint
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    health_path: String,
    health_timeout: Duration,
    request_timeout: Duration,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let client = reqwest::Client::builder().build().map_err(|e| {
            RouterError::TransportError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            health_path: settings.health_path.clone(),
            health_timeout: settings.health_timeout(),
            request_timeout: settings.request_timeout(),
            next_id: AtomicI64::new(1),
        })
    }

    fn endpoint<'a>(&self, server: &'a ServerInfo) -> Result<&'a str> {
        server
            .endpoint_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                RouterError::ValidationError(format!(
                    "Server '{}' has no endpoint_url",
                    server.server_id
                ))
            })
    }

    fn health_url(&self, endpoint: &str) -> String {
        if self.health_path.is_empty() {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                endpoint.trim_end_matches('/'),
                self.health_path.trim_start_matches('/')
            )
        }
    }

    /// Headers from `metadata.headers`, with `${VAR}` values resolved
    fn headers(&self, server: &ServerInfo) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(Value::Object(map)) = server.metadata.get("headers") else {
            return Ok(headers);
        };

        for (key, value) in map {
            let Some(raw) = value.as_str() else {
                continue;
            };
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                RouterError::ValidationError(format!("Invalid header name '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(&resolve_env_value(raw)).map_err(|e| {
                RouterError::ValidationError(format!("Invalid header value for '{}': {}", key, e))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn map_send_error(&self, server: &ServerInfo, error: reqwest::Error) -> RouterError {
        if error.is_timeout() {
            RouterError::TimeoutError(format!("Request to '{}' timed out", server.server_id))
        } else {
            RouterError::TransportError(format!(
                "Request to '{}' failed: {}",
                server.server_id, error
            ))
        }
    }
}

/// Classify a non-success HTTP status
fn status_error(server_id: &str, status: StatusCode, body: &str) -> RouterError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RouterError::AuthError(format!(
                "Server '{}' rejected credentials ({})",
                server_id, status
            ))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            RouterError::TimeoutError(format!("Server '{}' reported {}", server_id, status))
        }
        _ => RouterError::ServerError {
            code: Some(i64::from(status.as_u16())),
            message: format!("Server '{}' returned {}: {}", server_id, status, body),
        },
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn check_server_health(&self, server: &ServerInfo) -> bool {
        let Ok(endpoint) = self.endpoint(server) else {
            return false;
        };
        let Ok(headers) = self.headers(server) else {
            return false;
        };

        let url = self.health_url(endpoint);
        match self
            .client
            .get(&url)
            .headers(headers)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => {
                let healthy = response.status().is_success();
                debug!("Health check {} -> {}", url, response.status());
                healthy
            }
            Err(e) => {
                debug!("Health check {} failed: {}", url, e);
                false
            }
        }
    }

    async fn send_request(
        &self,
        server: &ServerInfo,
        mut request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        let endpoint = self.endpoint(server)?;
        if request.id.is_none() {
            request.id = Some(RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst)));
        }

        let timeout = server.timeout_override().unwrap_or(self.request_timeout);
        debug!("POST {} method={} id={:?}", endpoint, request.method, request.id);

        let response = self
            .client
            .post(endpoint)
            .headers(self.headers(server)?)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(server, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(server, e))?;

        if !status.is_success() {
            warn!("Server '{}' returned HTTP {}", server.server_id, status);
            return Err(status_error(&server.server_id, status, &body));
        }

        serde_json::from_str::<JsonRpcResponse>(&body).map_err(|e| {
            RouterError::InvalidResponse(format!(
                "Server '{}' returned a non JSON-RPC body: {}",
                server.server_id, e
            ))
        })
    }
}
