//! MCP protocol types and JSON-RPC message structures

use router_core::{Request, RouterError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
}

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// JSON-RPC id; MCP servers echo whichever form they were sent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Left empty by callers that let the transport assign one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    /// JSON-RPC body for a routed request. An explicit `metadata.id`
    /// is carried over; otherwise the transport assigns one.
    pub fn from_request(request: &Request) -> Self {
        let id = request
            .metadata
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: request.method.clone(),
            params: request.params.clone(),
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Unwrap the result, turning a JSON-RPC error into a typed error
    pub fn into_result(self) -> router_core::Result<Value> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<JsonRpcError> for RouterError {
    fn from(error: JsonRpcError) -> Self {
        let lowered = error.message.to_ascii_lowercase();
        if lowered.contains("unauthorized") || lowered.contains("forbidden") {
            RouterError::AuthError(error.message)
        } else {
            RouterError::ServerError {
                code: Some(error.code),
                message: error.message,
            }
        }
    }
}

/// A line read from a server, classified
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    /// Server-initiated request or notification
    ServerMessage { method: String },
}

impl IncomingMessage {
    pub fn parse(line: &str) -> router_core::Result<Self> {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            RouterError::InvalidResponse(format!("Malformed JSON from server: {}", e))
        })?;

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            return Ok(IncomingMessage::ServerMessage {
                method: method.to_string(),
            });
        }

        serde_json::from_value(value)
            .map(IncomingMessage::Response)
            .map_err(|e| RouterError::InvalidResponse(format!("Not a JSON-RPC response: {}", e)))
    }
}

/// Client capabilities
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// Client information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcp-router".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Initialize request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        }
    }
}

/// Initialize response result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
}

/// Name and version of an MCP implementation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Tool definition from MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// List tools result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
}

/// Tool call parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Tool call result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            is_error: None,
        }
    }
}

/// Content item in tool results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentItem {
    Text { text: String },
    #[serde(rename_all = "camelCase")]
    Image { data: String, mime_type: String },
}

/// Resource advertised by `resources/list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    pub resources: Vec<McpResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_without_id_omits_field() {
        let request = JsonRpcRequest::new(methods::TOOLS_LIST, None);
        let json = serde_json::to_string(&request).unwrap();

        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("\"params\""));

        let numbered = request.with_id(RequestId::Number(7));
        assert!(serde_json::to_string(&numbered).unwrap().contains("\"id\":7"));
    }

    #[test]
    fn test_from_request_carries_explicit_id() {
        let mut routed = Request::new("tool_call", methods::TOOLS_CALL)
            .with_params(json!({"name": "echo", "arguments": {}}));
        assert!(JsonRpcRequest::from_request(&routed).id.is_none());

        routed.metadata.insert("id".into(), json!("abc"));
        let body = JsonRpcRequest::from_request(&routed);
        assert_eq!(body.id, Some(RequestId::String("abc".into())));
        assert_eq!(body.method, "tools/call");
    }

    #[test]
    fn test_incoming_message_classification() {
        let response =
            IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        match response {
            IncomingMessage::Response(r) => assert_eq!(r.id, Some(RequestId::Number(3))),
            other => panic!("unexpected {:?}", other),
        }

        let notification = IncomingMessage::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#,
        )
        .unwrap();
        assert_eq!(
            notification,
            IncomingMessage::ServerMessage {
                method: "notifications/message".into()
            }
        );

        assert!(matches!(
            IncomingMessage::parse("Server listening on stdio"),
            Err(RouterError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_response_maps_to_typed_error() {
        let response = JsonRpcResponse::failure(
            Some(RequestId::Number(1)),
            error_codes::METHOD_NOT_FOUND,
            "nope",
        );
        match response.into_result() {
            Err(RouterError::ServerError { code, .. }) => assert_eq!(code, Some(-32601)),
            other => panic!("unexpected {:?}", other),
        }

        let auth = JsonRpcResponse::failure(None, -32000, "Unauthorized: bad token");
        assert!(matches!(auth.into_result(), Err(RouterError::AuthError(_))));
    }

    #[test]
    fn test_mcp_tool_deserialization() {
        let tool: McpTool = serde_json::from_str(
            r#"{"name": "read_file", "description": "Read a file",
                "inputSchema": {"type": "object"}}"#,
        )
        .unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.input_schema["type"], "object");

        let bare: McpTool = serde_json::from_str(r#"{"name": "ping"}"#).unwrap();
        assert!(bare.description.is_empty());
    }

    #[test]
    fn test_content_item_variants() {
        let json = serde_json::to_value(ContentItem::Image {
            data: "base64data".into(),
            mime_type: "image/png".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["mimeType"], "image/png");
    }
}
