//! Tool dispatch table for serving MCP requests
//!
//! Handlers are registered once by name; `tools/call` looks the name up
//! instead of branching on it.

use futures::future::BoxFuture;
use router_core::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;

use crate::types::{
    error_codes, methods, Implementation, JsonRpcRequest, JsonRpcResponse, McpTool,
    ToolCallParams, ToolCallResult, PROTOCOL_VERSION,
};

pub type ToolHandler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<ToolCallResult>> + Send + Sync>;

struct RegisteredTool {
    definition: McpTool,
    handler: ToolHandler,
}

/// Maps tool names to handlers and answers the MCP methods a tool server needs
pub struct ToolDispatcher {
    server_info: Implementation,
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolDispatcher {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolCallResult>> + Send + 'static,
    {
        let name = name.into();
        let definition = McpTool {
            name: name.clone(),
            description: description.into(),
            input_schema,
        };
        let handler: ToolHandler = Box::new(move |args| Box::pin(handler(args)));
        self.tools.insert(name, RegisteredTool { definition, handler });
        self
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools.values().map(|t| t.definition.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Run a tool. Handler failures are reported in-band with `isError`.
    pub async fn call_tool(&self, params: ToolCallParams) -> Option<ToolCallResult> {
        let tool = self.tools.get(&params.name)?;
        let outcome = match (tool.handler)(params.arguments).await {
            Ok(result) => result,
            Err(e) => ToolCallResult {
                is_error: Some(true),
                ..ToolCallResult::text(e.to_string())
            },
        };
        Some(outcome)
    }

    /// Answer one JSON-RPC message; notifications produce no response
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone()?;

        let response = match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::success(
                Some(id),
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": self.server_info,
                }),
            ),
            methods::TOOLS_LIST => {
                JsonRpcResponse::success(Some(id), json!({ "tools": self.tools() }))
            }
            methods::RESOURCES_LIST => {
                JsonRpcResponse::success(Some(id), json!({ "resources": [] }))
            }
            methods::TOOLS_CALL => {
                let params = request
                    .params
                    .map(serde_json::from_value::<ToolCallParams>)
                    .transpose();
                match params {
                    Ok(Some(params)) => {
                        let name = params.name.clone();
                        match self.call_tool(params).await {
                            Some(result) => match serde_json::to_value(result) {
                                Ok(value) => JsonRpcResponse::success(Some(id), value),
                                Err(e) => JsonRpcResponse::failure(
                                    Some(id),
                                    error_codes::INTERNAL_ERROR,
                                    e.to_string(),
                                ),
                            },
                            None => JsonRpcResponse::failure(
                                Some(id),
                                error_codes::METHOD_NOT_FOUND,
                                format!("Unknown tool: {}", name),
                            ),
                        }
                    }
                    Ok(None) => JsonRpcResponse::failure(
                        Some(id),
                        error_codes::INVALID_PARAMS,
                        "Missing params",
                    ),
                    Err(e) => JsonRpcResponse::failure(
                        Some(id),
                        error_codes::INVALID_PARAMS,
                        e.to_string(),
                    ),
                }
            }
            other => JsonRpcResponse::failure(
                Some(id),
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestId;
    use router_core::RouterError;

    fn dispatcher() -> ToolDispatcher {
        let mut dispatcher = ToolDispatcher::new("test-server", "0.0.1");
        dispatcher
            .register("echo", "Echo arguments", json!({"type": "object"}), |args| async move {
                Ok(ToolCallResult::text(args.to_string()))
            })
            .register("fail", "Always fails", json!({}), |_| async {
                Err(RouterError::server("broken tool"))
            });
        dispatcher
    }

    fn call(name: &str, args: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(methods::TOOLS_CALL, Some(json!({"name": name, "arguments": args})))
            .with_id(RequestId::Number(1))
    }

    #[tokio::test]
    async fn test_dispatch_by_name() {
        let response = dispatcher().handle(call("echo", json!({"x": 1}))).await.unwrap();
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.content.len(), 1);
        assert!(result.is_error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_method_not_found() {
        let response = dispatcher().handle(call("missing", json!({}))).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_in_band() {
        let response = dispatcher().handle(call("fail", json!({}))).await.unwrap();
        let result: ToolCallResult = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let notification = JsonRpcRequest::new(methods::INITIALIZED, None);
        assert!(dispatcher().handle(notification).await.is_none());
    }

    #[tokio::test]
    async fn test_tools_list_is_sorted() {
        let response = dispatcher()
            .handle(JsonRpcRequest::new(methods::TOOLS_LIST, None).with_id(RequestId::Number(2)))
            .await
            .unwrap();
        let names: Vec<String> = response.result.unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["echo", "fail"]);
    }
}
