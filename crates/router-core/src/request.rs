//! Outgoing request model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// A request to be routed to some capable MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Operation category, e.g. `"tool_call"` or `"chat"`
    pub request_type: String,

    /// JSON-RPC method sent to the selected server
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// A server is eligible only if its capabilities are a superset of these
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_server_id: Option<String>,

    /// Servers that must not be selected, e.g. ones that already failed
    /// this request
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_servers: BTreeSet<String>,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Request {
    pub fn new(request_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            method: method.into(),
            params: None,
            required_capabilities: BTreeSet::new(),
            preferred_server_id: None,
            excluded_servers: BTreeSet::new(),
            timeout_seconds: default_timeout_seconds(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_preferred_server(mut self, server_id: impl Into<String>) -> Self {
        self.preferred_server_id = Some(server_id.into());
        self
    }

    pub fn excluding(mut self, server_id: impl Into<String>) -> Self {
        self.excluded_servers.insert(server_id.into());
        self
    }

    pub fn is_excluded(&self, server_id: &str) -> bool {
        self.excluded_servers.contains(server_id)
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Sorted, comma-joined capability list. Identical requirement sets
    /// always produce the same key regardless of insertion order.
    pub fn capability_key(&self) -> String {
        self.required_capabilities
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
