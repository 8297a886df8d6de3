//! Server model: identity, endpoint, advertised capabilities and health status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::RouterError;

/// Health status of a registered server. Only the registry's health loop
/// moves a server between these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Degraded,
    Inactive,
}

impl ServerStatus {
    /// Active or degraded servers may still be selected.
    pub fn is_available(&self) -> bool {
        matches!(self, ServerStatus::Active | ServerStatus::Degraded)
    }

    /// Next status after a failed health check.
    pub fn demoted(self) -> Self {
        match self {
            ServerStatus::Active => ServerStatus::Degraded,
            ServerStatus::Degraded | ServerStatus::Inactive => ServerStatus::Inactive,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Active => "active",
            ServerStatus::Degraded => "degraded",
            ServerStatus::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// How the router talks to a server.
///
/// External configs spell this many ways (`"stdio"`, `"STDIO"`, `"sse"`,
/// `"http"`); all of them are parsed into this enum once, at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    #[default]
    Http,
    Stdio,
}

impl FromStr for TransportKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "https" | "sse" | "streamable-http" | "streamable_http" => {
                Ok(TransportKind::Http)
            }
            "stdio" | "process" | "subprocess" => Ok(TransportKind::Stdio),
            other => Err(RouterError::ConfigError(format!(
                "Unknown transport type '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Http => "http".to_string(),
            TransportKind::Stdio => "stdio".to_string(),
        }
    }
}

/// A discovered MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    pub transport: TransportKind,

    pub capabilities: BTreeSet<String>,

    #[serde(default = "default_status")]
    pub status: ServerStatus,

    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,

    /// Transport-specific extras: `command`, `args`, `env`, `cwd`,
    /// `headers`, `timeout_seconds`, or `transport = "stdio"`.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_status() -> ServerStatus {
    ServerStatus::Active
}

impl ServerInfo {
    /// A network-addressable server
    pub fn new(server_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint_url: Some(endpoint_url.into()),
            transport: TransportKind::Http,
            capabilities: BTreeSet::new(),
            status: ServerStatus::Active,
            last_seen: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// A child-process server launched as `command args...`
    pub fn stdio<I, S>(server_id: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<Value> = args.into_iter().map(|a| Value::String(a.into())).collect();
        let mut metadata = HashMap::new();
        metadata.insert("command".to_string(), Value::String(command.into()));
        metadata.insert("args".to_string(), Value::Array(args));

        Self {
            server_id: server_id.into(),
            endpoint_url: None,
            transport: TransportKind::Stdio,
            capabilities: BTreeSet::new(),
            status: ServerStatus::Active,
            last_seen: Utc::now(),
            metadata,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Stdio servers are identified either by the transport field or by a
    /// `transport = "stdio"` metadata flag.
    pub fn is_stdio(&self) -> bool {
        self.transport == TransportKind::Stdio
            || self
                .metadata
                .get("transport")
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case("stdio"))
                .unwrap_or(false)
    }

    /// Server capabilities are a superset of `required`. An empty
    /// requirement matches every server.
    pub fn supports(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Per-server read timeout override from `metadata.timeout_seconds`
    pub fn timeout_override(&self) -> Option<Duration> {
        let value = self.metadata.get("timeout_seconds")?;
        let secs = value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))?;
        Some(Duration::from_secs(secs))
    }

    /// Checks the fields `register_server` requires.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(RouterError::ValidationError("server_id cannot be empty".into()));
        }
        if !self.is_stdio() {
            match self.endpoint_url.as_deref().map(str::trim) {
                None | Some("") => {
                    return Err(RouterError::ValidationError(format!(
                        "Server '{}' has no endpoint_url",
                        self.server_id
                    )));
                }
                Some(_) => {}
            }
        }
        if self.capabilities.is_empty() {
            return Err(RouterError::ValidationError(format!(
                "Server '{}' must advertise at least one capability",
                self.server_id
            )));
        }
        Ok(())
    }
}
