use router_core::{Result, RetryPolicy, RouterError, ServerInfo, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub mod env_substitution;

pub use env_substitution::{resolve_env_value, substitute_env_vars};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_server_ttl")]
    pub server_ttl_seconds: u64,
    #[serde(default)]
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_max_fallback_attempts")]
    pub max_fallback_attempts: u32,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Rate limit applied to fallback invocations; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_requests_per_minute: Option<u32>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// A statically configured server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default, alias = "server_type", alias = "type")]
    pub transport: TransportKind,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Spawn/connect before registering so the first health check can succeed
    #[serde(default)]
    pub warm_start: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl ServerEntry {
    pub fn to_server_info(&self) -> ServerInfo {
        let mut info = match &self.endpoint_url {
            Some(url) => ServerInfo::new(self.server_id.clone(), url.clone()),
            None => ServerInfo {
                endpoint_url: None,
                ..ServerInfo::new(self.server_id.clone(), String::new())
            },
        };
        info.transport = self.transport;
        info.capabilities = self.capabilities.iter().cloned().collect();
        info.metadata = self.metadata.clone();
        info
    }
}

/// Selection strategy named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StrategyKind {
    Preferred,
    RoundRobin,
    Random,
    LoadBalanced,
    #[default]
    PreferredRoundRobin,
    PreferredLoadBalanced,
}

impl FromStr for StrategyKind {
    type Err = RouterError;

    // Accepts "round_robin", "round-robin", "RoundRobin", "ROUND ROBIN", ...
    fn from_str(s: &str) -> Result<Self> {
        let normalised: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        match normalised.as_str() {
            "preferred" => Ok(StrategyKind::Preferred),
            "roundrobin" => Ok(StrategyKind::RoundRobin),
            "random" => Ok(StrategyKind::Random),
            "loadbalanced" | "leastload" => Ok(StrategyKind::LoadBalanced),
            "preferredroundrobin" | "composite" => Ok(StrategyKind::PreferredRoundRobin),
            "preferredloadbalanced" => Ok(StrategyKind::PreferredLoadBalanced),
            _ => Err(RouterError::ConfigError(format!(
                "Unknown selection strategy '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StrategyKind> for String {
    fn from(kind: StrategyKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyKind::Preferred => "preferred",
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::Random => "random",
            StrategyKind::LoadBalanced => "load_balanced",
            StrategyKind::PreferredRoundRobin => "preferred_round_robin",
            StrategyKind::PreferredLoadBalanced => "preferred_load_balanced",
        };
        f.write_str(s)
    }
}

impl RouterConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RouterError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut raw: Value = serde_yaml::from_str(yaml)
            .map_err(|e| RouterError::ConfigError(format!("Failed to parse YAML: {}", e)))?;

        // An empty document parses to null
        if raw.is_null() {
            raw = Value::Object(Default::default());
        }

        substitute_env_vars(&mut raw)?;

        let config: RouterConfig = serde_json::from_value(raw)
            .map_err(|e| RouterError::ConfigError(format!("Invalid configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_yaml(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.health_check_interval_seconds == 0 {
            return Err(RouterError::ConfigError(
                "health_check_interval_seconds must be greater than 0".into(),
            ));
        }
        if self.registry.server_ttl_seconds == 0 {
            return Err(RouterError::ConfigError(
                "server_ttl_seconds must be greater than 0".into(),
            ));
        }
        if self.registry.server_ttl_seconds < self.registry.health_check_interval_seconds {
            warn!(
                "server_ttl_seconds ({}) is shorter than the health check interval ({}); \
                 servers may be evicted between sweeps",
                self.registry.server_ttl_seconds,
                self.registry.health_check_interval_seconds
            );
        }
        if self.transport.request_timeout_seconds == 0 {
            return Err(RouterError::ConfigError(
                "request_timeout_seconds must be greater than 0".into(),
            ));
        }
        if self.discovery.max_fallback_attempts == 0 {
            return Err(RouterError::ConfigError(
                "max_fallback_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(RouterError::ConfigError(
                "backoff_factor must be a finite number >= 1.0".into(),
            ));
        }
        if self.limits.queue_capacity == 0 {
            return Err(RouterError::ConfigError("queue_capacity must be greater than 0".into()));
        }
        if self.limits.fallback_requests_per_minute == Some(0) {
            return Err(RouterError::ConfigError(
                "fallback_requests_per_minute must be greater than 0 when set".into(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.servers {
            if !seen.insert(entry.server_id.as_str()) {
                return Err(RouterError::ConfigError(format!(
                    "Duplicate server_id '{}'",
                    entry.server_id
                )));
            }
            if !entry.disabled {
                entry
                    .to_server_info()
                    .validate()
                    .map_err(|e| RouterError::ConfigError(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Servers not marked `disabled`
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(|s| !s.disabled)
    }

    pub fn default_config_path() -> PathBuf {
        env::var("MCP_ROUTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("router.yaml"))
    }
}

impl RegistrySettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn server_ttl(&self) -> Duration {
        Duration::from_secs(self.server_ttl_seconds)
    }
}

impl TransportSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl DiscoverySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: default_health_check_interval(),
            server_ttl_seconds: default_server_ttl(),
            strategy: StrategyKind::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            health_timeout_seconds: default_health_timeout(),
            shutdown_grace_seconds: default_shutdown_grace(),
            health_path: default_health_path(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_fallback_attempts: default_max_fallback_attempts(),
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            fallback_requests_per_minute: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_health_check_interval() -> u64 { 30 }
fn default_server_ttl() -> u64 { 300 }
fn default_request_timeout() -> u64 { 120 }
fn default_health_timeout() -> u64 { 5 }
fn default_shutdown_grace() -> u64 { 5 }
fn default_health_path() -> String { "/health".to_string() }
fn default_max_fallback_attempts() -> u32 { 3 }
fn default_cache_ttl() -> u64 { 60 }
fn default_queue_capacity() -> usize { 64 }
