use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Counters for one server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMetrics {
    pub server_id: String,
    pub requests: usize,
    pub failures: usize,
    pub total_latency_ms: u64,
}

impl ServerMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

/// Thread-safe routing counters, shared by reference between the
/// discovery service and whoever reports on it
pub struct RoutingMetrics {
    requests: AtomicUsize,
    served_by_mcp: AtomicUsize,
    served_by_fallback: AtomicUsize,
    failed: AtomicUsize,
    rate_limited: AtomicUsize,
    servers: RwLock<HashMap<String, ServerMetrics>>,
    started_at: RwLock<DateTime<Utc>>,
}

impl Default for RoutingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            served_by_mcp: AtomicUsize::new(0),
            served_by_fallback: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            rate_limited: AtomicUsize::new(0),
            servers: RwLock::new(HashMap::new()),
            started_at: RwLock::new(Utc::now()),
        }
    }

    fn servers_read(&self) -> RwLockReadGuard<'_, HashMap<String, ServerMetrics>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn servers_write(&self) -> RwLockWriteGuard<'_, HashMap<String, ServerMetrics>> {
        self.servers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// One attempt against a specific server
    pub fn record_attempt(&self, server_id: &str, duration_ms: u64, success: bool) {
        let mut servers = self.servers_write();
        let stats = servers
            .entry(server_id.to_string())
            .or_insert_with(|| ServerMetrics {
                server_id: server_id.to_string(),
                ..Default::default()
            });

        stats.requests += 1;
        stats.total_latency_ms += duration_ms;
        if !success {
            stats.failures += 1;
        }
    }

    /// How a top-level request was finally answered
    pub fn record_outcome(&self, used_mcp: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if used_mcp {
            self.served_by_mcp.fetch_add(1, Ordering::Relaxed);
        } else {
            self.served_by_fallback.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A request that neither MCP nor the fallback could answer
    pub fn record_failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn server_stats(&self) -> HashMap<String, ServerMetrics> {
        self.servers_read().clone()
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let requests = self.requests.load(Ordering::Relaxed);
        let served_by_mcp = self.served_by_mcp.load(Ordering::Relaxed);
        let served_by_fallback = self.served_by_fallback.load(Ordering::Relaxed);

        let (attempts, attempt_failures, latency_ms) = self
            .servers_read()
            .values()
            .fold((0usize, 0usize, 0u64), |(n, f, l), s| {
                (n + s.requests, f + s.failures, l + s.total_latency_ms)
            });

        let started_at = *self.started_at.read().unwrap_or_else(|e| e.into_inner());

        MetricsSummary {
            total_requests: requests,
            served_by_mcp,
            served_by_fallback,
            failed_requests: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            fallback_ratio: ratio(served_by_fallback, requests),
            mcp_attempts: attempts,
            attempt_success_rate: if attempts == 0 {
                0.0
            } else {
                (attempts - attempt_failures) as f64 / attempts as f64 * 100.0
            },
            average_latency_ms: if attempts == 0 {
                0.0
            } else {
                latency_ms as f64 / attempts as f64
            },
            uptime_seconds: (Utc::now() - started_at).num_seconds().max(0) as u64,
        }
    }

    pub fn reset(&self) {
        debug!("Resetting routing metrics");
        self.requests.store(0, Ordering::Relaxed);
        self.served_by_mcp.store(0, Ordering::Relaxed);
        self.served_by_fallback.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.servers_write().clear();
        *self.started_at.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: usize,
    pub served_by_mcp: usize,
    pub served_by_fallback: usize,
    pub failed_requests: usize,
    pub rate_limited: usize,
    pub fallback_ratio: f64,
    pub mcp_attempts: usize,
    pub attempt_success_rate: f64,
    pub average_latency_ms: f64,
    pub uptime_seconds: u64,
}
