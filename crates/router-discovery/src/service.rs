use router_config::{DiscoverySettings, RouterConfig};
use router_core::{Request, Result, RetryPolicy, RouterError, ServerInfo, ServerStatus};
use router_metrics::RoutingMetrics;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{FallbackHandler, RegistryClient, RoutedError};
use crate::rate_limit::RateLimiter;

#[derive(Default)]
struct ServerCache {
    servers: HashMap<String, ServerInfo>,
    refreshed_at: Option<Instant>,
}

/// Routes requests to MCP servers and hands off to a fallback when none
/// can serve them
pub struct DiscoveryService {
    client: Option<Arc<dyn RegistryClient>>,
    cache: Mutex<ServerCache>,
    cache_ttl: Duration,
    max_fallback_attempts: u32,
    retry: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<RoutingMetrics>,
}

impl DiscoveryService {
    pub fn new(
        client: Option<Arc<dyn RegistryClient>>,
        settings: &DiscoverySettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            cache: Mutex::new(ServerCache::default()),
            cache_ttl: settings.cache_ttl(),
            max_fallback_attempts: settings.max_fallback_attempts.max(1),
            retry,
            rate_limiter: None,
            metrics: Arc::new(RoutingMetrics::new()),
        }
    }

    /// Service wired from configuration, including the fallback rate limit
    pub fn from_config(client: Option<Arc<dyn RegistryClient>>, config: &RouterConfig) -> Self {
        let service = Self::new(client, &config.discovery, config.retry.clone());
        match config.limits.fallback_requests_per_minute {
            Some(rpm) => service.with_rate_limiter(Arc::new(RateLimiter::per_minute(rpm))),
            None => service,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RoutingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<RoutingMetrics> {
        self.metrics.clone()
    }

    /// Reload the cached server view from the registry
    pub async fn refresh(&self) -> Result<usize> {
        let Some(client) = &self.client else {
            return Ok(0);
        };

        let servers = client.list_servers().await?;
        let count = servers.len();

        let mut cache = self.cache.lock().await;
        cache.servers = servers
            .into_iter()
            .map(|s| (s.server_id.clone(), s))
            .collect();
        cache.refreshed_at = Some(Instant::now());
        debug!("Refreshed server cache: {} server(s)", count);
        Ok(count)
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let cache = self.cache.lock().await;
            cache
                .refreshed_at
                .map(|at| at.elapsed() >= self.cache_ttl)
                .unwrap_or(true)
        };
        if stale {
            if let Err(e) = self.refresh().await {
                warn!("Failed to refresh server cache, using previous view: {}", e);
            }
        }
    }

    /// Cached view of a server, as this process currently sees it
    pub async fn cached_server(&self, server_id: &str) -> Option<ServerInfo> {
        self.cache.lock().await.servers.get(server_id).cloned()
    }

    async fn mark_degraded(&self, server_id: &str) {
        let mut cache = self.cache.lock().await;
        if let Some(server) = cache.servers.get_mut(server_id) {
            if server.status == ServerStatus::Active {
                info!("Marking server '{}' degraded until the next refresh", server_id);
                server.status = ServerStatus::Degraded;
            }
        }
    }

    /// Servers to keep the registry away from on the next attempt, or
    /// `None` when the cached view has nothing left to try.
    ///
    /// Servers that already failed this request are skipped while an untried
    /// one remains; once every candidate has failed they may be retried.
    /// Servers degraded in the cache are skipped while an active one remains.
    /// Selection itself stays with the registry's strategy.
    async fn exclusions(
        &self,
        request: &Request,
        failed: &BTreeSet<String>,
    ) -> Option<BTreeSet<String>> {
        let cache = self.cache.lock().await;
        let available: Vec<&ServerInfo> = cache
            .servers
            .values()
            .filter(|s| s.status.is_available() && s.supports(&request.required_capabilities))
            .filter(|s| !request.is_excluded(&s.server_id))
            .collect();
        if available.is_empty() {
            return None;
        }

        let untried: Vec<&ServerInfo> = available
            .iter()
            .copied()
            .filter(|s| !failed.contains(&s.server_id))
            .collect();
        let pool = if untried.is_empty() { available.clone() } else { untried };

        let mut excluded: BTreeSet<String> = available
            .iter()
            .filter(|s| !pool.iter().any(|p| p.server_id == s.server_id))
            .map(|s| s.server_id.clone())
            .collect();
        if pool.iter().any(|s| s.status == ServerStatus::Active) {
            excluded.extend(
                pool.iter()
                    .filter(|s| s.status != ServerStatus::Active)
                    .map(|s| s.server_id.clone()),
            );
        }
        Some(excluded)
    }

    /// Serve `request` from an MCP server if possible, otherwise from
    /// `fallback`. The flag is `true` when an MCP server answered.
    #[instrument(skip(self, request, fallback), fields(method = %request.method))]
    pub async fn send_request_with_fallback(
        &self,
        request: &Request,
        fallback: &dyn FallbackHandler,
    ) -> Result<(Value, bool)> {
        let Some(client) = self.client.clone() else {
            debug!("No registry client configured, using fallback");
            return self.invoke_fallback(request, fallback).await;
        };

        self.refresh_if_stale().await;

        let mut failed = BTreeSet::new();
        for attempt in 0..self.max_fallback_attempts {
            let Some(excluded) = self.exclusions(request, &failed).await else {
                info!(
                    "No MCP server available for capabilities [{}], using fallback",
                    request.capability_key()
                );
                break;
            };

            let mut routed = request.clone();
            routed.excluded_servers.extend(excluded);

            let started = Instant::now();
            let outcome = client.send_request(&routed).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (server_id, error) = match outcome {
                Ok(response) => {
                    self.metrics.record_attempt(&response.server_id, elapsed_ms, true);
                    self.metrics.record_outcome(true);
                    return Ok((response.result, true));
                }
                Err(RoutedError {
                    server_id: None,
                    error,
                }) => {
                    info!("Registry could not route the request ({}), using fallback", error);
                    break;
                }
                Err(RoutedError {
                    server_id: Some(server_id),
                    error,
                }) => (server_id, error),
            };

            self.metrics.record_attempt(&server_id, elapsed_ms, false);
            warn!(
                "Attempt {}/{} via '{}' failed: {}",
                attempt + 1,
                self.max_fallback_attempts,
                server_id,
                error
            );

            if is_server_fault(&error) {
                self.mark_degraded(&server_id).await;
            }
            failed.insert(server_id);

            if !error.is_retryable() {
                debug!("Error is not retryable, giving up on MCP");
                break;
            }
            if attempt + 1 < self.max_fallback_attempts {
                let delay = self.retry.delay_for(attempt);
                debug!("Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.invoke_fallback(request, fallback).await
    }

    async fn invoke_fallback(
        &self,
        request: &Request,
        fallback: &dyn FallbackHandler,
    ) -> Result<(Value, bool)> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire() {
                self.metrics.record_rate_limited();
                debug!("Fallback rate limited, waiting for a token");
                limiter.acquire().await;
            }
        }

        match fallback.handle(request).await {
            Ok(value) => {
                self.metrics.record_outcome(false);
                Ok((value, false))
            }
            Err(e) => {
                self.metrics.record_failure();
                error!("Fallback handler failed for {}: {}", request.method, e);
                Err(e)
            }
        }
    }
}

/// Errors that say something about the server itself, not the route to it
fn is_server_fault(error: &RouterError) -> bool {
    matches!(error, RouterError::ServerError { .. } | RouterError::ProcessExited(_))
}
