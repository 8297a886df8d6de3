use chrono::Utc;
use futures::future::join_all;
use router_config::{RegistrySettings, ServerEntry};
use router_core::{Request, ServerInfo, ServerStatus};
use router_transport::Transport;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::strategy::{build_strategy, SelectionStrategy};

#[derive(Default)]
struct Catalog {
    servers: HashMap<String, ServerInfo>,
    capability_index: HashMap<String, BTreeSet<String>>,
    failures: HashMap<String, u32>,
}

impl Catalog {
    fn insert(&mut self, info: ServerInfo) {
        self.remove(&info.server_id);
        for capability in &info.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(info.server_id.clone());
        }
        self.servers.insert(info.server_id.clone(), info);
    }

    fn remove(&mut self, server_id: &str) -> Option<ServerInfo> {
        let removed = self.servers.remove(server_id)?;
        for capability in &removed.capabilities {
            if let Some(ids) = self.capability_index.get_mut(capability) {
                ids.remove(server_id);
                if ids.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }
        self.failures.remove(server_id);
        Some(removed)
    }
}

/// In-memory catalog of MCP servers with periodic health checking
pub struct ServerRegistry {
    catalog: Mutex<Catalog>,
    strategy: Box<dyn SelectionStrategy>,
    transport: Arc<dyn Transport>,
    health_check_interval: Duration,
    server_ttl: Duration,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        strategy: Box<dyn SelectionStrategy>,
        settings: &RegistrySettings,
    ) -> Self {
        Self {
            catalog: Mutex::new(Catalog::default()),
            strategy,
            transport,
            health_check_interval: settings.health_check_interval(),
            server_ttl: settings.server_ttl(),
            health_task: Mutex::new(None),
        }
    }

    /// Registry using the strategy named in `settings`
    pub fn from_settings(transport: Arc<dyn Transport>, settings: &RegistrySettings) -> Self {
        info!("Using '{}' server selection", settings.strategy);
        Self::new(transport, build_strategy(settings.strategy), settings)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Add or replace a server. Returns `false` if the server is invalid;
    /// an unhealthy server is still registered, as `Degraded`.
    pub async fn register_server(&self, mut info: ServerInfo, skip_health_check: bool) -> bool {
        if let Err(e) = info.validate() {
            warn!("Rejected server registration: {}", e);
            return false;
        }

        info.last_seen = Utc::now();
        info.status = ServerStatus::Active;

        if !skip_health_check && !self.transport.check_server_health(&info).await {
            warn!(
                "Server '{}' failed its initial health check, registering as degraded",
                info.server_id
            );
            info.status = ServerStatus::Degraded;
        }

        let server_id = info.server_id.clone();
        let status = info.status;
        let capabilities = info.capabilities.iter().cloned().collect::<Vec<_>>().join(", ");

        let mut catalog = self.catalog.lock().await;
        if catalog.servers.contains_key(&server_id) {
            self.strategy.server_removed(&server_id);
        }
        catalog.insert(info);
        info!(
            "Registered server '{}' ({}) with capabilities [{}]",
            server_id, status, capabilities
        );
        true
    }

    /// Register every enabled entry, warming up `warm_start` servers first.
    /// Returns how many were accepted.
    pub async fn register_configured<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a ServerEntry>,
    ) -> usize {
        let mut registered = 0;
        for entry in entries.into_iter().filter(|e| !e.disabled) {
            let info = entry.to_server_info();
            if entry.warm_start {
                if let Err(e) = self.transport.connect(&info).await {
                    warn!("Warm start of server '{}' failed: {}", info.server_id, e);
                }
            }
            if self.register_server(info, false).await {
                registered += 1;
            }
        }
        registered
    }

    /// Remove a server and release whatever the transport holds for it
    pub async fn unregister_server(&self, server_id: &str) -> bool {
        let removed = self.catalog.lock().await.remove(server_id);
        match removed {
            Some(server) => {
                self.strategy.server_removed(server_id);
                self.transport.release(&server).await;
                info!("Unregistered server '{}'", server_id);
                true
            }
            None => {
                debug!("Unregister of unknown server '{}'", server_id);
                false
            }
        }
    }

    /// Snapshot of the catalog, ordered by server id
    pub async fn discover_servers(&self) -> Vec<ServerInfo> {
        let catalog = self.catalog.lock().await;
        let mut servers: Vec<ServerInfo> = catalog.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        servers
    }

    pub async fn get_server(&self, server_id: &str) -> Option<ServerInfo> {
        self.catalog.lock().await.servers.get(server_id).cloned()
    }

    pub async fn servers_with_capability(&self, capability: &str) -> Vec<ServerInfo> {
        let catalog = self.catalog.lock().await;
        catalog
            .capability_index
            .get(capability)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| catalog.servers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn select_server(&self, request: &Request) -> Option<ServerInfo> {
        let catalog = self.catalog.lock().await;
        let selected = self.strategy.select_server(request, &catalog.servers);
        match &selected {
            Some(server) => debug!("Selected '{}' for {}", server.server_id, request.method),
            None => debug!(
                "No server available for {} with capabilities [{}]",
                request.method,
                request.capability_key()
            ),
        }
        selected
    }

    /// Report that a request routed to `server_id` has finished
    pub fn request_completed(&self, server_id: &str) {
        self.strategy.request_completed(server_id);
    }

    pub async fn len(&self) -> usize {
        self.catalog.lock().await.servers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One sweep: check every server, update statuses, evict expired entries.
    /// The catalog lock is not held while probing or releasing.
    #[instrument(skip(self))]
    pub async fn run_health_checks(&self) {
        let snapshot: Vec<ServerInfo> =
            self.catalog.lock().await.servers.values().cloned().collect();

        let transport = &self.transport;
        let results = join_all(snapshot.iter().map(|server| async move {
            (server.server_id.clone(), transport.check_server_health(server).await)
        }))
        .await;

        let now = Utc::now();
        let mut catalog = self.catalog.lock().await;
        let Catalog { servers, failures, .. } = &mut *catalog;

        for (server_id, healthy) in results {
            // Unregistered while we were probing
            let Some(server) = servers.get_mut(&server_id) else {
                continue;
            };

            let previous = server.status;
            if healthy {
                failures.remove(&server_id);
                server.status = ServerStatus::Active;
                server.last_seen = now;
                if previous != ServerStatus::Active {
                    info!("Server '{}' recovered: {} -> {}", server_id, previous, server.status);
                }
            } else {
                let count = failures.entry(server_id.clone()).or_insert(0);
                *count += 1;
                server.status = previous.demoted();
                if server.status != previous {
                    warn!(
                        "Server '{}' failed {} consecutive health check(s): {} -> {}",
                        server_id, count, previous, server.status
                    );
                }
            }
        }

        let expired: Vec<String> = servers
            .values()
            .filter(|server| match (now - server.last_seen).to_std() {
                Ok(age) => age > self.server_ttl,
                Err(_) => false,
            })
            .map(|server| server.server_id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for server_id in expired {
            if let Some(server) = catalog.remove(&server_id) {
                self.strategy.server_removed(&server_id);
                warn!("Evicted server '{}': not seen within {:?}", server_id, self.server_ttl);
                evicted.push(server);
            }
        }
        drop(catalog);

        for server in &evicted {
            self.transport.release(server).await;
        }
    }

    /// Start the background health loop. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.health_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("Health check loop already running");
            return;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let interval = self.health_check_interval;
        info!("Starting health check loop every {:?}", interval);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!("Registry dropped, health check loop exiting");
                    break;
                };
                registry.run_health_checks().await;
            }
        }));
    }

    /// Cancel the background loop and wait for it to finish
    pub async fn stop(&self) {
        let handle = self.health_task.lock().await.take();
        let Some(handle) = handle else {
            return;
        };

        handle.abort();
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!("Health check loop ended abnormally: {}", e),
        }
        info!("Health check loop stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.health_task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{LoadBalancedStrategy, RoundRobinStrategy};
    use async_trait::async_trait;
    use mockall::mock;
    use router_config::StrategyKind;
    use router_core::Result;
    use router_transport::{JsonRpcRequest, JsonRpcResponse};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    mock! {
        pub Backend {}

        #[async_trait]
        impl Transport for Backend {
            async fn check_server_health(&self, server: &ServerInfo) -> bool;
            async fn send_request(
                &self,
                server: &ServerInfo,
                request: JsonRpcRequest,
            ) -> Result<JsonRpcResponse>;
            async fn connect(&self, server: &ServerInfo) -> Result<()>;
            async fn release(&self, server: &ServerInfo);
            async fn cleanup(&self);
        }
    }

    fn healthy_transport() -> Arc<dyn Transport> {
        let mut backend = MockBackend::new();
        backend.expect_check_server_health().returning(|_| true);
        backend.expect_release().returning(|_| ());
        Arc::new(backend)
    }

    fn registry(strategy: StrategyKind) -> ServerRegistry {
        ServerRegistry::from_settings(healthy_transport(), &settings(strategy))
    }

    /// Transport whose health answer per server id can be changed between sweeps
    fn switchable_transport(down: Arc<StdMutex<HashSet<String>>>) -> Arc<dyn Transport> {
        let mut backend = MockBackend::new();
        backend
            .expect_check_server_health()
            .returning(move |server| !down.lock().unwrap().contains(&server.server_id));
        Arc::new(backend)
    }

    fn settings(strategy: StrategyKind) -> RegistrySettings {
        RegistrySettings {
            strategy,
            ..RegistrySettings::default()
        }
    }

    fn server(id: &str, caps: &[&str]) -> ServerInfo {
        ServerInfo::new(id, format!("http://{}.local", id))
            .with_capabilities(caps.iter().copied())
    }

    fn request(caps: &[&str]) -> Request {
        Request::new("tool", "tools/call").with_capabilities(caps.iter().copied())
    }

    #[tokio::test]
    async fn test_register_rejects_empty_capabilities() {
        let registry = registry(StrategyKind::RoundRobin);

        assert!(!registry.register_server(server("empty", &[]), false).await);
        assert!(registry.discover_servers().await.is_empty());
        let nameless = ServerInfo::new("", "http://x").with_capabilities(["a"]);
        assert!(!registry.register_server(nameless, true).await);
    }

    #[tokio::test]
    async fn test_unhealthy_registration_is_degraded() {
        let mut backend = MockBackend::new();
        backend.expect_check_server_health().returning(|_| false);
        let registry =
            ServerRegistry::from_settings(Arc::new(backend), &settings(StrategyKind::RoundRobin));

        assert!(registry.register_server(server("a", &["search"]), false).await);
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Degraded);
    }

    #[tokio::test]
    async fn test_skip_health_check_sends_nothing() {
        let mut backend = MockBackend::new();
        backend.expect_check_server_health().never();
        let registry =
            ServerRegistry::from_settings(Arc::new(backend), &settings(StrategyKind::RoundRobin));

        assert!(registry.register_server(server("a", &["search"]), true).await);
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_cleans_index() {
        let registry = registry(StrategyKind::RoundRobin);
        registry.register_server(server("a", &["search", "write"]), false).await;
        registry.register_server(server("b", &["search"]), false).await;

        assert_eq!(registry.servers_with_capability("write").await.len(), 1);
        assert!(registry.unregister_server("a").await);
        assert!(!registry.unregister_server("a").await);
        assert!(registry.servers_with_capability("write").await.is_empty());
        assert_eq!(registry.servers_with_capability("search").await.len(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unregister_releases_transport_state() {
        let mut backend = MockBackend::new();
        backend.expect_check_server_health().returning(|_| true);
        backend
            .expect_release()
            .withf(|server| server.server_id == "a")
            .times(1)
            .returning(|_| ());
        let registry =
            ServerRegistry::from_settings(Arc::new(backend), &settings(StrategyKind::RoundRobin));
        registry.register_server(server("a", &["search"]), false).await;

        assert!(registry.unregister_server("a").await);
        // Unknown ids release nothing
        assert!(!registry.unregister_server("a").await);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_capabilities() {
        let registry = registry(StrategyKind::RoundRobin);
        registry.register_server(server("a", &["search"]), false).await;
        registry.register_server(server("a", &["write"]), false).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.servers_with_capability("search").await.is_empty());
        assert_eq!(registry.servers_with_capability("write").await.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_returns_a_copy() {
        let registry = registry(StrategyKind::RoundRobin);
        registry.register_server(server("a", &["search"]), false).await;

        let mut snapshot = registry.discover_servers().await;
        snapshot[0].status = ServerStatus::Inactive;
        snapshot.clear();

        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn test_ttl_eviction() {
        let mut backend = MockBackend::new();
        backend
            .expect_check_server_health()
            .returning(|server| server.server_id != "stale");
        backend
            .expect_release()
            .withf(|server| server.server_id == "stale")
            .times(1)
            .returning(|_| ());
        let registry =
            ServerRegistry::from_settings(Arc::new(backend), &settings(StrategyKind::RoundRobin));
        registry.register_server(server("stale", &["search"]), true).await;
        registry.register_server(server("fresh", &["search"]), true).await;

        {
            let mut catalog = registry.catalog.lock().await;
            let stale = catalog.servers.get_mut("stale").unwrap();
            stale.last_seen = Utc::now() - chrono::Duration::seconds(10_000);
        }

        registry.run_health_checks().await;

        let ids: Vec<String> = registry
            .discover_servers()
            .await
            .into_iter()
            .map(|s| s.server_id)
            .collect();
        assert_eq!(ids, vec!["fresh".to_string()]);
        let searchers = registry.servers_with_capability("search").await;
        assert!(searchers.iter().all(|s| s.server_id == "fresh"));
    }

    #[tokio::test]
    async fn test_demotion_and_recovery() {
        let down = Arc::new(StdMutex::new(HashSet::new()));
        let registry = ServerRegistry::from_settings(
            switchable_transport(down.clone()),
            &settings(StrategyKind::RoundRobin),
        );
        registry.register_server(server("a", &["search"]), false).await;

        down.lock().unwrap().insert("a".to_string());
        registry.run_health_checks().await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Degraded);
        registry.run_health_checks().await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Inactive);
        registry.run_health_checks().await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Inactive);
        assert!(registry.select_server(&request(&["search"])).await.is_none());

        down.lock().unwrap().clear();
        registry.run_health_checks().await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Active);
        assert!(registry.select_server(&request(&["search"])).await.is_some());
    }

    #[tokio::test]
    async fn test_end_to_end_selection() {
        let registry = ServerRegistry::new(
            healthy_transport(),
            Box::new(RoundRobinStrategy::new()),
            &RegistrySettings::default(),
        );
        assert!(registry.register_server(server("A", &["search"]), false).await);
        assert!(registry.register_server(server("B", &["search", "write"]), false).await);

        let selected = |caps: &'static [&'static str]| {
            let registry = &registry;
            async move { registry.select_server(&request(caps)).await.unwrap().server_id }
        };

        for _ in 0..3 {
            assert_eq!(selected(&["write"]).await, "B");
        }

        let picks: Vec<String> =
            futures::future::join_all((0..4).map(|_| selected(&["search"]))).await;
        assert_eq!(picks.iter().filter(|id| id.as_str() == "A").count(), 2);
        assert_eq!(picks.iter().filter(|id| id.as_str() == "B").count(), 2);

        let first = selected(&["search"]).await;
        let second = selected(&["search"]).await;
        assert_ne!(first, second);

        assert!(registry.unregister_server("A").await);
        for _ in 0..4 {
            assert_eq!(selected(&["search"]).await, "B");
        }
    }

    #[tokio::test]
    async fn test_load_balanced_counters_follow_registry() {
        let strategy = Arc::new(LoadBalancedStrategy::new());
        let registry = ServerRegistry::new(
            healthy_transport(),
            Box::new(strategy.clone()),
            &RegistrySettings::default(),
        );
        registry.register_server(server("a", &["search"]), false).await;

        registry.select_server(&request(&["search"])).await.unwrap();
        assert_eq!(strategy.current_load("a"), 1);
        registry.request_completed("a");
        assert_eq!(strategy.current_load("a"), 0);

        registry.select_server(&request(&["search"])).await.unwrap();
        registry.unregister_server("a").await;
        assert_eq!(strategy.tracked_servers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_start_stop() {
        let down = Arc::new(StdMutex::new(HashSet::new()));
        let registry = Arc::new(ServerRegistry::from_settings(
            switchable_transport(down.clone()),
            &RegistrySettings {
                health_check_interval_seconds: 10,
                ..RegistrySettings::default()
            },
        ));
        registry.register_server(server("a", &["search"]), false).await;
        down.lock().unwrap().insert("a".to_string());

        registry.start().await;
        registry.start().await;
        assert!(registry.is_running().await);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Degraded);

        registry.stop().await;
        assert!(!registry.is_running().await);
        registry.stop().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.get_server("a").await.unwrap().status, ServerStatus::Degraded);
    }

    #[tokio::test]
    async fn test_register_configured_warms_stdio_servers() {
        let mut backend = MockBackend::new();
        backend.expect_connect().times(1).returning(|_| Ok(()));
        backend.expect_check_server_health().returning(|_| true);
        let registry = ServerRegistry::from_settings(Arc::new(backend), &RegistrySettings::default());

        let config = router_config::RouterConfig::from_yaml_str(
            r#"
servers:
  - server_id: local
    transport: stdio
    capabilities: [files]
    warm_start: true
    metadata:
      command: mcp-files
  - server_id: remote
    endpoint_url: http://remote.local
    capabilities: [search]
  - server_id: off
    endpoint_url: http://off.local
    capabilities: [search]
    disabled: true
"#,
        )
        .unwrap();

        assert_eq!(registry.register_configured(&config.servers).await, 2);
        assert!(registry.get_server("off").await.is_none());
        assert!(registry.get_server("local").await.unwrap().is_stdio());
    }
}
