use async_trait::async_trait;
use router_config::{DiscoverySettings, RegistrySettings, StrategyKind};
use router_core::{Request, Result, RetryPolicy, RouterError, ServerInfo, ServerStatus};
use router_discovery::{DiscoveryService, FnFallback, LocalRegistryClient, RegistryClient};
use router_registry::ServerRegistry;
use router_transport::{JsonRpcRequest, JsonRpcResponse, Transport};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Answers every request with the id of the server it reached; servers in
/// `failing` answer with a JSON-RPC internal error instead
#[derive(Default)]
struct ServerIdTransport {
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Transport for ServerIdTransport {
    async fn check_server_health(&self, _server: &ServerInfo) -> bool {
        true
    }

    async fn send_request(
        &self,
        server: &ServerInfo,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&server.server_id) {
            return Ok(JsonRpcResponse::failure(request.id, -32603, "internal error"));
        }
        Ok(JsonRpcResponse::success(request.id, json!(server.server_id)))
    }
}

struct Harness {
    registry: Arc<ServerRegistry>,
    transport: Arc<ServerIdTransport>,
    service: DiscoveryService,
}

async fn harness(strategy: StrategyKind) -> Harness {
    let transport = Arc::new(ServerIdTransport::default());
    let registry = Arc::new(ServerRegistry::from_settings(
        transport.clone(),
        &RegistrySettings {
            strategy,
            ..RegistrySettings::default()
        },
    ));

    let a = ServerInfo::new("A", "http://a.local").with_capabilities(["search"]);
    let b = ServerInfo::new("B", "http://b.local").with_capabilities(["search", "write"]);
    assert!(registry.register_server(a, false).await);
    assert!(registry.register_server(b, false).await);

    let client: Arc<dyn RegistryClient> =
        Arc::new(LocalRegistryClient::new(registry.clone(), transport.clone()));
    let service = DiscoveryService::new(
        Some(client),
        &DiscoverySettings {
            max_fallback_attempts: 2,
            ..DiscoverySettings::default()
        },
        RetryPolicy::immediate(0),
    );

    Harness {
        registry,
        transport,
        service,
    }
}

fn request(caps: &[&str]) -> Request {
    Request::new("tool", "tools/call").with_capabilities(caps.iter().copied())
}

type ReadyFallback = futures::future::Ready<Result<Value>>;

fn no_fallback_expected() -> FnFallback<impl Fn(Request) -> ReadyFallback + Send + Sync> {
    FnFallback::new(|request: Request| {
        futures::future::ready(Err(RouterError::ValidationError(format!(
            "fallback should not run for {}",
            request.method
        ))))
    })
}

impl Harness {
    /// Route a request and return the id of the server that answered it
    async fn served_by(&self, request: &Request) -> Value {
        let (served_by, used_mcp) = self
            .service
            .send_request_with_fallback(request, &no_fallback_expected())
            .await
            .unwrap();
        assert!(used_mcp);
        served_by
    }
}

async fn check_capability_routing_and_rotation(strategy: StrategyKind) {
    let h = harness(strategy).await;

    for _ in 0..3 {
        assert_eq!(h.served_by(&request(&["write"])).await, json!("B"));
    }

    let mut served = Vec::new();
    for _ in 0..4 {
        served.push(h.served_by(&request(&["search"])).await);
    }
    assert_eq!(served, vec![json!("A"), json!("B"), json!("A"), json!("B")]);

    assert!(h.registry.unregister_server("A").await);
    h.service.refresh().await.unwrap();
    for _ in 0..3 {
        assert_eq!(h.served_by(&request(&["search"])).await, json!("B"));
    }
}

#[tokio::test]
async fn capability_routing_and_rotation() {
    check_capability_routing_and_rotation(StrategyKind::RoundRobin).await;
}

#[tokio::test]
async fn default_strategy_rotates_without_a_preference() {
    check_capability_routing_and_rotation(StrategyKind::PreferredRoundRobin).await;
}

#[tokio::test]
async fn failures_are_charged_to_the_server_that_failed() {
    let h = harness(StrategyKind::RoundRobin).await;
    h.transport.failing.lock().unwrap().insert("B".to_string());

    // Round robin hands the first request to A and the second to B, which
    // fails and is retried on A
    assert_eq!(h.served_by(&request(&["search"])).await, json!("A"));
    assert_eq!(h.served_by(&request(&["search"])).await, json!("A"));

    assert_eq!(h.service.cached_server("A").await.unwrap().status, ServerStatus::Active);
    assert_eq!(h.service.cached_server("B").await.unwrap().status, ServerStatus::Degraded);

    let stats = h.service.metrics().server_stats();
    assert_eq!(stats["B"].failures, 1);
    assert_eq!(stats["A"].failures, 0);
}

#[tokio::test]
async fn fallback_runs_once_when_nothing_matches() {
    let h = harness(StrategyKind::PreferredRoundRobin).await;
    let fallback_calls = Arc::new(AtomicUsize::new(0));
    let counter = fallback_calls.clone();
    let fallback = FnFallback::new(move |_request: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok::<_, RouterError>(json!("plain answer")))
    });

    let (value, used_mcp) = h
        .service
        .send_request_with_fallback(&request(&["deploy"]), &fallback)
        .await
        .unwrap();

    assert_eq!(value, json!("plain answer"));
    assert!(!used_mcp);
    assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_preferred_server_is_avoided() {
    let h = harness(StrategyKind::PreferredRoundRobin).await;
    h.transport.failing.lock().unwrap().insert("A".to_string());

    let preferred = request(&["search"]).with_preferred_server("A");
    assert_eq!(h.served_by(&preferred).await, json!("B"));

    // Only the local view is degraded; the registry still sees A as active
    assert_eq!(h.service.cached_server("A").await.unwrap().status, ServerStatus::Degraded);
    assert_eq!(h.registry.get_server("A").await.unwrap().status, ServerStatus::Active);

    let summary = h.service.metrics().get_summary();
    assert_eq!(summary.served_by_mcp, 1);
    assert_eq!(summary.mcp_attempts, 2);
}

#[tokio::test]
async fn every_server_failing_ends_in_fallback() {
    let h = harness(StrategyKind::PreferredRoundRobin).await;
    {
        let mut failing = h.transport.failing.lock().unwrap();
        failing.insert("A".to_string());
        failing.insert("B".to_string());
    }
    let fallback = FnFallback::new(|_request: Request| {
        futures::future::ready(Ok::<_, RouterError>(json!("fallback")))
    });

    let (value, used_mcp) = h
        .service
        .send_request_with_fallback(&request(&["search"]), &fallback)
        .await
        .unwrap();
    assert_eq!(value, json!("fallback"));
    assert!(!used_mcp);
    assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);
}
