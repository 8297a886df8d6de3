//! Server selection strategies
//!
//! A strategy picks one server out of the registry's catalog for a request.
//! Strategies never touch `ServerInfo::status`; any state they keep
//! (round-robin cursors, load counters) is private to the instance.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use router_config::StrategyKind;
use router_core::{Request, ServerInfo, ServerStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick a server, or `None` if nothing suitable is available.
    /// Must not block; it runs under the registry lock.
    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo>;

    /// The caller finished a request it routed to `server_id`
    fn request_completed(&self, _server_id: &str) {}

    /// `server_id` left the catalog; drop any state kept for it
    fn server_removed(&self, _server_id: &str) {}
}

impl<S: SelectionStrategy + ?Sized> SelectionStrategy for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        (**self).select_server(request, servers)
    }

    fn request_completed(&self, server_id: &str) {
        (**self).request_completed(server_id)
    }

    fn server_removed(&self, server_id: &str) {
        (**self).server_removed(server_id)
    }
}

/// Capability-eligible, non-excluded servers ordered by id, so iteration
/// order is stable
fn eligible<'a>(
    request: &Request,
    servers: &'a HashMap<String, ServerInfo>,
) -> Vec<&'a ServerInfo> {
    let mut matching: Vec<&ServerInfo> = servers
        .values()
        .filter(|s| !request.is_excluded(&s.server_id))
        .filter(|s| s.supports(&request.required_capabilities))
        .collect();
    matching.sort_by(|a, b| a.server_id.cmp(&b.server_id));
    matching
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Honors `preferred_server_id` and nothing else
#[derive(Debug, Default)]
pub struct PreferredStrategy;

impl SelectionStrategy for PreferredStrategy {
    fn name(&self) -> &'static str {
        "preferred"
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        let preferred = request.preferred_server_id.as_deref()?;
        if request.is_excluded(preferred) {
            debug!("Preferred server '{}' is excluded for this request", preferred);
            return None;
        }
        let server = servers.get(preferred)?;

        if server.status.is_available() && server.supports(&request.required_capabilities) {
            Some(server.clone())
        } else {
            debug!(
                "Preferred server '{}' is {} or lacks capabilities, not selecting it",
                preferred, server.status
            );
            None
        }
    }
}

/// Rotates through eligible servers, one cursor per capability set
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        let candidates: Vec<&ServerInfo> = eligible(request, servers)
            .into_iter()
            .filter(|s| s.status.is_available())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut cursors = lock(&self.cursors);
        let cursor = cursors.entry(request.capability_key()).or_insert(0);
        let len = candidates.len();
        let start = *cursor % len;

        let mut first_degraded = None;
        for offset in 0..len {
            let index = (start + offset) % len;
            match candidates[index].status {
                ServerStatus::Active => {
                    *cursor = index + 1;
                    return Some(candidates[index].clone());
                }
                ServerStatus::Degraded if first_degraded.is_none() => first_degraded = Some(index),
                _ => {}
            }
        }

        let index = first_degraded?;
        *cursor = index + 1;
        Some(candidates[index].clone())
    }
}

/// Uniform choice among active servers, drawn from the OS CSPRNG
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        let candidates: Vec<&ServerInfo> = eligible(request, servers)
            .into_iter()
            .filter(|s| s.status == ServerStatus::Active)
            .collect();
        candidates.choose(&mut OsRng).map(|s| (*s).clone())
    }
}

/// Least in-flight requests wins; callers report completion through
/// `request_completed` or the counters only ever grow.
#[derive(Debug, Default)]
pub struct LoadBalancedStrategy {
    loads: Mutex<HashMap<String, usize>>,
}

impl LoadBalancedStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_load(&self, server_id: &str) -> usize {
        lock(&self.loads).get(server_id).copied().unwrap_or(0)
    }

    pub fn tracked_servers(&self) -> usize {
        lock(&self.loads).len()
    }
}

impl SelectionStrategy for LoadBalancedStrategy {
    fn name(&self) -> &'static str {
        "load_balanced"
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        let mut loads = lock(&self.loads);
        let chosen = eligible(request, servers)
            .into_iter()
            .filter(|s| s.status == ServerStatus::Active)
            .min_by_key(|s| {
                let load = loads.get(&s.server_id).copied().unwrap_or(0);
                (load, s.server_id.clone())
            })?;

        *loads.entry(chosen.server_id.clone()).or_insert(0) += 1;
        Some(chosen.clone())
    }

    fn request_completed(&self, server_id: &str) {
        if let Some(load) = lock(&self.loads).get_mut(server_id) {
            *load = load.saturating_sub(1);
        }
    }

    fn server_removed(&self, server_id: &str) {
        lock(&self.loads).remove(server_id);
    }
}

/// First non-`None` answer from an ordered list of strategies.
///
/// Completions are forwarded only to the sub-strategy that made the
/// selection. A completion for a server with several selections in flight
/// is matched to the most recent one.
pub struct CompositeStrategy {
    strategies: Vec<Box<dyn SelectionStrategy>>,
    in_flight: Mutex<HashMap<String, Vec<usize>>>,
}

impl CompositeStrategy {
    pub fn new(strategies: Vec<Box<dyn SelectionStrategy>>) -> Self {
        Self {
            strategies,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Selections routed to `server_id` that have not completed yet
    pub fn in_flight(&self, server_id: &str) -> usize {
        lock(&self.in_flight).get(server_id).map(Vec::len).unwrap_or(0)
    }
}

impl SelectionStrategy for CompositeStrategy {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn select_server(
        &self,
        request: &Request,
        servers: &HashMap<String, ServerInfo>,
    ) -> Option<ServerInfo> {
        let (index, server) = self
            .strategies
            .iter()
            .enumerate()
            .find_map(|(index, strategy)| {
                strategy
                    .select_server(request, servers)
                    .map(|server| (index, server))
            })?;

        debug!(
            "Strategy '{}' selected '{}'",
            self.strategies[index].name(),
            server.server_id
        );
        lock(&self.in_flight)
            .entry(server.server_id.clone())
            .or_default()
            .push(index);
        Some(server)
    }

    fn request_completed(&self, server_id: &str) {
        let index = {
            let mut in_flight = lock(&self.in_flight);
            let Some(pending) = in_flight.get_mut(server_id) else {
                debug!("Completion for '{}' with nothing in flight", server_id);
                return;
            };
            let index = pending.pop();
            if pending.is_empty() {
                in_flight.remove(server_id);
            }
            index
        };

        if let Some(index) = index {
            self.strategies[index].request_completed(server_id);
        }
    }

    fn server_removed(&self, server_id: &str) {
        lock(&self.in_flight).remove(server_id);
        for strategy in &self.strategies {
            strategy.server_removed(server_id);
        }
    }
}

pub fn build_strategy(kind: StrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        StrategyKind::Preferred => Box::new(PreferredStrategy),
        StrategyKind::RoundRobin => Box::new(RoundRobinStrategy::new()),
        StrategyKind::Random => Box::new(RandomStrategy),
        StrategyKind::LoadBalanced => Box::new(LoadBalancedStrategy::new()),
        StrategyKind::PreferredRoundRobin => Box::new(CompositeStrategy::new(vec![
            Box::new(PreferredStrategy),
            Box::new(RoundRobinStrategy::new()),
        ])),
        StrategyKind::PreferredLoadBalanced => Box::new(CompositeStrategy::new(vec![
            Box::new(PreferredStrategy),
            Box::new(LoadBalancedStrategy::new()),
        ])),
    }
}
