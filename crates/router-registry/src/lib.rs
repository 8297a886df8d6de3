//! Server registry and selection strategies
//!
//! `ServerRegistry` owns the catalog of known MCP servers and the background
//! health loop; choosing among eligible servers is delegated to a
//! `SelectionStrategy`.

pub mod registry;
pub mod strategy;

pub use registry::ServerRegistry;
pub use strategy::{
    build_strategy, CompositeStrategy, LoadBalancedStrategy, PreferredStrategy, RandomStrategy,
    RoundRobinStrategy, SelectionStrategy,
};
