//! Request routing with graceful fallback
//!
//! `DiscoveryService` keeps its own cached view of the registry, tries MCP
//! servers that advertise the needed capabilities, and hands the request to
//! a caller-supplied `FallbackHandler` when none of them can answer.

pub mod client;
pub mod queue;
pub mod rate_limit;
pub mod service;

pub use client::{
    FallbackHandler, FnFallback, LocalRegistryClient, RegistryClient, RoutedError, RoutedResponse,
    RoutedResult,
};
pub use queue::{JobRecord, JobStatus, RequestQueue};
pub use rate_limit::RateLimiter;
pub use service::DiscoveryService;
