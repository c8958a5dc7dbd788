// Allow missing docs for internal items in development
#![allow(missing_docs)]

//! SecureX edge gateway - the data plane in front of project APIs.
//!
//! Every inbound request is authenticated by project API key, scored for
//! risk against its endpoint's own traffic history, and then allowed,
//! throttled (forwarded with an injected delay) or blocked (429, upstream
//! never contacted). Per-endpoint traffic is folded into rolling windows that
//! the dashboard reads back as endpoint analysis records.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECUREX EDGE GATEWAY                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐              ┌──────────────────────┐         │
//! │  │      Data plane      │              │       Analysis       │         │
//! │  │      Port 8787       │              │      Port 8788       │         │
//! │  └──────────┬───────────┘              └──────────┬───────────┘         │
//! │             │                                     │                     │
//! │  ┌──────────┴───────────┐              ┌──────────┴───────────┐         │
//! │  │  GatewayDispatcher   │              │  AnalysisProjector   │         │
//! │  │ key → score → decide │              │ severity, summaries  │         │
//! │  │  → forward → record  │              └──────────┬───────────┘         │
//! │  └──┬────────┬───────┬──┘                         │                     │
//! │     │        │       │                            │                     │
//! │  KeyStore  Risk   TrafficAggregator ◄─────────────┘                     │
//! │  (cache)  Mitig.  (per-endpoint windows)                                │
//! └─────┼────────────────────────────────────────────────────────────────────┘
//!       │                          │
//!  Control plane            Project upstreams
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sx_edge_gateway::{EdgeGatewayService, GatewayConfig};
//!
//! let config: GatewayConfig = toml::from_str(&raw)?;
//! let service = EdgeGatewayService::new(config)?;
//! service.start().await?;
//! ```
//!
//! # Decisions
//!
//! - risk ≥ 0.9 or hard rate-limit ceiling exhausted: **BLOCK** (429)
//! - risk ≥ 0.5 or soft quota exhausted: **THROTTLE** (forward, delay ~300ms)
//! - otherwise: **ALLOW**
//!
//! Thresholds are configuration defaults, validated once at startup.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod aggregator;
pub mod dispatcher;
pub mod domain;
pub mod key_store;
pub mod middleware;
pub mod ports;
pub mod projector;
pub mod service;

// Re-exports for public API
pub use adapters::{ControlPlaneClient, HttpUpstream, InMemoryIdentitySource};
pub use aggregator::TrafficAggregator;
pub use dispatcher::{GatewayDispatcher, PipelineDeps};
pub use domain::config::GatewayConfig;
pub use domain::error::{EdgeError, GatewayError};
pub use domain::types::*;
pub use domain::{EndpointAnalysis, Severity};
pub use key_store::KeyStore;
pub use middleware::GatewayMetrics;
pub use projector::AnalysisProjector;
pub use service::EdgeGatewayService;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `Server`-style identifier for logs and health output
pub fn gateway_version() -> String {
    format!("SecureX-Edge/v{}", VERSION)
}
