//! Domain types for the edge gateway.
//!
//! Pure data and pure functions: configuration, the error taxonomy, the risk
//! and mitigation math, and the analysis record shape. Stateful components
//! (key cache, traffic windows) live at the crate root.

pub mod analysis;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod mitigation;
pub mod risk;
pub mod types;
pub mod window;

// Re-exports for convenience
pub use analysis::{EndpointAnalysis, EndpointMetrics, Severity, SeverityColor};
pub use config::{ConfigError, GatewayConfig};
pub use endpoint::normalize_endpoint;
pub use error::{EdgeError, GatewayError, IdentityError, UpstreamError};
pub use mitigation::{decide, DecisionKind, MitigationDecision};
pub use types::*;
pub use window::{Baseline, EndpointStats, RangeStats, WindowSnapshot};
