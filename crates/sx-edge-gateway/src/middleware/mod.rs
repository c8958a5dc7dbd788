//! Tower layers and shared per-key state used around the dispatcher.
//!
//! Data plane: Request → Tracing → Dispatcher (rate limit, reputation and
//! circuit breaker are consulted from inside the pipeline).
//!
//! Analysis listener: Request → Tracing → CORS → Auth → Handler

pub mod auth;
pub mod circuit_breaker;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod reputation;
pub mod tracing;

pub use auth::{constant_time_compare, AuthLayer};
pub use circuit_breaker::{CircuitBreakerManager, CircuitState, CircuitStats};
pub use cors::create_cors_layer;
pub use metrics::GatewayMetrics;
pub use rate_limit::{extract_client_ip, RateLimitState};
pub use reputation::ReputationBook;
pub use tracing::TracingLayer;
