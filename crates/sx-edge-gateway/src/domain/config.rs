//! Gateway configuration with validation.
//!
//! Every section deserializes with defaults so a partial TOML file is enough.
//! The runtime validates the whole tree once at startup and injects it.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Data-plane listener (proxied traffic)
    pub http: HttpConfig,
    /// Dashboard-facing analysis listener
    pub analysis: AnalysisServerConfig,
    /// API key resolution against the control plane
    pub key_store: KeyStoreConfig,
    /// Upstream forwarding
    pub upstream: UpstreamConfig,
    /// Risk scoring weights and tiers
    pub risk: RiskConfig,
    /// Score thresholds and throttle delay
    pub mitigation: MitigationConfig,
    /// Per-client rate limiting
    pub rate_limit: RateLimitConfig,
    /// Rolling traffic windows
    pub aggregator: AggregatorConfig,
    /// Severity thresholds for endpoint analysis
    pub analysis_thresholds: AnalysisThresholds,
    /// Upstream failure isolation
    pub circuit_breaker: CircuitBreakerConfig,
    /// CORS for the analysis listener
    pub cors: CorsConfig,
}

impl GatewayConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.enabled
            && self.http.host == self.analysis.host
            && self.http.port == self.analysis.port
        {
            return Err(ConfigError::DuplicatePorts);
        }

        let m = &self.mitigation;
        if !(m.throttle_threshold > 0.0
            && m.throttle_threshold < m.block_threshold
            && m.block_threshold <= 1.0)
        {
            return Err(ConfigError::InvalidThreshold(format!(
                "expected 0 < throttle ({}) < block ({}) <= 1",
                m.throttle_threshold, m.block_threshold
            )));
        }

        let t = &self.analysis_thresholds;
        if !(t.watch_risk_score < t.high_risk_score) {
            return Err(ConfigError::InvalidThreshold(
                "watch_risk_score must be below high_risk_score".into(),
            ));
        }
        if !(t.watch_multiplier > 1.0 && t.watch_multiplier < t.high_multiplier) {
            return Err(ConfigError::InvalidThreshold(
                "expected 1 < watch_multiplier < high_multiplier".into(),
            ));
        }

        if self.risk.spike_multiplier <= 1.0 {
            return Err(ConfigError::InvalidThreshold(
                "risk.spike_multiplier must be greater than 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.cold_start_score) {
            return Err(ConfigError::InvalidThreshold(
                "risk.cold_start_score must be within [0, 1]".into(),
            ));
        }
        if self.risk.burst_window_secs == 0 || self.risk.burst_window_secs > 60 {
            return Err(ConfigError::Invalid(
                "risk.burst_window_secs must be within 1..=60".into(),
            ));
        }

        if self.rate_limit.requests_per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "requests_per_second cannot be 0".into(),
            ));
        }
        if self.rate_limit.hard_ceiling_multiplier < 1 {
            return Err(ConfigError::InvalidRateLimit(
                "hard_ceiling_multiplier must be at least 1".into(),
            ));
        }

        if self.aggregator.retention < Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout(
                "aggregator.retention must be at least one hour".into(),
            ));
        }

        if self.upstream.request_timeout.is_zero() || self.upstream.retry_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "upstream timeouts cannot be 0".into(),
            ));
        }
        if self.upstream.max_retries > 1 {
            return Err(ConfigError::InvalidLimit(
                "upstream.max_retries cannot exceed 1".into(),
            ));
        }
        if self.aggregator.max_endpoints_per_project == 0 {
            return Err(ConfigError::InvalidLimit(
                "aggregator.max_endpoints_per_project cannot be 0".into(),
            ));
        }
        if self.upstream.max_body_size == 0 {
            return Err(ConfigError::InvalidLimit("max_body_size cannot be 0".into()));
        }

        if self.key_store.control_plane_url.is_none() && self.key_store.static_keys.is_empty() {
            return Err(ConfigError::MissingKeySource);
        }
        if self.key_store.cache_ttl.is_zero() {
            return Err(ConfigError::InvalidTimeout("key_store.cache_ttl cannot be 0".into()));
        }

        Ok(())
    }

    /// Data-plane bind address
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.http.host, self.http.port)
    }

    /// Analysis API bind address
    pub fn analysis_addr(&self) -> SocketAddr {
        SocketAddr::new(self.analysis.host, self.analysis.port)
    }
}

/// Data-plane listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address
    pub host: IpAddr,
    /// Port (default: 8787)
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8787,
        }
    }
}

/// Analysis listener configuration (localhost only by default)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub enabled: bool,
    /// Bearer token required on analysis and internal routes (None = open)
    pub api_token: Option<String>,
}

impl Default for AnalysisServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8788,
            enabled: true,
            api_token: None,
        }
    }
}

/// A key declared directly in configuration (development and tests)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticKey {
    pub project_id: String,
    pub project_name: String,
    pub upstream_base_url: String,
    pub secret: String,
}

/// Key resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Control-plane base URL serving `GET /keys/validate`
    pub control_plane_url: Option<String>,
    /// Service token sent to the control plane as a bearer token
    pub control_plane_token: Option<String>,
    /// TTL for resolved keys
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// TTL for unknown keys and failed lookups
    #[serde(with = "humantime_serde")]
    pub negative_ttl: Duration,
    /// Control-plane lookup timeout
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
    /// Keys served without a control plane
    pub static_keys: Vec<StaticKey>,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            control_plane_url: None,
            control_plane_token: None,
            cache_ttl: Duration::from_secs(45),
            negative_ttl: Duration::from_secs(5),
            lookup_timeout: Duration::from_secs(2),
            static_keys: Vec::new(),
        }
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Timeout for the first attempt
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Timeout for the single retry (connect failures only)
    #[serde(with = "humantime_serde")]
    pub retry_timeout: Duration,
    /// Retries after a connect failure (0 or 1)
    pub max_retries: u32,
    /// Max request and response body size in bytes
    pub max_body_size: usize,
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry_timeout: Duration::from_secs(2),
            max_retries: 1,
            max_body_size: 10 * 1024 * 1024, // 10MB
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Risk scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Traffic multiple that saturates the velocity signal
    pub spike_multiplier: f64,
    /// Seconds of per-second counts used for burstiness
    pub burst_window_secs: u32,
    /// Requests in the burst window before burstiness is trusted
    pub min_burst_samples: u64,
    /// Coefficient of variation that saturates the burst signal
    pub burst_cv_ceiling: f64,
    /// Velocity signal used when an endpoint has no baseline
    pub cold_start_score: f64,
    pub burst_weight: f64,
    pub reputation_weight: f64,
    /// Per-flag contribution for request anomalies
    pub anomaly_flag_weight: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            spike_multiplier: 10.0,
            burst_window_secs: 10,
            min_burst_samples: 20,
            burst_cv_ceiling: 2.5,
            cold_start_score: 0.3,
            burst_weight: 0.6,
            reputation_weight: 0.8,
            anomaly_flag_weight: 0.25,
        }
    }
}

/// Mitigation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationConfig {
    /// Scores at or above this are blocked
    pub block_threshold: f64,
    /// Scores at or above this (and below block) are throttled
    pub throttle_threshold: f64,
    /// Delay injected into throttled responses
    #[serde(with = "humantime_serde")]
    pub throttle_delay: Duration,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.9,
            throttle_threshold: 0.5,
            throttle_delay: Duration::from_millis(300),
        }
    }
}

/// Rate limiting configuration, per project and client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Soft quota; exhausting it throttles
    pub requests_per_second: u32,
    /// Burst allowance (token bucket)
    pub burst_size: u32,
    /// Hard ceiling as a multiple of the soft quota; exhausting it blocks
    pub hard_ceiling_multiplier: u32,
    pub enabled: bool,
    /// Clients exempt from rate limiting
    pub whitelist: Vec<IpAddr>,
    /// Peers allowed to set `X-Forwarded-For` / `X-Real-IP`
    pub trusted_proxies: Vec<IpAddr>,
    /// Trust forwarded headers from loopback peers
    pub trust_localhost: bool,
    /// Number of trusted proxies in the `X-Forwarded-For` chain
    pub proxy_count: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst_size: 100,
            hard_ceiling_multiplier: 4,
            enabled: true,
            whitelist: Vec::new(),
            trusted_proxies: Vec::new(),
            trust_localhost: true,
            proxy_count: 1,
        }
    }
}

/// Rolling traffic window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How much minute-level history is kept
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Records further in the future than this are clamped to now
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,
    /// Distinct endpoints tracked per project; further paths share one window
    pub max_endpoints_per_project: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_clock_skew: Duration::from_secs(120),
            max_endpoints_per_project: 1_000,
        }
    }
}

impl AggregatorConfig {
    pub fn retention_minutes(&self) -> i64 {
        (self.retention.as_secs() / 60) as i64
    }
}

/// Severity thresholds for endpoint analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisThresholds {
    pub high_risk_score: f64,
    pub watch_risk_score: f64,
    pub high_multiplier: f64,
    pub watch_multiplier: f64,
    /// Window used when the caller passes no `time_range`
    #[serde(with = "humantime_serde")]
    pub default_time_range: Duration,
}

impl Default for AnalysisThresholds {
    fn default() -> Self {
        Self {
            high_risk_score: 0.8,
            watch_risk_score: 0.5,
            high_multiplier: 5.0,
            watch_multiplier: 2.0,
            default_time_range: Duration::from_secs(3600),
        }
    }
}

/// Circuit breaker configuration for upstream resilience
///
/// When a project's upstream fails repeatedly at the transport level the
/// circuit opens and requests fail fast with 502 until a trial request succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive transport failures before opening the circuit
    pub failure_threshold: u32,
    /// Successful trial requests in half-open state before closing
    pub success_threshold: u32,
    /// Time before a trial request is allowed through an open circuit
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(15),
        }
    }
}

/// CORS configuration for the analysis listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// Max age for preflight cache
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            max_age: 86400, // 24 hours
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Both listeners on the same address
    #[error("data-plane and analysis listeners share an address")]
    DuplicatePorts,
    /// Score or multiplier thresholds out of order
    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Neither a control plane nor static keys configured
    #[error("no key source: set key_store.control_plane_url or key_store.static_keys")]
    MissingKeySource,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `300ms`, `45s`, `2m`, `1h`, `7d` or plain seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|_| "invalid hours")
        } else if let Some(days) = s.strip_suffix('d') {
            days.trim()
                .parse::<u64>()
                .map(|d| Duration::from_secs(d * 86_400))
                .map_err(|_| "invalid days")
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}

pub use humantime_serde::parse_duration;
