//! Per-client rate limiting using token buckets.
//!
//! Buckets are keyed by (project, client IP). Each key carries two limiters:
//! a soft quota whose exhaustion means "moderate overage" (throttle) and a
//! hard ceiling, a multiple of the soft quota, whose exhaustion blocks. The
//! result feeds the mitigation decision instead of rejecting directly.

use axum::{extract::ConnectInfo, http::Request};
use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::config::RateLimitConfig;
use crate::domain::types::{ProjectId, RateStatus};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token buckets for one (project, client) pair
struct TokenBucket {
    soft: DirectLimiter,
    hard: DirectLimiter,
    /// Last access time (for cleanup)
    last_access: Mutex<Instant>,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let multiplier = config.hard_ceiling_multiplier.max(1);
        let soft = quota(config.requests_per_second, config.burst_size);
        let hard = quota(
            config.requests_per_second.saturating_mul(multiplier),
            config.burst_size.saturating_mul(multiplier),
        );

        Self {
            soft: RateLimiter::direct(soft),
            hard: RateLimiter::direct(hard),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn check(&self) -> RateStatus {
        *self.last_access.lock() = Instant::now();
        let clock = DefaultClock::default();

        if let Err(not_until) = self.hard.check() {
            return RateStatus::Exceeded {
                retry_after_ms: not_until.wait_time_from(clock.now()).as_millis() as u64,
            };
        }
        match self.soft.check() {
            Ok(_) => RateStatus::Within,
            Err(not_until) => RateStatus::Moderate {
                retry_after_ms: not_until.wait_time_from(clock.now()).as_millis() as u64,
            },
        }
    }
}

fn quota(per_second: u32, burst: u32) -> Quota {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(per_second)).unwrap_or(rate);
    Quota::per_second(rate).allow_burst(burst)
}

/// Rate limiter state shared across requests
pub struct RateLimitState {
    buckets: DashMap<(ProjectId, IpAddr), Arc<TokenBucket>>,
    config: RateLimitConfig,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Current rate-limit status for a client of a project.
    pub fn check(&self, project_id: &ProjectId, ip: IpAddr) -> RateStatus {
        if !self.config.enabled || self.config.whitelist.contains(&ip) {
            return RateStatus::Within;
        }

        let key = (project_id.clone(), ip);
        let bucket = match self.buckets.get(&key) {
            Some(bucket) => Arc::clone(bucket.value()),
            None => Arc::clone(
                self.buckets
                    .entry(key)
                    .or_insert_with(|| {
                        debug!(project_id = %project_id, ip = %ip, "Creating new rate limit bucket");
                        Arc::new(TokenBucket::new(&self.config))
                    })
                    .value(),
            ),
        };
        bucket.check()
    }

    /// Clean up old buckets (call periodically)
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(*bucket.last_access.lock()) <= max_age);
        before.saturating_sub(self.buckets.len())
    }

    /// Client IP for a request under this limiter's proxy settings
    pub fn client_ip<B>(&self, req: &Request<B>) -> IpAddr {
        extract_client_ip(req, &self.config)
    }

    /// Get number of tracked clients
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Client IP as seen by this gateway.
///
/// The socket peer is authoritative. Forwarded headers are honoured only when
/// that peer is a trusted proxy; `X-Forwarded-For` is read `proxy_count`
/// entries from the right, then `X-Real-IP`.
pub fn extract_client_ip<B>(req: &Request<B>, config: &RateLimitConfig) -> IpAddr {
    let direct_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if !is_trusted_proxy(direct_ip, config) {
        if let Some(forwarded) = req.headers().get("x-forwarded-for") {
            warn!(
                direct_ip = %direct_ip,
                forwarded = ?forwarded,
                "Ignoring X-Forwarded-For from untrusted source"
            );
        }
        return direct_ip;
    }

    if let Some(value) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let ips: Vec<&str> = value.split(',').map(|s| s.trim()).collect();
        let index = ips.len().saturating_sub(config.proxy_count + 1);
        if let Some(ip) = ips.get(index).and_then(|s| s.parse::<IpAddr>().ok()) {
            return ip;
        }
    }

    if let Some(ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    direct_ip
}

fn is_trusted_proxy(ip: IpAddr, config: &RateLimitConfig) -> bool {
    config.trusted_proxies.contains(&ip) || (config.trust_localhost && ip.is_loopback())
}
