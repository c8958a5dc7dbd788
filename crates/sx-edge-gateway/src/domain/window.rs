//! Read-side views of an endpoint's rolling window.

/// Expected rate at this time of day, from trailing history
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    /// Mean requests per minute at the same minute-of-day
    pub rpm: f64,
    /// Trailing days that contributed (1..=7)
    pub days_observed: u32,
}

/// What the risk scorer sees of an endpoint at decision time
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowSnapshot {
    /// Requests in the trailing 60 seconds
    pub current_rpm: u64,
    /// None while the endpoint is too young to have history
    pub baseline: Option<Baseline>,
    /// Per-second request counts, oldest first
    pub recent_seconds: Vec<u64>,
}

impl WindowSnapshot {
    pub fn traffic_multiplier(&self) -> Option<f64> {
        traffic_multiplier(self.current_rpm as f64, self.baseline.map(|b| b.rpm))
    }
}

/// current / baseline; None when the baseline is missing or zero.
pub fn traffic_multiplier(current_rpm: f64, baseline_rpm: Option<f64>) -> Option<f64> {
    match baseline_rpm {
        Some(baseline) if baseline > 0.0 && baseline.is_finite() => Some(current_rpm / baseline),
        _ => None,
    }
}

/// Counters summed over an analysis time range
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RangeStats {
    pub requests: u64,
    pub throttled: u64,
    pub blocked: u64,
    pub errors: u64,
    pub aborted: u64,
    pub risk_sum: f64,
}

impl RangeStats {
    fn ratio(&self, n: u64) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            n as f64 / self.requests as f64
        }
    }

    pub fn throttle_rate(&self) -> f64 {
        self.ratio(self.throttled)
    }

    pub fn block_rate(&self) -> f64 {
        self.ratio(self.blocked)
    }

    pub fn error_rate(&self) -> f64 {
        self.ratio(self.errors)
    }

    pub fn avg_risk_score(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.risk_sum / self.requests as f64
        }
    }
}

/// Everything the projector needs for one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStats {
    pub endpoint: String,
    pub current_rpm: u64,
    pub baseline: Option<Baseline>,
    pub range: RangeStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_guards_zero_baseline() {
        assert_eq!(traffic_multiplier(500.0, Some(100.0)), Some(5.0));
        assert_eq!(traffic_multiplier(500.0, Some(0.0)), None);
        assert_eq!(traffic_multiplier(500.0, None), None);
    }

    #[test]
    fn test_empty_range_rates_are_zero() {
        let stats = RangeStats::default();
        assert_eq!(stats.throttle_rate(), 0.0);
        assert_eq!(stats.avg_risk_score(), 0.0);
    }

    #[test]
    fn test_range_rates() {
        let stats = RangeStats {
            requests: 10,
            throttled: 3,
            blocked: 1,
            errors: 2,
            aborted: 0,
            risk_sum: 4.0,
        };
        assert!((stats.throttle_rate() - 0.3).abs() < f64::EPSILON);
        assert!((stats.block_rate() - 0.1).abs() < f64::EPSILON);
        assert!((stats.error_rate() - 0.2).abs() < f64::EPSILON);
        assert!((stats.avg_risk_score() - 0.4).abs() < f64::EPSILON);
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn multiplier_is_monotonic_in_current(
                baseline in 0.1f64..10_000.0,
                a in 0u32..100_000,
                b in 0u32..100_000,
            ) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let m_lo = traffic_multiplier(lo as f64, Some(baseline)).unwrap();
                let m_hi = traffic_multiplier(hi as f64, Some(baseline)).unwrap();
                prop_assert!(m_lo <= m_hi);
            }
        }
    }
}
