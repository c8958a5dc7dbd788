//! Per-request risk scoring.
//!
//! `score` is a pure function of the request context, the endpoint's window
//! snapshot and the risk configuration. Signals are combined as a noisy-or,
//! so each one is monotonic and any single strong signal can drive the score
//! high on its own:
//!
//! ```text
//! score = 1 - (1 - velocity)
//!           * (1 - burst_weight      * burstiness)
//!           * (1 - reputation_weight * reputation)
//!           * (1 - anomaly_flags)
//! ```

use crate::domain::config::RiskConfig;
use crate::domain::types::RequestContext;
use crate::domain::window::WindowSnapshot;

/// Breakdown of the signals behind a score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskSignals {
    pub velocity: f64,
    pub burstiness: f64,
    pub reputation: f64,
    pub anomalies: f64,
    /// True when the velocity signal used the cold-start tier
    pub cold_start: bool,
}

impl RiskSignals {
    pub fn combined(&self, config: &RiskConfig) -> f64 {
        let keep = (1.0 - self.velocity)
            * (1.0 - config.burst_weight.clamp(0.0, 1.0) * self.burstiness)
            * (1.0 - config.reputation_weight.clamp(0.0, 1.0) * self.reputation)
            * (1.0 - self.anomalies);
        (1.0 - keep).clamp(0.0, 1.0)
    }
}

/// Risk score in [0, 1] for one request.
pub fn score(ctx: &RequestContext, window: &WindowSnapshot, config: &RiskConfig) -> f64 {
    signals(ctx, window, config).combined(config)
}

pub fn signals(ctx: &RequestContext, window: &WindowSnapshot, config: &RiskConfig) -> RiskSignals {
    let (velocity, cold_start) = match window.traffic_multiplier() {
        Some(multiplier) => (velocity_signal(multiplier, config.spike_multiplier), false),
        None => (config.cold_start_score.clamp(0.0, 1.0), true),
    };

    RiskSignals {
        velocity,
        burstiness: burst_signal(&window.recent_seconds, config),
        reputation: sanitize(ctx.client_reputation),
        anomalies: (ctx.flags.count() as f64 * config.anomaly_flag_weight).clamp(0.0, 1.0),
        cold_start,
    }
}

/// Log-scaled deviation above baseline: 1x maps to 0, `spike` and above to 1.
///
/// Relative, so a 5x spike on a 2 rpm endpoint scores like one on 2000 rpm.
pub fn velocity_signal(multiplier: f64, spike: f64) -> f64 {
    if !multiplier.is_finite() {
        return if multiplier.is_nan() { 0.0 } else { 1.0 };
    }
    if multiplier <= 1.0 || spike <= 1.0 {
        return 0.0;
    }
    (multiplier.ln() / spike.ln()).clamp(0.0, 1.0)
}

/// Coefficient of variation of per-second counts, scaled by the ceiling.
///
/// Returns 0 until the window holds `min_burst_samples` requests, so a
/// quiet endpoint's sparse traffic is not mistaken for a burst.
pub fn burst_signal(per_second: &[u64], config: &RiskConfig) -> f64 {
    let total: u64 = per_second.iter().sum();
    if per_second.len() < 2 || total < config.min_burst_samples.max(1) {
        return 0.0;
    }

    let n = per_second.len() as f64;
    let mean = total as f64 / n;
    let variance = per_second
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let cv = variance.sqrt() / mean;

    if config.burst_cv_ceiling <= 0.0 {
        return 0.0;
    }
    (cv / config.burst_cv_ceiling).clamp(0.0, 1.0)
}

fn sanitize(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
