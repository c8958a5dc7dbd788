//! Mitigation decisions.
//!
//! The decision is recomputed for every request from the risk score and the
//! caller's live rate-limit state; nothing is stored between requests except
//! what the rate limiter and the endpoint window already hold.
//!
//! | condition                                        | decision |
//! |--------------------------------------------------|----------|
//! | score >= block threshold, or hard ceiling hit    | BLOCK    |
//! | score >= throttle threshold, or soft quota hit   | THROTTLE |
//! | otherwise                                        | ALLOW    |
//!
//! BLOCK wins when both BLOCK and THROTTLE conditions hold.

use serde::Serialize;
use std::time::Duration;

use crate::domain::config::MitigationConfig;
use crate::domain::types::RateStatus;

/// What the gateway does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionKind {
    Allow,
    Throttle,
    Block,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Allow => "ALLOW",
            DecisionKind::Throttle => "THROTTLE",
            DecisionKind::Block => "BLOCK",
        }
    }
}

/// Transient decision for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MitigationDecision {
    pub kind: DecisionKind,
    /// Injected delay; zero unless throttled
    pub delay: Duration,
    pub risk_score: f64,
    /// Retry-After hint for blocked requests
    pub retry_after: Duration,
    /// Unix millis
    pub decided_at: i64,
}

/// Map a score and rate-limit state to a decision.
pub fn decide(
    risk_score: f64,
    rate: RateStatus,
    config: &MitigationConfig,
    now_millis: i64,
) -> MitigationDecision {
    // A NaN score cannot clear the throttle bar.
    let risk_score = if risk_score.is_nan() {
        config.throttle_threshold
    } else {
        risk_score.clamp(0.0, 1.0)
    };

    let hard_violation = matches!(rate, RateStatus::Exceeded { .. });
    let soft_violation = matches!(rate, RateStatus::Moderate { .. });

    let kind = if risk_score >= config.block_threshold || hard_violation {
        DecisionKind::Block
    } else if risk_score >= config.throttle_threshold || soft_violation {
        DecisionKind::Throttle
    } else {
        DecisionKind::Allow
    };

    let retry_after = match rate {
        RateStatus::Exceeded { retry_after_ms } => {
            Duration::from_millis(retry_after_ms.max(1000))
        }
        _ => Duration::from_secs(1),
    };

    MitigationDecision {
        kind,
        delay: if kind == DecisionKind::Throttle {
            config.throttle_delay
        } else {
            Duration::ZERO
        },
        risk_score,
        retry_after: if kind == DecisionKind::Block {
            retry_after
        } else {
            Duration::ZERO
        },
        decided_at: now_millis,
    }
}
