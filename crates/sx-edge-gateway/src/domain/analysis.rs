//! Endpoint analysis records served to the dashboard.
//!
//! Severity is a closed set with total mappings to color and display order.
//! Summaries and actions are templated from the numeric fields.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::config::AnalysisThresholds;
use crate::domain::window::{traffic_multiplier, EndpointStats};

/// Triage label. Declaration order is display order: HIGH first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Watch,
    Normal,
}

/// Dashboard color for a severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityColor {
    Red,
    Yellow,
    Green,
}

impl Severity {
    pub fn color(self) -> SeverityColor {
        match self {
            Severity::High => SeverityColor::Red,
            Severity::Watch => SeverityColor::Yellow,
            Severity::Normal => SeverityColor::Green,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::High => "HIGH",
            Severity::Watch => "WATCH",
            Severity::Normal => "NORMAL",
        }
    }
}

/// Numeric view of one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub current_rpm: u64,
    /// None until a baseline exists
    pub baseline_rpm: Option<f64>,
    /// None when the baseline is missing or zero
    pub traffic_multiplier: Option<f64>,
    pub throttle_rate: f64,
    pub block_rate: f64,
    pub error_rate: f64,
    pub avg_risk_score: f64,
    /// Requests in the analysed range
    pub requests: u64,
}

impl EndpointMetrics {
    pub fn from_stats(stats: &EndpointStats) -> Self {
        let baseline_rpm = stats.baseline.map(|b| round_to(b.rpm, 2));
        Self {
            current_rpm: stats.current_rpm,
            baseline_rpm,
            traffic_multiplier: traffic_multiplier(
                stats.current_rpm as f64,
                stats.baseline.map(|b| b.rpm),
            )
            .map(|m| round_to(m, 2)),
            throttle_rate: round_to(stats.range.throttle_rate(), 4),
            block_rate: round_to(stats.range.block_rate(), 4),
            error_rate: round_to(stats.range.error_rate(), 4),
            avg_risk_score: round_to(stats.range.avg_risk_score(), 4),
            requests: stats.range.requests,
        }
    }
}

/// Dashboard record for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAnalysis {
    pub endpoint: String,
    pub severity: Severity,
    pub color: SeverityColor,
    pub summary: String,
    pub securex_action: String,
    pub suggested_action: Option<String>,
    pub metrics: EndpointMetrics,
}

impl EndpointAnalysis {
    pub fn build(
        endpoint: impl Into<String>,
        metrics: EndpointMetrics,
        thresholds: &AnalysisThresholds,
        throttle_delay: Duration,
    ) -> Self {
        let severity = classify(&metrics, thresholds);
        Self {
            endpoint: endpoint.into(),
            severity,
            color: severity.color(),
            summary: summarize(&metrics),
            securex_action: securex_action(&metrics, throttle_delay),
            suggested_action: suggested_action(severity, &metrics),
            metrics,
        }
    }
}

/// Threshold table.
///
/// HIGH: any block, avg risk at the high mark, or traffic at the high multiple.
/// WATCH: any throttle, traffic at the elevated multiple, or avg risk at the
/// watch mark. Every predicate is monotonic, so raising a rate never lowers
/// the severity.
pub fn classify(metrics: &EndpointMetrics, t: &AnalysisThresholds) -> Severity {
    let multiplier = metrics.traffic_multiplier.unwrap_or(0.0);

    if metrics.block_rate > 0.0
        || metrics.avg_risk_score >= t.high_risk_score
        || multiplier >= t.high_multiplier
    {
        Severity::High
    } else if metrics.throttle_rate > 0.0
        || multiplier >= t.watch_multiplier
        || metrics.avg_risk_score >= t.watch_risk_score
    {
        Severity::Watch
    } else {
        Severity::Normal
    }
}

pub fn summarize(metrics: &EndpointMetrics) -> String {
    let mut summary = match (metrics.traffic_multiplier, metrics.baseline_rpm) {
        (Some(m), Some(baseline)) => format!(
            "Traffic at {} baseline ({} rpm vs {} rpm expected)",
            format_multiplier(m),
            metrics.current_rpm,
            format_number(baseline)
        ),
        _ => format!(
            "Not enough history for a baseline yet; {} requests in the last minute",
            metrics.current_rpm
        ),
    };

    let mut mitigations = Vec::new();
    if metrics.throttle_rate > 0.0 {
        mitigations.push(format!("{} throttled", format_percent(metrics.throttle_rate)));
    }
    if metrics.block_rate > 0.0 {
        mitigations.push(format!("{} blocked", format_percent(metrics.block_rate)));
    }
    if !mitigations.is_empty() {
        summary.push_str(", ");
        summary.push_str(&mitigations.join(", "));
    }
    summary.push('.');
    summary
}

pub fn securex_action(metrics: &EndpointMetrics, throttle_delay: Duration) -> String {
    match (metrics.block_rate > 0.0, metrics.throttle_rate > 0.0) {
        (true, true) => format!(
            "Blocking high-risk requests with HTTP 429 ({} blocked) and delaying suspicious ones by {} ms ({} throttled).",
            format_percent(metrics.block_rate),
            throttle_delay.as_millis(),
            format_percent(metrics.throttle_rate)
        ),
        (true, false) => format!(
            "Blocking high-risk requests with HTTP 429 ({} blocked).",
            format_percent(metrics.block_rate)
        ),
        (false, true) => format!(
            "Delaying suspicious requests by {} ms ({} throttled).",
            throttle_delay.as_millis(),
            format_percent(metrics.throttle_rate)
        ),
        (false, false) => "Monitoring only; no mitigation applied.".to_string(),
    }
}

pub fn suggested_action(severity: Severity, metrics: &EndpointMetrics) -> Option<String> {
    match severity {
        Severity::High if metrics.block_rate > 0.0 => Some(
            "Review the clients being blocked on this endpoint and rotate the API key if it has leaked."
                .to_string(),
        ),
        Severity::High => Some(
            "Confirm whether this traffic is expected (launch, batch job) or tighten the endpoint's rate limit."
                .to_string(),
        ),
        Severity::Watch => Some(
            "Keep an eye on this endpoint; traffic is above its usual pattern.".to_string(),
        ),
        Severity::Normal => None,
    }
}

/// HIGH before WATCH before NORMAL, then busiest first, then by path.
pub fn sort_for_display(records: &mut [EndpointAnalysis]) {
    records.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| b.metrics.current_rpm.cmp(&a.metrics.current_rpm))
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
}

fn round_to(v: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (v * factor).round() / factor
}

/// `5x`, `2.5x`
pub fn format_multiplier(m: f64) -> String {
    format!("{}x", format_number(m))
}

/// `30%`, `12.5%`
pub fn format_percent(rate: f64) -> String {
    format!("{}%", format_number(rate * 100.0))
}

fn format_number(v: f64) -> String {
    let r = round_to(v, 1);
    if r.fract() == 0.0 {
        format!("{:.0}", r)
    } else {
        format!("{:.1}", r)
    }
}
