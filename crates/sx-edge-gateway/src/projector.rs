//! Read-side projection of endpoint windows into dashboard records.

use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::TrafficAggregator;
use crate::domain::analysis::{sort_for_display, EndpointAnalysis, EndpointMetrics};
use crate::domain::config::{parse_duration, AnalysisThresholds, MitigationConfig};
use crate::domain::types::ProjectId;

/// Builds `EndpointAnalysis` records on demand
pub struct AnalysisProjector {
    aggregator: Arc<TrafficAggregator>,
    thresholds: AnalysisThresholds,
    throttle_delay: Duration,
    retention: Duration,
}

impl AnalysisProjector {
    pub fn new(
        aggregator: Arc<TrafficAggregator>,
        thresholds: AnalysisThresholds,
        mitigation: &MitigationConfig,
        retention: Duration,
    ) -> Self {
        Self {
            aggregator,
            thresholds,
            throttle_delay: mitigation.throttle_delay,
            retention,
        }
    }

    /// Every endpoint of a project, HIGH first, then busiest first.
    ///
    /// Unknown projects yield an empty list. With no traffic in between, two
    /// calls at the same instant return identical records.
    pub fn project(
        &self,
        project_id: &ProjectId,
        time_range: Option<Duration>,
    ) -> Vec<EndpointAnalysis> {
        let range = time_range
            .unwrap_or(self.thresholds.default_time_range)
            .min(self.retention);
        let range_minutes = (range.as_secs() / 60).max(1) as i64;

        let mut records: Vec<EndpointAnalysis> = self
            .aggregator
            .endpoint_stats(project_id, range_minutes)
            .iter()
            .map(|stats| {
                EndpointAnalysis::build(
                    stats.endpoint.clone(),
                    EndpointMetrics::from_stats(stats),
                    &self.thresholds,
                    self.throttle_delay,
                )
            })
            .collect();

        sort_for_display(&mut records);
        records
    }
}

/// Parse a `time_range` query value such as `15m`, `1h` or `7d`.
///
/// Only minute, hour and day units are accepted; zero is rejected.
pub fn parse_time_range(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if !raw.ends_with(['m', 'h', 'd']) || raw.ends_with("ms") {
        return None;
    }
    parse_duration(raw).ok().filter(|d| !d.is_zero())
}
