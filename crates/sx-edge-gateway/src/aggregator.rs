//! Rolling per-endpoint traffic windows.
//!
//! Each (project, endpoint) pair owns an `EndpointWindow` behind its own
//! mutex; the map itself is a sharded `DashMap`, so concurrent requests to
//! different endpoints never contend and updates to one endpoint are
//! linearizable.
//!
//! A window keeps two views:
//!
//! - minute buckets tagged with their absolute minute, kept for the
//!   retention horizon (default 7 days), used for range stats and the
//!   baseline;
//! - a 60-slot per-second ring used for `current_rpm` (sliding 60s sum) and
//!   burstiness.
//!
//! Buckets are addressed by the minute or second the request *arrived*, not
//! by when `record` runs, so late records land in the right bucket and a
//! bucket is only ever reset when its tag changes. Arrivals stamped ahead of
//! the aggregator clock count toward the current second.
//!
//! Each project tracks at most `max_endpoints_per_project` distinct
//! endpoints; once full, new paths share the `/{other}` window.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::domain::config::AggregatorConfig;
use crate::domain::types::{EndpointKey, Outcome, ProjectId};
use crate::domain::window::{Baseline, EndpointStats, RangeStats, WindowSnapshot};
use crate::ports::TimeSource;

const MILLIS_PER_MINUTE: i64 = 60_000;
const MINUTES_PER_DAY: i64 = 1_440;
/// Trailing days averaged into the baseline
const BASELINE_DAYS: i64 = 7;
/// Minutes either side of the slot averaged per day
const BASELINE_NEIGHBOURHOOD: i64 = 2;
const SECOND_SLOTS: usize = 60;
/// Shared window for paths beyond a project's endpoint cap
pub const OVERFLOW_ENDPOINT: &str = "/{other}";

#[derive(Debug, Clone, Copy, Default)]
struct MinuteBucket {
    requests: u64,
    throttled: u64,
    blocked: u64,
    errors: u64,
    aborted: u64,
    risk_sum: f64,
}

impl MinuteBucket {
    fn add(&mut self, outcome: Outcome, risk_score: f64) {
        self.requests += 1;
        self.throttled += outcome.is_throttled() as u64;
        self.blocked += outcome.is_blocked() as u64;
        self.errors += outcome.is_error() as u64;
        self.aborted += outcome.is_aborted() as u64;
        if risk_score.is_finite() {
            self.risk_sum += risk_score.clamp(0.0, 1.0);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SecondSlot {
    second: i64,
    count: u64,
}

/// Rolling window for one endpoint
#[derive(Debug)]
pub struct EndpointWindow {
    minutes: BTreeMap<i64, MinuteBucket>,
    seconds: [SecondSlot; SECOND_SLOTS],
    /// First minute this endpoint was seen; days before it carry no history
    first_minute: i64,
    last_seen_millis: i64,
}

impl EndpointWindow {
    fn new(first_millis: i64) -> Self {
        Self {
            minutes: BTreeMap::new(),
            seconds: [SecondSlot {
                second: i64::MIN,
                count: 0,
            }; SECOND_SLOTS],
            first_minute: first_millis.div_euclid(MILLIS_PER_MINUTE),
            last_seen_millis: first_millis,
        }
    }

    fn record(
        &mut self,
        at_millis: i64,
        now_millis: i64,
        outcome: Outcome,
        risk_score: f64,
        horizon_minute: i64,
    ) {
        let minute = at_millis.div_euclid(MILLIS_PER_MINUTE);
        self.minutes
            .entry(minute)
            .or_default()
            .add(outcome, risk_score);
        self.first_minute = self.first_minute.min(minute);
        self.last_seen_millis = self.last_seen_millis.max(at_millis);

        // a future second would claim a live slot and shadow real arrivals
        let second = at_millis.min(now_millis).div_euclid(1000);
        let slot = &mut self.seconds[second.rem_euclid(SECOND_SLOTS as i64) as usize];
        if slot.second == second {
            slot.count += 1;
        } else if slot.second < second {
            *slot = SecondSlot { second, count: 1 };
        }
        // an older second whose slot was already reused has left the 60s window

        // age out minute buckets past the horizon
        if self
            .minutes
            .first_key_value()
            .is_some_and(|(m, _)| *m < horizon_minute)
        {
            self.minutes = self.minutes.split_off(&horizon_minute);
        }
    }

    fn count_at(&self, second: i64) -> u64 {
        let slot = &self.seconds[second.rem_euclid(SECOND_SLOTS as i64) as usize];
        if slot.second == second {
            slot.count
        } else {
            0
        }
    }

    /// Requests in the 60 seconds ending at `now_second` (inclusive)
    fn current_rpm(&self, now_second: i64) -> u64 {
        self.seconds
            .iter()
            .filter(|s| s.second > now_second - SECOND_SLOTS as i64 && s.second <= now_second)
            .map(|s| s.count)
            .sum()
    }

    /// Per-second counts for the last `n` seconds, oldest first
    fn recent_seconds(&self, now_second: i64, n: usize) -> Vec<u64> {
        let n = n.clamp(1, SECOND_SLOTS) as i64;
        (now_second - n + 1..=now_second)
            .map(|s| self.count_at(s))
            .collect()
    }

    fn requests_in_minute(&self, minute: i64) -> u64 {
        self.minutes.get(&minute).map_or(0, |b| b.requests)
    }

    /// Mean rpm at this minute of day over the trailing days with history.
    ///
    /// Daily cycles only; weekday/weekend differences are not modelled.
    fn baseline(&self, now_minute: i64, retention_minutes: i64) -> Option<Baseline> {
        let days = BASELINE_DAYS.min(retention_minutes / MINUTES_PER_DAY);
        let span = (2 * BASELINE_NEIGHBOURHOOD + 1) as f64;

        let mut total = 0.0;
        let mut days_observed = 0u32;
        for day in 1..=days {
            let slot = now_minute - day * MINUTES_PER_DAY;
            if slot - BASELINE_NEIGHBOURHOOD < self.first_minute {
                break;
            }
            let requests: u64 = (slot - BASELINE_NEIGHBOURHOOD..=slot + BASELINE_NEIGHBOURHOOD)
                .map(|m| self.requests_in_minute(m))
                .sum();
            total += requests as f64 / span;
            days_observed += 1;
        }

        (days_observed > 0).then(|| Baseline {
            rpm: total / days_observed as f64,
            days_observed,
        })
    }

    /// Counters over the `range_minutes` minutes ending at `now_minute`
    fn range_stats(&self, now_minute: i64, range_minutes: i64) -> RangeStats {
        let start = now_minute - range_minutes.max(1) + 1;
        self.minutes
            .range(start..=now_minute)
            .fold(RangeStats::default(), |mut acc, (_, b)| {
                acc.requests += b.requests;
                acc.throttled += b.throttled;
                acc.blocked += b.blocked;
                acc.errors += b.errors;
                acc.aborted += b.aborted;
                acc.risk_sum += b.risk_sum;
                acc
            })
    }
}

/// Shared traffic aggregator
pub struct TrafficAggregator {
    windows: DashMap<EndpointKey, Arc<Mutex<EndpointWindow>>>,
    /// Capped windows per project, excluding the overflow window
    endpoint_counts: DashMap<ProjectId, usize>,
    config: AggregatorConfig,
    clock: Arc<dyn TimeSource>,
}

impl TrafficAggregator {
    pub fn new(config: AggregatorConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            windows: DashMap::new(),
            endpoint_counts: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    fn is_full(&self, project_id: &ProjectId) -> bool {
        self.endpoint_counts
            .get(project_id)
            .is_some_and(|count| *count >= self.config.max_endpoints_per_project)
    }

    /// The window key a request to `key` is accounted under.
    fn resolve_key(&self, key: EndpointKey) -> EndpointKey {
        if key.endpoint == OVERFLOW_ENDPOINT
            || self.windows.contains_key(&key)
            || !self.is_full(&key.project_id)
        {
            key
        } else {
            EndpointKey::new(key.project_id, OVERFLOW_ENDPOINT)
        }
    }

    fn window(&self, key: EndpointKey, first_millis: i64) -> Arc<Mutex<EndpointWindow>> {
        if let Some(window) = self.windows.get(&key) {
            return Arc::clone(window.value());
        }

        // counter entry held across the insert so the cap is exact
        let mut count = self
            .endpoint_counts
            .entry(key.project_id.clone())
            .or_insert(0);
        let key = if key.endpoint != OVERFLOW_ENDPOINT
            && *count >= self.config.max_endpoints_per_project
            && !self.windows.contains_key(&key)
        {
            EndpointKey::new(key.project_id, OVERFLOW_ENDPOINT)
        } else {
            key
        };

        let window = self.windows.entry(key.clone()).or_insert_with(|| {
            if key.endpoint == OVERFLOW_ENDPOINT {
                warn!(project_id = %key.project_id, "Endpoint cap reached, folding new paths into overflow window");
            } else {
                *count += 1;
                debug!(project_id = %key.project_id, endpoint = %key.endpoint, "New endpoint window");
            }
            Arc::new(Mutex::new(EndpointWindow::new(first_millis)))
        });
        Arc::clone(window.value())
    }

    /// Fold one request outcome into its endpoint window.
    ///
    /// `at_millis` is the request's arrival time. Records older than the
    /// retention horizon are dropped; records further in the future than
    /// the allowed clock skew are clamped to now. Returns whether the record
    /// was kept.
    pub fn record(
        &self,
        project_id: &ProjectId,
        endpoint: &str,
        outcome: Outcome,
        risk_score: f64,
        at_millis: i64,
    ) -> bool {
        let now = self.clock.now_millis();
        let skew = self.config.max_clock_skew.as_millis() as i64;
        let at_millis = if at_millis > now + skew { now } else { at_millis };

        // the oldest baseline day still needs its neighbourhood
        let horizon_minute = now.div_euclid(MILLIS_PER_MINUTE)
            - self.config.retention_minutes()
            - BASELINE_NEIGHBOURHOOD;
        if at_millis.div_euclid(MILLIS_PER_MINUTE) < horizon_minute {
            trace!(project_id = %project_id, endpoint, "Dropping record past retention");
            return false;
        }

        let key = EndpointKey::new(project_id.clone(), endpoint);
        let window = self.window(key, at_millis);
        window
            .lock()
            .record(at_millis, now, outcome, risk_score, horizon_minute);
        true
    }

    /// What the scorer sees of an endpoint right now.
    pub fn snapshot(&self, key: &EndpointKey, burst_secs: u32) -> WindowSnapshot {
        let now = self.clock.now_millis();
        let now_second = now.div_euclid(1000);

        let key = self.resolve_key(key.clone());
        let Some(window) = self.windows.get(&key).map(|w| Arc::clone(w.value())) else {
            return WindowSnapshot {
                current_rpm: 0,
                baseline: None,
                recent_seconds: vec![0; burst_secs.clamp(1, 60) as usize],
            };
        };

        let window = window.lock();
        WindowSnapshot {
            current_rpm: window.current_rpm(now_second),
            baseline: window.baseline(
                now.div_euclid(MILLIS_PER_MINUTE),
                self.config.retention_minutes(),
            ),
            recent_seconds: window.recent_seconds(now_second, burst_secs as usize),
        }
    }

    /// Stats for every endpoint of a project over the trailing range.
    pub fn endpoint_stats(&self, project_id: &ProjectId, range_minutes: i64) -> Vec<EndpointStats> {
        let now = self.clock.now_millis();
        let now_minute = now.div_euclid(MILLIS_PER_MINUTE);
        let now_second = now.div_euclid(1000);
        let range_minutes = range_minutes.clamp(1, self.config.retention_minutes());

        let windows: Vec<(String, Arc<Mutex<EndpointWindow>>)> = self
            .windows
            .iter()
            .filter(|entry| &entry.key().project_id == project_id)
            .map(|entry| (entry.key().endpoint.clone(), Arc::clone(entry.value())))
            .collect();

        windows
            .into_iter()
            .map(|(endpoint, window)| {
                let window = window.lock();
                EndpointStats {
                    endpoint,
                    current_rpm: window.current_rpm(now_second),
                    baseline: window.baseline(now_minute, self.config.retention_minutes()),
                    range: window.range_stats(now_minute, range_minutes),
                }
            })
            .collect()
    }

    /// Drop windows with no traffic inside the retention horizon.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let horizon = now - self.config.retention.as_millis() as i64;
        let mut purged: Vec<EndpointKey> = Vec::new();
        self.windows.retain(|key, window| {
            let keep = window.lock().last_seen_millis >= horizon;
            if !keep {
                purged.push(key.clone());
            }
            keep
        });

        for key in purged.iter().filter(|k| k.endpoint != OVERFLOW_ENDPOINT) {
            if let Some(mut count) = self.endpoint_counts.get_mut(&key.project_id) {
                *count = count.saturating_sub(1);
            }
        }
        self.endpoint_counts.retain(|_, count| *count > 0);

        let removed = purged.len();
        if removed > 0 {
            debug!(removed, "Purged idle endpoint windows");
        }
        removed
    }

    /// Number of tracked endpoint windows
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
