//! Decaying client reputation.
//!
//! Every mitigation a client earns adds weight (throttle 0.5, block 1.0) that
//! decays exponentially with a five minute half-life. The reputation signal
//! is the decayed weight scaled into [0, 1].

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::domain::mitigation::DecisionKind;
use crate::ports::TimeSource;

const HALF_LIFE_MILLIS: f64 = 5.0 * 60.0 * 1000.0;
const THROTTLE_WEIGHT: f64 = 0.5;
const BLOCK_WEIGHT: f64 = 1.0;
/// Decayed weight that maps to a reputation of 1.0
const SATURATION: f64 = 20.0;
/// Entries below this weight are forgotten on cleanup
const FORGET_BELOW: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct Entry {
    weight: f64,
    updated_millis: i64,
}

impl Entry {
    fn decayed(&self, now_millis: i64) -> f64 {
        let elapsed = (now_millis - self.updated_millis).max(0) as f64;
        self.weight * 0.5f64.powf(elapsed / HALF_LIFE_MILLIS)
    }
}

pub struct ReputationBook {
    entries: DashMap<IpAddr, Entry>,
    clock: Arc<dyn TimeSource>,
}

impl ReputationBook {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// 0.0 for unknown or long-quiet clients
    pub fn score(&self, ip: IpAddr) -> f64 {
        let now = self.clock.now_millis();
        self.entries
            .get(&ip)
            .map_or(0.0, |e| (e.decayed(now) / SATURATION).clamp(0.0, 1.0))
    }

    pub fn record(&self, ip: IpAddr, decision: DecisionKind) {
        let added = match decision {
            DecisionKind::Allow => return,
            DecisionKind::Throttle => THROTTLE_WEIGHT,
            DecisionKind::Block => BLOCK_WEIGHT,
        };
        let now = self.clock.now_millis();
        let mut entry = self.entries.entry(ip).or_insert(Entry {
            weight: 0.0,
            updated_millis: now,
        });
        entry.weight = entry.decayed(now) + added;
        entry.updated_millis = now;
    }

    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.decayed(now) >= FORGET_BELOW);
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}
