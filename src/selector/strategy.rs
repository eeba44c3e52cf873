use crate::config::UpstreamConfig;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Load-balancing strategy applied within one priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Weighted,
    RoundRobin,
    Priority,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Weighted => "weighted",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Priority => "priority",
        }
    }
}

/// Per-group atomic counters backing round-robin selection. Groups are
/// capability tags; counters survive across requests and control-plane
/// reloads.
#[derive(Default)]
pub struct RoundRobinCounters {
    counters: DashMap<String, AtomicU64>,
}

impl RoundRobinCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, group: &str) -> u64 {
        if let Some(counter) = self.counters.get(group) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(group.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Weighted pick over prefix sums: the draw lands in the first slot whose
/// cumulative weight exceeds it. Pure so tests can pin the draw.
pub fn weighted_index(weights: &[u32], draw: u64) -> usize {
    let mut cumulative: u64 = 0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += (*w).max(1) as u64;
        if draw < cumulative {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}

pub fn total_weight(candidates: &[Arc<UpstreamConfig>]) -> u64 {
    candidates.iter().map(|u| u.weight.max(1) as u64).sum()
}

/// Pick the primary inside a tier. The candidates slice must be non-empty.
pub fn pick(
    strategy: SelectionStrategy,
    candidates: &[Arc<UpstreamConfig>],
    counters: &RoundRobinCounters,
    group: &str,
) -> usize {
    debug_assert!(!candidates.is_empty());
    if candidates.len() == 1 {
        return 0;
    }

    let weights: Vec<u32> = candidates.iter().map(|u| u.weight).collect();
    match strategy {
        SelectionStrategy::Weighted => {
            let total = total_weight(candidates);
            let draw = rand::thread_rng().gen_range(0..total);
            weighted_index(&weights, draw)
        }
        SelectionStrategy::RoundRobin => {
            let total = total_weight(candidates);
            let draw = counters.next(group) % total;
            weighted_index(&weights, draw)
        }
        SelectionStrategy::Priority => {
            // Tiering already happened; break ties deterministically on id.
            candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.id.cmp(&b.id))
                .map(|(i, _)| i)
                .unwrap_or(0)
        }
    }
}
