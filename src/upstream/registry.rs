use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Weight of the newest sample in the latency moving average.
const EWMA_ALPHA: f64 = 0.2;

/// Circuit state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-upstream granularity — each upstream id gets its own breaker plus
/// health bookkeeping, so one failing provider is isolated without touching
/// the rest of the candidate pool.
pub struct HealthRegistry {
    entries: DashMap<String, Arc<UpstreamHealth>>,
}

struct UpstreamHealth {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    healthy: AtomicBool,
    /// Consecutive failure count while Closed. Mutated only inside
    /// `apply_outcome` — the single transition entry point.
    consecutive_failures: AtomicU32,
    /// Probes currently in flight while HalfOpen.
    half_open_in_flight: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    ewma: Mutex<LatencyEwma>,
    quota_exceeded: AtomicBool,
    /// Informational outstanding-request counter; becomes a hard cap only
    /// when the breaker config sets `max_concurrent`.
    in_flight: AtomicUsize,
}

#[derive(Default)]
struct LatencyEwma {
    value_ms: f64,
    primed: bool,
}

impl LatencyEwma {
    fn observe(&mut self, latency_ms: f64) {
        if self.primed {
            self.value_ms = EWMA_ALPHA * latency_ms + (1.0 - EWMA_ALPHA) * self.value_ms;
        } else {
            self.value_ms = latency_ms;
            self.primed = true;
        }
    }

    fn reset(&mut self) {
        self.primed = false;
        self.value_ms = 0.0;
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of checking the breaker before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker closed — proceed normally.
    Allowed,
    /// Breaker half-open — this attempt is a probe.
    Probe,
    /// Breaker open (or concurrency cap hit) — reject immediately.
    Rejected,
}

/// Read-only view for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealthView {
    pub upstream_id: String,
    pub is_healthy: bool,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub latency_ewma_ms: Option<f64>,
    pub quota_exceeded: bool,
    pub in_flight: usize,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether an attempt against `upstream_id` is allowed right now.
    /// A `Probe` result reserves one half-open slot; the caller must report
    /// the outcome via `mark_healthy` / `mark_unhealthy`.
    pub fn check(&self, upstream_id: &str, config: &CircuitBreakerConfig) -> BreakerCheck {
        let entry = self.get_or_create(upstream_id);

        if let Some(max) = config.max_concurrent {
            if entry.in_flight.load(Ordering::Relaxed) >= max {
                return BreakerCheck::Rejected;
            }
        }

        match entry.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = entry.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_millis(config.open_duration_ms) {
                        drop(opened_at);
                        // CAS so only one caller flips to HalfOpen and takes
                        // the first probe slot.
                        if entry
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            entry.half_open_in_flight.store(1, Ordering::Release);
                            return BreakerCheck::Probe;
                        }
                        return self.half_open_probe(&entry, config);
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => self.half_open_probe(&entry, config),
            _ => BreakerCheck::Allowed,
        }
    }

    fn half_open_probe(
        &self,
        entry: &Arc<UpstreamHealth>,
        config: &CircuitBreakerConfig,
    ) -> BreakerCheck {
        let mut current = entry.half_open_in_flight.load(Ordering::Acquire);
        loop {
            if current >= config.half_open_probes {
                return BreakerCheck::Rejected;
            }
            match entry.half_open_in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return BreakerCheck::Probe,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record a successful attempt. The only success-side write entry point.
    pub fn mark_healthy(&self, upstream_id: &str, latency_ms: u64) {
        let entry = self.get_or_create(upstream_id);
        entry.healthy.store(true, Ordering::Release);

        match entry.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                entry.consecutive_failures.store(0, Ordering::Relaxed);
                entry.ewma.lock().unwrap().observe(latency_ms as f64);
            }
            STATE_HALF_OPEN => {
                // First probe success closes the circuit and restarts the
                // latency average from scratch.
                entry.state.store(STATE_CLOSED, Ordering::Release);
                entry.consecutive_failures.store(0, Ordering::Relaxed);
                entry.half_open_in_flight.store(0, Ordering::Release);
                let mut ewma = entry.ewma.lock().unwrap();
                ewma.reset();
                ewma.observe(latency_ms as f64);
                tracing::info!(
                    "circuit: closed after successful probe, upstream={}",
                    upstream_id
                );
            }
            _ => {}
        }
    }

    /// Record a failed attempt. The only failure-side write entry point.
    pub fn mark_unhealthy(&self, upstream_id: &str, config: &CircuitBreakerConfig, reason: &str) {
        let entry = self.get_or_create(upstream_id);

        match entry.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let count = entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= config.failure_threshold {
                    entry.state.store(STATE_OPEN, Ordering::Release);
                    *entry.opened_at.lock().unwrap() = Some(Instant::now());
                    entry.healthy.store(false, Ordering::Release);
                    tracing::warn!(
                        "circuit: opened, upstream={}, consecutive_failures={}, reason={}",
                        upstream_id,
                        count,
                        reason
                    );
                }
            }
            STATE_HALF_OPEN => {
                entry.state.store(STATE_OPEN, Ordering::Release);
                *entry.opened_at.lock().unwrap() = Some(Instant::now());
                entry.half_open_in_flight.store(0, Ordering::Release);
                entry.healthy.store(false, Ordering::Release);
                tracing::warn!(
                    "circuit: re-opened after failed probe, upstream={}, reason={}",
                    upstream_id,
                    reason
                );
            }
            _ => {}
        }
    }

    /// True while the breaker is Open and the open window has not elapsed.
    /// Used by candidate filtering; an elapsed window reads as closed so the
    /// upstream re-enters the pool as a probe.
    pub fn is_open(&self, upstream_id: &str, config: &CircuitBreakerConfig) -> bool {
        let Some(entry) = self.entries.get(upstream_id) else {
            return false;
        };
        if entry.state.load(Ordering::Acquire) != STATE_OPEN {
            return false;
        }
        let opened_at = entry.opened_at.lock().unwrap();
        match *opened_at {
            Some(at) => at.elapsed() < Duration::from_millis(config.open_duration_ms),
            None => false,
        }
    }

    pub fn circuit_state(&self, upstream_id: &str) -> CircuitState {
        match self
            .entries
            .get(upstream_id)
            .map(|e| e.state.load(Ordering::Acquire))
            .unwrap_or(STATE_CLOSED)
        {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn latency_ewma_ms(&self, upstream_id: &str) -> Option<f64> {
        let entry = self.entries.get(upstream_id)?;
        let ewma = entry.ewma.lock().unwrap();
        ewma.primed.then_some(ewma.value_ms)
    }

    // ---- Quota flag ----

    pub fn set_quota_exceeded(&self, upstream_id: &str, exceeded: bool) {
        self.get_or_create(upstream_id)
            .quota_exceeded
            .store(exceeded, Ordering::Release);
    }

    pub fn quota_exceeded(&self, upstream_id: &str) -> bool {
        self.entries
            .get(upstream_id)
            .map(|e| e.quota_exceeded.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    // ---- Outstanding-request accounting ----

    pub fn record_connection(&self, upstream_id: &str) {
        self.get_or_create(upstream_id)
            .in_flight
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_connection(&self, upstream_id: &str) {
        if let Some(entry) = self.entries.get(upstream_id) {
            entry.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // ---- Housekeeping / diagnostics ----

    /// Drop entries for upstreams no longer in the active set, so hot
    /// reloads cannot grow the map without bound.
    pub fn retain(&self, active_ids: &std::collections::HashSet<String>) {
        self.entries.retain(|k, _| active_ids.contains(k));
    }

    pub fn snapshot(&self) -> Vec<UpstreamHealthView> {
        let mut views: Vec<UpstreamHealthView> = self
            .entries
            .iter()
            .map(|e| {
                let h = e.value();
                UpstreamHealthView {
                    upstream_id: e.key().clone(),
                    is_healthy: h.healthy.load(Ordering::Acquire),
                    circuit_state: match h.state.load(Ordering::Acquire) {
                        STATE_OPEN => CircuitState::Open,
                        STATE_HALF_OPEN => CircuitState::HalfOpen,
                        _ => CircuitState::Closed,
                    },
                    consecutive_failures: h.consecutive_failures.load(Ordering::Relaxed),
                    latency_ewma_ms: {
                        let ewma = h.ewma.lock().unwrap();
                        ewma.primed.then_some(ewma.value_ms)
                    },
                    quota_exceeded: h.quota_exceeded.load(Ordering::Acquire),
                    in_flight: h.in_flight.load(Ordering::Relaxed),
                }
            })
            .collect();
        views.sort_by(|a, b| a.upstream_id.cmp(&b.upstream_id));
        views
    }

    fn get_or_create(&self, upstream_id: &str) -> Arc<UpstreamHealth> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.entries.get(upstream_id) {
            return entry.value().clone();
        }
        self.entries
            .entry(upstream_id.to_string())
            .or_insert_with(|| {
                Arc::new(UpstreamHealth {
                    state: AtomicU8::new(STATE_CLOSED),
                    healthy: AtomicBool::new(true),
                    consecutive_failures: AtomicU32::new(0),
                    half_open_in_flight: AtomicU32::new(0),
                    opened_at: Mutex::new(None),
                    ewma: Mutex::new(LatencyEwma::default()),
                    quota_exceeded: AtomicBool::new(false),
                    in_flight: AtomicUsize::new(0),
                })
            })
            .clone()
    }
}
