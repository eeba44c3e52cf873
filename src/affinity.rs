use crate::classify::RouteCapability;
use crate::config::AffinityConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Hard cap on live entries; on overflow the least-recently-accessed entry
/// is evicted so the store stays bounded even under session-id churn.
const STORE_CAPACITY: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityKey {
    pub key_id: String,
    pub capability: RouteCapability,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct AffinityEntry {
    pub upstream_id: String,
    /// Body length of the most recent request on this session.
    pub content_length: u64,
    /// Input tokens accumulated across successfully delivered responses.
    pub cumulative_input_tokens: u64,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
}

/// Sticky-session store: `(key, capability, session)` → upstream.
///
/// Backed by a `DashMap`, which shards by key hash internally — one
/// session's lock traffic never serializes unrelated keys, and the
/// janitor's `retain` sweep locks one shard at a time. Entries live in
/// memory only; expiry is a sliding TTL refreshed on get plus an absolute
/// TTL from creation.
pub struct AffinityStore {
    entries: DashMap<AffinityKey, AffinityEntry>,
    sliding_ttl: Duration,
    absolute_ttl: Duration,
}

impl AffinityStore {
    pub fn new(config: &AffinityConfig) -> Self {
        Self {
            entries: DashMap::new(),
            sliding_ttl: Duration::from_secs(config.sliding_ttl_secs),
            absolute_ttl: Duration::from_secs(config.absolute_ttl_secs),
        }
    }

    fn expired(&self, entry: &AffinityEntry, now: Instant) -> bool {
        now.duration_since(entry.last_accessed_at) >= self.sliding_ttl
            || now.duration_since(entry.created_at) >= self.absolute_ttl
    }

    /// Look up a live entry, refreshing its sliding TTL. Expired entries are
    /// removed on the way out.
    pub fn get(&self, key: &AffinityKey) -> Option<AffinityEntry> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !self.expired(&entry, now) {
                entry.last_accessed_at = now;
                return Some(entry.clone());
            }
        }
        // Expired (or never present). The guard above is released before
        // this removal; the predicate re-check keeps a concurrent refresh
        // from being swept away.
        self.entries.remove_if(key, |_, entry| self.expired(entry, now));
        None
    }

    /// Record a successfully served request: bind (or re-bind, after a
    /// migration) the session to `upstream_id`, remember the request length,
    /// and add the delivered input tokens. `created_at` and the token total
    /// survive re-binding.
    pub fn record_success(
        &self,
        key: AffinityKey,
        upstream_id: &str,
        content_length: u64,
        input_tokens_delta: u64,
    ) {
        let now = Instant::now();

        // A dead entry's token history must not leak into a new session
        // window under the same key.
        self.entries.remove_if(&key, |_, entry| self.expired(entry, now));

        // Capacity check happens before taking the entry's shard lock —
        // scanning the map while holding it would self-deadlock.
        if !self.entries.contains_key(&key) && self.entries.len() >= STORE_CAPACITY {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|e| e.value().last_accessed_at)
                .map(|e| e.key().clone())
            {
                self.entries.remove(&oldest);
                metrics::counter!("gateway_affinity_evictions_total").increment(1);
            }
        }

        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.upstream_id = upstream_id.to_string();
                entry.content_length = content_length;
                entry.cumulative_input_tokens = entry
                    .cumulative_input_tokens
                    .saturating_add(input_tokens_delta);
                entry.last_accessed_at = now;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(AffinityEntry {
                    upstream_id: upstream_id.to_string(),
                    content_length,
                    cumulative_input_tokens: input_tokens_delta,
                    created_at: now,
                    last_accessed_at: now,
                });
            }
        }
    }

    /// One full sweep. `retain` takes the map's internal shard locks one at
    /// a time, so the janitor never stalls the request path globally.
    /// Returns the evicted count.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.expired(entry, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the periodic janitor. Stops when `shutdown` is cancelled.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => return,
                }
                let evicted = store.sweep();
                if evicted > 0 {
                    tracing::debug!("affinity: janitor evicted {} entries", evicted);
                }
                metrics::gauge!("gateway_affinity_entries").set(store.len() as f64);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(sliding_secs: u64, absolute_secs: u64) -> AffinityStore {
        AffinityStore::new(&AffinityConfig {
            sliding_ttl_secs: sliding_secs,
            absolute_ttl_secs: absolute_secs,
            janitor_interval_secs: 60,
        })
    }

    fn key(session: &str) -> AffinityKey {
        AffinityKey {
            key_id: "k1".into(),
            capability: RouteCapability::AnthropicMessages,
            session_id: session.into(),
        }
    }

    #[test]
    fn test_set_get_round_trip() {
        let s = store(300, 1800);
        s.record_success(key("s1"), "u2", 1024, 150);
        let e = s.get(&key("s1")).unwrap();
        assert_eq!(e.upstream_id, "u2");
        assert_eq!(e.content_length, 1024);
        assert_eq!(e.cumulative_input_tokens, 150);
    }

    #[test]
    fn test_tokens_accumulate_across_requests() {
        let s = store(300, 1800);
        s.record_success(key("s1"), "u2", 100, 150);
        s.record_success(key("s1"), "u2", 200, 50);
        let e = s.get(&key("s1")).unwrap();
        assert_eq!(e.cumulative_input_tokens, 200);
        assert_eq!(e.content_length, 200);
    }

    #[test]
    fn test_rebind_preserves_tokens() {
        // Migration rewrites the upstream but keeps the session's history.
        let s = store(300, 1800);
        s.record_success(key("s1"), "u2", 100, 1200);
        s.record_success(key("s1"), "u1", 120, 300);
        let e = s.get(&key("s1")).unwrap();
        assert_eq!(e.upstream_id, "u1");
        assert_eq!(e.cumulative_input_tokens, 1500);
    }

    #[test]
    fn test_sliding_expiry() {
        let s = store(0, 1800);
        s.record_success(key("s1"), "u2", 100, 10);
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.get(&key("s1")).is_none());
    }

    #[test]
    fn test_absolute_expiry_not_refreshed_by_get() {
        let s = store(300, 0);
        s.record_success(key("s1"), "u2", 100, 10);
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.get(&key("s1")).is_none());
    }

    #[test]
    fn test_expired_entry_does_not_leak_tokens_into_rebind() {
        let s = store(0, 1800);
        s.record_success(key("s1"), "u2", 100, 5000);
        std::thread::sleep(Duration::from_millis(5));
        // The old entry is dead; the new binding starts its history fresh.
        s.record_success(key("s1"), "u1", 50, 10);
        let e = s.get(&key("s1")).unwrap();
        assert_eq!(e.upstream_id, "u1");
        assert_eq!(e.cumulative_input_tokens, 10);
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let s = store(0, 1800);
        s.record_success(key("s1"), "u1", 1, 1);
        s.record_success(key("s2"), "u1", 1, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(s.sweep(), 2);
        assert!(s.is_empty());
    }

    #[test]
    fn test_keys_are_isolated() {
        let s = store(300, 1800);
        s.record_success(key("s1"), "u1", 1, 1);
        let mut other = key("s1");
        other.key_id = "k2".into();
        assert!(s.get(&other).is_none());
        let mut other_cap = key("s1");
        other_cap.capability = RouteCapability::OpenaiChatCompatible;
        assert!(s.get(&other_cap).is_none());
    }
}
