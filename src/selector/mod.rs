pub mod strategy;

pub use strategy::{RoundRobinCounters, SelectionStrategy};

use crate::affinity::{AffinityKey, AffinityStore};
use crate::auth::VerifiedKey;
use crate::classify::{RouteClass, RouteMatchSource, SessionRef};
use crate::config::{CircuitBreakerConfig, RoutingConfig, UpstreamConfig};
use crate::upstream::HealthRegistry;
use http::HeaderMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Why an upstream was removed from the candidate pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    NotAuthorized,
    CapabilityMismatch,
    ModelNotAllowed,
    Inactive,
    CircuitOpen,
    QuotaExceeded,
    OverrideMismatch,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusionReason::NotAuthorized => "not_authorized",
            ExclusionReason::CapabilityMismatch => "capability_mismatch",
            ExclusionReason::ModelNotAllowed => "model_not_allowed",
            ExclusionReason::Inactive => "inactive",
            ExclusionReason::CircuitOpen => "circuit_open",
            ExclusionReason::QuotaExceeded => "quota_exceeded",
            ExclusionReason::OverrideMismatch => "override_mismatch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExcludedUpstream {
    pub id: String,
    pub name: String,
    pub reason: ExclusionReason,
}

/// How the route reached its candidate pool, for the decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingType {
    ProviderType,
    PathCapability,
    Tiered,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionFailureKind {
    /// No upstream in the control plane serves the capability at all.
    NoUpstreamsConfigured,
    /// The key's authorized set intersected with the capability is empty.
    NoAuthorizedUpstreams,
    /// `X-Upstream-Name` / `X-Upstream-Group` named something unusable.
    PinIncompatible,
    /// Candidates existed but every one was filtered out.
    NoCandidates,
}

#[derive(Debug)]
pub struct SelectionFailure {
    pub kind: SelectionFailureKind,
    pub detail: String,
    pub excluded: Vec<ExcludedUpstream>,
}

/// Selector output: the ordered attempt list plus everything the decision
/// record needs to explain it.
#[derive(Debug)]
pub struct Selection {
    /// Primary first, then the rest of tier-0, then higher-tier reserves in
    /// ascending priority order. Capped at `max_failover_attempts`.
    pub candidates: Vec<Arc<UpstreamConfig>>,
    pub excluded: Vec<ExcludedUpstream>,
    pub strategy: SelectionStrategy,
    pub routing_type: RoutingType,
    pub pinned: bool,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub session_id: Option<String>,
    /// Pool size after authorization ∩ capability.
    pub candidate_count: usize,
    /// Ordered list length after filtering, tiering, and capping.
    pub final_candidate_count: usize,
}

pub struct SelectionInput<'a> {
    pub key: &'a VerifiedKey,
    pub route: &'a RouteClass,
    pub headers: &'a HeaderMap,
    pub session: Option<&'a SessionRef>,
    /// Control-plane snapshot of all upstream rows (including inactive ones,
    /// so their exclusion can be recorded).
    pub upstreams: &'a [Arc<UpstreamConfig>],
    /// Upstream ids whose spend caps are currently reached.
    pub quota_exceeded: &'a HashSet<String>,
    pub body_len: u64,
}

pub const UPSTREAM_NAME_HEADER: &str = "x-upstream-name";
pub const UPSTREAM_GROUP_HEADER: &str = "x-upstream-group";

pub struct CandidateSelector {
    registry: Arc<HealthRegistry>,
    affinity: Arc<AffinityStore>,
    counters: RoundRobinCounters,
    routing: RoutingConfig,
    max_attempts: usize,
    default_breaker: CircuitBreakerConfig,
}

impl CandidateSelector {
    pub fn new(
        registry: Arc<HealthRegistry>,
        affinity: Arc<AffinityStore>,
        routing: RoutingConfig,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            affinity,
            counters: RoundRobinCounters::new(),
            routing,
            max_attempts: max_attempts.max(1),
            default_breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Build, filter, score, and order the candidate list for one request.
    pub fn select(&self, input: SelectionInput<'_>) -> Result<Selection, SelectionFailure> {
        let capability = input.route.capability;
        let mut excluded: Vec<ExcludedUpstream> = Vec::new();

        // Step 1: capability ∩ authorization.
        let serving: Vec<&Arc<UpstreamConfig>> = input
            .upstreams
            .iter()
            .filter(|u| u.capabilities.contains(&capability))
            .collect();
        if serving.is_empty() {
            return Err(SelectionFailure {
                kind: SelectionFailureKind::NoUpstreamsConfigured,
                detail: format!("no upstream serves capability {}", capability),
                excluded,
            });
        }

        let authorized_set: HashSet<&str> = input
            .key
            .authorized_upstream_ids
            .iter()
            .map(|s| s.as_str())
            .collect();
        let mut pool: Vec<Arc<UpstreamConfig>> = Vec::with_capacity(serving.len());
        for u in serving {
            if authorized_set.contains(u.id.as_str()) {
                pool.push(u.clone());
            } else {
                excluded.push(ExcludedUpstream {
                    id: u.id.clone(),
                    name: u.name.clone(),
                    reason: ExclusionReason::NotAuthorized,
                });
            }
        }
        if pool.is_empty() {
            return Err(SelectionFailure {
                kind: SelectionFailureKind::NoAuthorizedUpstreams,
                detail: format!("key {} has no authorized upstream for {}", input.key.key_id, capability),
                excluded,
            });
        }
        let candidate_count = pool.len();

        // Deprecated group override: accepted only as a capability selector.
        if let Some(group) = header_str(input.headers, UPSTREAM_GROUP_HEADER) {
            if crate::classify::RouteCapability::parse(group) != Some(capability) {
                for u in &pool {
                    excluded.push(ExcludedUpstream {
                        id: u.id.clone(),
                        name: u.name.clone(),
                        reason: ExclusionReason::OverrideMismatch,
                    });
                }
                return Err(SelectionFailure {
                    kind: SelectionFailureKind::PinIncompatible,
                    detail: format!("x-upstream-group '{}' does not match route capability {}", group, capability),
                    excluded,
                });
            }
        }

        // Step 2: explicit pin defeats affinity and load balancing. The
        // pinned upstream must still be active.
        if let Some(pin) = header_str(input.headers, UPSTREAM_NAME_HEADER) {
            return self.select_pinned(pin, pool, excluded, candidate_count, input);
        }

        // Step 3: model whitelist.
        if let Some(model) = input.route.model.as_deref() {
            pool = partition_excluding(pool, &mut excluded, ExclusionReason::ModelNotAllowed, |u| {
                match &u.allowed_models {
                    Some(patterns) => model_allowed(patterns, model),
                    None => true,
                }
            });
        }

        // Step 4: liveness — inactive rows, open circuits, exhausted quotas.
        pool = partition_excluding(pool, &mut excluded, ExclusionReason::Inactive, |u| {
            u.is_active
        });
        pool = partition_excluding(pool, &mut excluded, ExclusionReason::CircuitOpen, |u| {
            !self.registry.is_open(&u.id, self.breaker_for(u))
        });
        pool = partition_excluding(pool, &mut excluded, ExclusionReason::QuotaExceeded, |u| {
            !input.quota_exceeded.contains(&u.id)
        });

        if pool.is_empty() {
            return Err(SelectionFailure {
                kind: SelectionFailureKind::NoCandidates,
                detail: "all candidates excluded".to_string(),
                excluded,
            });
        }

        // Step 5: tiering — lowest priority value wins, the rest are held
        // back as failover reserves.
        pool.sort_by(|a, b| a.priority.cmp(&b.priority));
        let tiered = pool.len() > 1 && pool.first().map(|u| u.priority) != pool.last().map(|u| u.priority);
        let tier0_priority = pool[0].priority;
        let (tier0, reserves): (Vec<_>, Vec<_>) =
            pool.into_iter().partition(|u| u.priority == tier0_priority);

        let strategy = self.routing.strategy_for(capability);
        let group = capability.as_str();

        // Steps 6–7: affinity lookup, migration, then strategy pick.
        let mut affinity_hit = false;
        let mut affinity_migrated = false;
        let session_id = input.session.map(|s| s.id.clone());

        let primary: Arc<UpstreamConfig> = 'primary: {
            if let Some(session) = input.session {
                let key = AffinityKey {
                    key_id: input.key.key_id.clone(),
                    capability,
                    session_id: session.id.clone(),
                };
                if let Some(entry) = self.affinity.get(&key) {
                    if let Some(stuck) = tier0.iter().find(|u| u.id == entry.upstream_id) {
                        affinity_hit = true;
                        break 'primary stuck.clone();
                    }
                    if let Some(stuck) = reserves.iter().find(|u| u.id == entry.upstream_id) {
                        // The session is stuck to a lower tier than what is
                        // now available; the preferred upstream's migration
                        // policy decides whether to move it.
                        let best =
                            tier0[strategy::pick(strategy, &tier0, &self.counters, group)].clone();
                        affinity_hit = true;
                        if migration_permitted(&best, entry.cumulative_input_tokens, input.body_len)
                        {
                            affinity_migrated = true;
                            metrics::counter!(
                                "gateway_affinity_migrations_total",
                                "capability" => group,
                            )
                            .increment(1);
                            break 'primary best;
                        }
                        break 'primary stuck.clone();
                    }
                    // Entry points at an upstream that is no longer usable;
                    // fall through to a fresh pick. The entry is rewritten
                    // when the request succeeds.
                }
            }
            tier0[strategy::pick(strategy, &tier0, &self.counters, group)].clone()
        };

        if affinity_hit {
            metrics::counter!(
                "gateway_affinity_hits_total",
                "capability" => group,
            )
            .increment(1);
        }

        // Ordered attempt list: primary, rest of tier-0, reserves ascending.
        let mut candidates = Vec::with_capacity(self.max_attempts);
        candidates.push(primary.clone());
        for u in tier0.iter().chain(reserves.iter()) {
            if candidates.len() >= self.max_attempts {
                break;
            }
            if u.id != primary.id {
                candidates.push(u.clone());
            }
        }

        let routing_type = if tiered {
            RoutingType::Tiered
        } else if input.route.match_source == RouteMatchSource::ModelFallback {
            RoutingType::ProviderType
        } else {
            RoutingType::PathCapability
        };

        let final_candidate_count = candidates.len();
        Ok(Selection {
            candidates,
            excluded,
            strategy,
            routing_type,
            pinned: false,
            affinity_hit,
            affinity_migrated,
            session_id,
            candidate_count,
            final_candidate_count,
        })
    }

    fn select_pinned(
        &self,
        pin: &str,
        pool: Vec<Arc<UpstreamConfig>>,
        mut excluded: Vec<ExcludedUpstream>,
        candidate_count: usize,
        input: SelectionInput<'_>,
    ) -> Result<Selection, SelectionFailure> {
        let Some(target) = pool.iter().find(|u| u.name == pin || u.id == pin) else {
            for u in &pool {
                excluded.push(ExcludedUpstream {
                    id: u.id.clone(),
                    name: u.name.clone(),
                    reason: ExclusionReason::OverrideMismatch,
                });
            }
            return Err(SelectionFailure {
                kind: SelectionFailureKind::PinIncompatible,
                detail: format!("pinned upstream '{pin}' is not available to this key"),
                excluded,
            });
        };

        // The pin bypasses model/circuit/quota filtering but never the
        // active flag.
        if !target.is_active {
            excluded.push(ExcludedUpstream {
                id: target.id.clone(),
                name: target.name.clone(),
                reason: ExclusionReason::Inactive,
            });
            return Err(SelectionFailure {
                kind: SelectionFailureKind::PinIncompatible,
                detail: format!("pinned upstream '{pin}' is inactive"),
                excluded,
            });
        }

        metrics::counter!(
            "gateway_upstream_pin_total",
            "capability" => input.route.capability.as_str(),
        )
        .increment(1);

        Ok(Selection {
            candidates: vec![target.clone()],
            excluded,
            strategy: self.routing.strategy_for(input.route.capability),
            routing_type: RoutingType::None,
            pinned: true,
            affinity_hit: false,
            affinity_migrated: false,
            session_id: input.session.map(|s| s.id.clone()),
            candidate_count,
            final_candidate_count: 1,
        })
    }

    pub fn breaker_for<'a>(&'a self, upstream: &'a UpstreamConfig) -> &'a CircuitBreakerConfig {
        upstream.circuit_breaker.as_ref().unwrap_or(&self.default_breaker)
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn affinity(&self) -> &Arc<AffinityStore> {
        &self.affinity
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn partition_excluding(
    pool: Vec<Arc<UpstreamConfig>>,
    excluded: &mut Vec<ExcludedUpstream>,
    reason: ExclusionReason,
    keep: impl Fn(&UpstreamConfig) -> bool,
) -> Vec<Arc<UpstreamConfig>> {
    let mut kept = Vec::with_capacity(pool.len());
    for u in pool {
        if keep(&u) {
            kept.push(u);
        } else {
            excluded.push(ExcludedUpstream {
                id: u.id.clone(),
                name: u.name.clone(),
                reason,
            });
        }
    }
    kept
}

/// Whitelist entries are exact matches unless they carry a `*` wildcard.
fn model_allowed(patterns: &[String], model: &str) -> bool {
    for pattern in patterns {
        if pattern.contains('*') {
            if let Ok(glob) = globset::Glob::new(pattern) {
                if glob.compile_matcher().is_match(model) {
                    return true;
                }
            }
        } else if pattern == model {
            return true;
        }
    }
    false
}

/// Migration is allowed when the preferred upstream opts in and the
/// session is still below its threshold. A token count of 0 always
/// permits migration — the session's first request has nothing to lose.
fn migration_permitted(best: &UpstreamConfig, cumulative_tokens: u64, body_len: u64) -> bool {
    let Some(cfg) = &best.affinity_migration else {
        return false;
    };
    if !cfg.enabled {
        return false;
    }
    match cfg.metric {
        crate::config::MigrationMetric::Tokens => cumulative_tokens < cfg.threshold,
        crate::config::MigrationMetric::Length => body_len < cfg.threshold,
    }
}
