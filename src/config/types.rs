use crate::classify::RouteCapability;
use crate::selector::SelectionStrategy;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration (infrastructure knobs only).
///
/// Business data — upstreams, API keys, compensation rules, prices — comes
/// from the control plane (`ControlFile` or a database behind the same
/// trait), never from this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path prefix the proxy surface is mounted under.
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    #[serde(default)]
    pub control: ControlSourceConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub affinity: AffinityConfig,

    #[serde(default)]
    pub ssrf: SsrfConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub log_sink: LogSinkConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    #[serde(default)]
    pub keepalive_pool: KeepalivePoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_prefix: default_proxy_prefix(),
            control: ControlSourceConfig::default(),
            limits: LimitsConfig::default(),
            affinity: AffinityConfig::default(),
            ssrf: SsrfConfig::default(),
            routing: RoutingConfig::default(),
            log_sink: LogSinkConfig::default(),
            quota: QuotaConfig::default(),
            keepalive_pool: KeepalivePoolConfig::default(),
        }
    }
}

fn default_proxy_prefix() -> String {
    "/proxy".to_string()
}

/// Where the control-plane snapshot is loaded from and how often it is
/// refreshed. The refresh interval bounds snapshot staleness; admin-plane
/// invalidation signals trigger an immediate reload on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSourceConfig {
    #[serde(default = "default_control_file")]
    pub file: String,

    #[serde(default = "default_control_refresh")]
    pub refresh_secs: u64,
}

impl Default for ControlSourceConfig {
    fn default() -> Self {
        Self {
            file: default_control_file(),
            refresh_secs: default_control_refresh(),
        }
    }
}

fn default_control_file() -> String {
    "control.toml".to_string()
}

fn default_control_refresh() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on the buffered inbound body. Requests beyond it are rejected
    /// with 413 before any upstream is chosen.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Failover attempts per request, including the primary.
    #[serde(default = "default_max_failover_attempts")]
    pub max_failover_attempts: usize,

    /// Slack added on top of the largest per-upstream timeout to bound the
    /// whole failover loop.
    #[serde(default = "default_deadline_slack")]
    pub failover_deadline_slack_secs: u64,

    /// Recorder-side cap on captured stream bytes. The client relay itself
    /// is unbounded.
    #[serde(default = "default_recording_cap")]
    pub recording_cap_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            max_failover_attempts: default_max_failover_attempts(),
            failover_deadline_slack_secs: default_deadline_slack(),
            recording_cap_bytes: default_recording_cap(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_failover_attempts() -> usize {
    3
}

fn default_deadline_slack() -> u64 {
    5
}

fn default_recording_cap() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Sliding TTL, refreshed on every hit.
    #[serde(default = "default_sliding_ttl")]
    pub sliding_ttl_secs: u64,

    /// Absolute TTL from entry creation, never refreshed.
    #[serde(default = "default_absolute_ttl")]
    pub absolute_ttl_secs: u64,

    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            sliding_ttl_secs: default_sliding_ttl(),
            absolute_ttl_secs: default_absolute_ttl(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

fn default_sliding_ttl() -> u64 {
    300
}

fn default_absolute_ttl() -> u64 {
    1800
}

fn default_janitor_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SsrfConfig {
    /// Permit upstreams on loopback / RFC1918 / link-local addresses.
    /// For development and integration tests only.
    #[serde(default)]
    pub allow_private_networks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Load-balancing strategy applied within a priority tier.
    #[serde(default)]
    pub default_strategy: SelectionStrategy,

    /// Per-capability strategy overrides, keyed by the capability tag.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub strategy_overrides: HashMap<String, SelectionStrategy>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: SelectionStrategy::default(),
            strategy_overrides: HashMap::new(),
        }
    }
}

impl RoutingConfig {
    pub fn strategy_for(&self, capability: RouteCapability) -> SelectionStrategy {
        self.strategy_overrides
            .get(capability.as_str())
            .copied()
            .unwrap_or(self.default_strategy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkConfig {
    #[serde(default = "default_sink_capacity")]
    pub capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            capacity: default_sink_capacity(),
        }
    }
}

fn default_sink_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// How long one quota-probe result is reused across candidate selections.
    #[serde(default = "default_quota_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_quota_ttl(),
        }
    }
}

fn default_quota_ttl() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePoolConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub size: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for KeepalivePoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    320
}

fn default_connect_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Control-plane entities — rows owned by the admin plane, read here as
// snapshots. The file-backed control plane deserializes a `ControlFile`;
// a database-backed one materializes the same structs.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlFile {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub api_keys: Vec<ApiKeyConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub compensation_rules: Vec<CompensationRuleConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub prices: Vec<ModelPriceConfig>,
}

/// A configured LLM provider endpoint the gateway can forward to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,

    pub name: String,

    /// Origin plus optional path prefix, e.g. `https://api.example.com/v1`.
    pub base_url: String,

    /// Route capabilities this upstream can serve.
    pub capabilities: Vec<RouteCapability>,

    /// Provider family tag, informational (e.g. "openai", "anthropic").
    #[serde(default = "default_provider_type")]
    pub provider_type: String,

    /// Lower value = preferred tier. Tier-0 is tried first; higher tiers are
    /// failover reserves.
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_upstream_weight")]
    pub weight: u32,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Whitelist of servable models. `None` means all. Entries may contain
    /// `*` wildcards.
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,

    /// Outbound `model` field rewrites, applied after candidate selection.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub model_redirects: HashMap<String, String>,

    /// Provider API key ciphertext; decrypted by the credential vault just
    /// before header injection.
    pub credential: String,

    /// Total per-attempt deadline.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,

    /// USD spend caps; reaching either excludes the upstream until the
    /// window rolls over.
    #[serde(default)]
    pub daily_spending_limit: Option<f64>,

    #[serde(default)]
    pub monthly_spending_limit: Option<f64>,

    #[serde(default = "default_multiplier")]
    pub billing_input_multiplier: f64,

    #[serde(default = "default_multiplier")]
    pub billing_output_multiplier: f64,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    #[serde(default)]
    pub affinity_migration: Option<AffinityMigrationConfig>,
}

fn default_provider_type() -> String {
    "custom".to_string()
}

fn default_upstream_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,

    /// When set, attempts beyond this in-flight count are rejected with a
    /// `circuit_open` reason.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_probes: default_half_open_probes(),
            max_concurrent: None,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_probes() -> u32 {
    1
}

/// Controls whether a session stuck to a lower-tier upstream may be moved
/// back to a preferred tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityMigrationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub metric: MigrationMetric,

    pub threshold: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMetric {
    /// Migrate while the session's accumulated input tokens stay below the
    /// threshold. A count of 0 always permits migration.
    #[default]
    Tokens,
    /// Migrate while the current request body stays below the threshold.
    Length,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// sha256 hex of the full secret.
    pub key_hash: String,

    /// First characters of the secret, shown in logs instead of the secret.
    pub key_prefix: String,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<time::OffsetDateTime>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<time::OffsetDateTime>,

    /// The authorized upstream set — the only source of routing authority.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstream_ids: Vec<String>,
}

/// Header rewrite applied outbound so upstream-required headers are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRuleConfig {
    pub id: String,

    /// Capabilities the rule applies to. Empty means all.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub capabilities: Vec<RouteCapability>,

    /// Inbound header names probed in order; the first non-empty value wins.
    pub sources: Vec<String>,

    pub target_header: String,

    #[serde(default)]
    pub mode: CompensationMode,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Built-in rules are non-editable except for `enabled`.
    #[serde(default)]
    pub builtin: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationMode {
    /// Only set the target when the inbound request lacks it.
    #[default]
    MissingOnly,
    /// Always overwrite the target.
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriceConfig {
    pub model: String,

    /// USD per million prompt tokens.
    pub input_per_million: f64,

    /// USD per million completion tokens.
    pub output_per_million: f64,

    #[serde(default)]
    pub cache_read_per_million: f64,

    #[serde(default)]
    pub cache_write_per_million: f64,

    #[serde(default)]
    pub source: PriceSource,
}

/// Price resolution order: `manual_override` always wins over
/// `synced_catalog`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    ManualOverride,
    #[default]
    SyncedCatalog,
}
