use crate::billing::SpendLedger;
use crate::classify::RouteCapability;
use crate::config::{
    ApiKeyConfig, CompensationMode, CompensationRuleConfig, ControlFile, ModelPriceConfig,
    UpstreamConfig,
};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Read interface the request path consumes. All methods return snapshots;
/// none may block on I/O — implementations refresh in the background and
/// swap an immutable snapshot pointer.
pub trait ControlPlane: Send + Sync {
    /// All upstream rows, including inactive ones (their exclusion is part
    /// of the routing decision record).
    fn list_upstreams(&self) -> Arc<Vec<Arc<UpstreamConfig>>>;

    fn get_api_key_by_hash(&self, hash: &str) -> Option<Arc<ApiKeyConfig>>;

    /// Enabled compensation rules, built-ins included.
    fn compensation_rules(&self) -> Arc<Vec<CompensationRuleConfig>>;

    /// Resolved price for a model: a manual override beats the synced
    /// catalog entry.
    fn resolve_model_price(&self, model: &str) -> Option<ModelPriceConfig>;

    /// Upstreams whose day-to-date or month-to-date billed spend has
    /// reached the configured cap.
    fn quota_exceeded_upstream_ids(&self, upstreams: &[Arc<UpstreamConfig>]) -> HashSet<String>;
}

struct Snapshot {
    upstreams: Arc<Vec<Arc<UpstreamConfig>>>,
    keys_by_hash: HashMap<String, Arc<ApiKeyConfig>>,
    rules: Arc<Vec<CompensationRuleConfig>>,
    prices: Vec<ModelPriceConfig>,
}

impl Snapshot {
    fn build(file: ControlFile) -> Self {
        let upstreams: Arc<Vec<Arc<UpstreamConfig>>> =
            Arc::new(file.upstreams.into_iter().map(Arc::new).collect());

        let keys_by_hash = file
            .api_keys
            .into_iter()
            .map(|k| (k.key_hash.clone(), Arc::new(k)))
            .collect();

        // Built-ins come first; a control-file row with the same id can
        // only toggle `enabled`, never rewrite the rule.
        let mut rules = builtin_rules();
        for rule in file.compensation_rules {
            if let Some(builtin) = rules.iter_mut().find(|b| b.id == rule.id) {
                builtin.enabled = rule.enabled;
            } else {
                rules.push(rule);
            }
        }
        rules.retain(|r| r.enabled);

        Self {
            upstreams,
            keys_by_hash,
            rules: Arc::new(rules),
            prices: file.prices,
        }
    }
}

/// Non-editable default rules shipped with the gateway.
///
/// The session-id rule keeps OpenAI-family sticky sessions working for
/// clients that only send the `x-session-id` spelling.
pub fn builtin_rules() -> Vec<CompensationRuleConfig> {
    vec![CompensationRuleConfig {
        id: "builtin-session-id".to_string(),
        capabilities: vec![
            RouteCapability::OpenaiChatCompatible,
            RouteCapability::OpenaiExtended,
            RouteCapability::CodexResponses,
        ],
        sources: vec!["x-session-id".to_string(), "x_session_id".to_string()],
        target_header: "session_id".to_string(),
        mode: CompensationMode::MissingOnly,
        enabled: true,
        builtin: true,
    }]
}

/// File-backed control plane: a TOML file deserialized into `ControlFile`,
/// kept fresh by a periodic reload plus a best-effort invalidation wake.
/// A database-backed implementation drops in behind the same trait.
pub struct FileControlPlane {
    path: PathBuf,
    snapshot: ArcSwap<Snapshot>,
    ledger: Arc<SpendLedger>,
    reload_wake: Notify,
}

impl FileControlPlane {
    pub fn load(path: &Path, ledger: Arc<SpendLedger>) -> Result<Arc<Self>> {
        let file = read_control_file(path)?;
        let plane = Arc::new(Self {
            path: path.to_path_buf(),
            snapshot: ArcSwap::from_pointee(Snapshot::build(file)),
            ledger,
            reload_wake: Notify::new(),
        });
        tracing::info!(
            "control: loaded, upstreams={}, keys={}, rules={}",
            plane.snapshot.load().upstreams.len(),
            plane.snapshot.load().keys_by_hash.len(),
            plane.snapshot.load().rules.len(),
        );
        Ok(plane)
    }

    /// Re-read the file and swap the snapshot. A broken file keeps the
    /// previous snapshot live.
    pub fn reload(&self) -> Result<()> {
        let file = read_control_file(&self.path)?;
        self.snapshot.store(Arc::new(Snapshot::build(file)));
        metrics::counter!(
            "gateway_control_reloads_total",
            "result" => "success",
        )
        .increment(1);
        Ok(())
    }

    /// Admin-plane invalidation signal: wake the refresh loop immediately.
    pub fn invalidate(&self) {
        self.reload_wake.notify_one();
    }

    /// Periodic refresh loop. The interval bounds snapshot staleness.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let plane = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = plane.reload_wake.notified() => {}
                    _ = shutdown.cancelled() => return,
                }
                if let Err(e) = plane.reload() {
                    tracing::warn!("control: reload failed, keeping previous snapshot, error={}", e);
                    metrics::counter!(
                        "gateway_control_reloads_total",
                        "result" => "error",
                    )
                    .increment(1);
                }
            }
        });
    }

    pub fn ledger(&self) -> &Arc<SpendLedger> {
        &self.ledger
    }
}

fn read_control_file(path: &Path) -> Result<ControlFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("control file {}: {e}", path.display()))?;
    let file: ControlFile = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => toml::from_str(&content)?,
    };
    file.validate()?;
    Ok(file)
}

impl ControlPlane for FileControlPlane {
    fn list_upstreams(&self) -> Arc<Vec<Arc<UpstreamConfig>>> {
        self.snapshot.load().upstreams.clone()
    }

    fn get_api_key_by_hash(&self, hash: &str) -> Option<Arc<ApiKeyConfig>> {
        self.snapshot.load().keys_by_hash.get(hash).cloned()
    }

    fn compensation_rules(&self) -> Arc<Vec<CompensationRuleConfig>> {
        self.snapshot.load().rules.clone()
    }

    fn resolve_model_price(&self, model: &str) -> Option<ModelPriceConfig> {
        let snapshot = self.snapshot.load();
        crate::billing::resolve_price(&snapshot.prices, model).cloned()
    }

    fn quota_exceeded_upstream_ids(&self, upstreams: &[Arc<UpstreamConfig>]) -> HashSet<String> {
        self.ledger.quota_exceeded(upstreams)
    }
}

/// Caches one quota-probe result so a selection burst does not recompute
/// spend rollups per request.
pub struct QuotaCache {
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<HashSet<String>>)>>,
}

impl QuotaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn get(
        &self,
        control: &dyn ControlPlane,
        upstreams: &[Arc<UpstreamConfig>],
    ) -> Arc<HashSet<String>> {
        let mut cached = self.cached.lock().unwrap();
        if let Some((at, set)) = cached.as_ref() {
            if at.elapsed() < self.ttl {
                return set.clone();
            }
        }
        let fresh = Arc::new(control.quota_exceeded_upstream_ids(upstreams));
        *cached = Some((Instant::now(), fresh.clone()));
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_secret;

    const CONTROL_TOML: &str = r#"
[[upstreams]]
id = "u1"
name = "anthropic-primary"
base_url = "https://api.anthropic.com"
capabilities = ["anthropic_messages"]
provider_type = "anthropic"
credential = "sk-ant-test"
weight = 1

[[upstreams]]
id = "u2"
name = "anthropic-backup"
base_url = "https://backup.example.com"
capabilities = ["anthropic_messages"]
provider_type = "anthropic"
credential = "sk-ant-backup"
priority = 1
daily_spending_limit = 10.0

[[api_keys]]
id = "k1"
key_hash = "HASH"
key_prefix = "sk-ch-1"
upstream_ids = ["u1", "u2"]

[[prices]]
model = "claude-sonnet-4"
input_per_million = 3.0
output_per_million = 15.0

[[prices]]
model = "claude-sonnet-4"
input_per_million = 2.0
output_per_million = 10.0
source = "manual_override"
"#;

    fn write_control(content: &str) -> temppath::TempPath {
        temppath::write(content)
    }

    // Minimal temp-file helper so tests do not depend on an external crate.
    mod temppath {
        use std::path::PathBuf;

        pub struct TempPath(pub PathBuf);

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        pub fn write(content: &str) -> TempPath {
            let path = std::env::temp_dir().join(format!(
                "charon_control_{}_{}.toml",
                std::process::id(),
                uuid::Uuid::new_v4()
            ));
            std::fs::write(&path, content).unwrap();
            TempPath(path)
        }
    }

    fn plane_from(content: &str) -> (Arc<FileControlPlane>, temppath::TempPath) {
        let content = content.replace("HASH", &hash_secret("sk-ch-1-secret"));
        let tmp = write_control(&content);
        let plane = FileControlPlane::load(&tmp.0, Arc::new(SpendLedger::new())).unwrap();
        (plane, tmp)
    }

    #[test]
    fn test_load_and_lookup() {
        let (plane, _tmp) = plane_from(CONTROL_TOML);
        assert_eq!(plane.list_upstreams().len(), 2);

        let key = plane
            .get_api_key_by_hash(&hash_secret("sk-ch-1-secret"))
            .unwrap();
        assert_eq!(key.id, "k1");
        assert!(plane.get_api_key_by_hash("nope").is_none());
    }

    #[test]
    fn test_price_cascade() {
        let (plane, _tmp) = plane_from(CONTROL_TOML);
        let price = plane.resolve_model_price("claude-sonnet-4").unwrap();
        assert_eq!(price.source, crate::config::PriceSource::ManualOverride);
        assert_eq!(price.input_per_million, 2.0);
        assert!(plane.resolve_model_price("gpt-4o").is_none());
    }

    #[test]
    fn test_builtin_rules_present_and_toggleable() {
        let (plane, _tmp) = plane_from(CONTROL_TOML);
        let rules = plane.compensation_rules();
        assert!(rules.iter().any(|r| r.id == "builtin-session-id" && r.builtin));

        let disabled = format!(
            "{CONTROL_TOML}\n[[compensation_rules]]\nid = \"builtin-session-id\"\nsources = [\"x\"]\ntarget_header = \"y\"\nenabled = false\n"
        );
        let (plane, _tmp) = plane_from(&disabled);
        assert!(plane
            .compensation_rules()
            .iter()
            .all(|r| r.id != "builtin-session-id"));
    }

    #[test]
    fn test_reload_keeps_snapshot_on_parse_error() {
        let (plane, tmp) = plane_from(CONTROL_TOML);
        std::fs::write(&tmp.0, "not [valid toml").unwrap();
        assert!(plane.reload().is_err());
        assert_eq!(plane.list_upstreams().len(), 2);
    }

    #[test]
    fn test_quota_probe_through_ledger() {
        let (plane, _tmp) = plane_from(CONTROL_TOML);
        let upstreams = plane.list_upstreams();
        assert!(plane.quota_exceeded_upstream_ids(&upstreams).is_empty());

        plane.ledger().record("u2", 10.0);
        let exceeded = plane.quota_exceeded_upstream_ids(&upstreams);
        assert!(exceeded.contains("u2"));
        assert!(!exceeded.contains("u1"));
    }

    #[test]
    fn test_quota_cache_reuses_result_within_ttl() {
        let (plane, _tmp) = plane_from(CONTROL_TOML);
        let upstreams = plane.list_upstreams();
        let cache = QuotaCache::new(Duration::from_secs(30));

        let first = cache.get(plane.as_ref(), &upstreams);
        assert!(first.is_empty());

        // Spend lands, but the cached probe is still served.
        plane.ledger().record("u2", 10.0);
        let second = cache.get(plane.as_ref(), &upstreams);
        assert!(second.is_empty());

        let expired = QuotaCache::new(Duration::from_millis(0));
        let third = expired.get(plane.as_ref(), &upstreams);
        assert!(third.contains("u2"));
    }

    #[test]
    fn test_validation_rejects_unknown_upstream_ref() {
        let bad = CONTROL_TOML.replace("upstream_ids = [\"u1\", \"u2\"]", "upstream_ids = [\"uX\"]");
        let content = bad.replace("HASH", &hash_secret("sk"));
        let tmp = write_control(&content);
        assert!(FileControlPlane::load(&tmp.0, Arc::new(SpendLedger::new())).is_err());
    }
}
