use super::GatewayConfig;
use super::*;

#[test]
fn test_defaults_are_valid() {
    let cfg = GatewayConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.proxy_prefix, "/proxy");
    assert_eq!(cfg.limits.max_body_bytes, 16 * 1024 * 1024);
    assert_eq!(cfg.limits.max_failover_attempts, 3);
    assert_eq!(cfg.affinity.sliding_ttl_secs, 300);
    assert_eq!(cfg.affinity.absolute_ttl_secs, 1800);
    assert_eq!(cfg.log_sink.capacity, 1024);
    assert_eq!(cfg.quota.cache_ttl_secs, 30);
    assert!(!cfg.ssrf.allow_private_networks);
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
proxy_prefix = "/gateway"

[control]
file = "control.toml"
refresh_secs = 10

[limits]
max_failover_attempts = 5

[routing]
default_strategy = "round_robin"

[routing.strategy_overrides]
anthropic_messages = "priority"

[ssrf]
allow_private_networks = true
"#;
    let tmp = std::env::temp_dir().join(format!("charon_cfg_{}.toml", std::process::id()));
    std::fs::write(&tmp, toml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.proxy_prefix, "/gateway");
    assert_eq!(cfg.control.refresh_secs, 10);
    assert_eq!(cfg.limits.max_failover_attempts, 5);
    assert!(cfg.ssrf.allow_private_networks);
    assert_eq!(
        cfg.routing.default_strategy,
        crate::selector::SelectionStrategy::RoundRobin
    );
    assert_eq!(
        cfg.routing
            .strategy_for(crate::classify::RouteCapability::AnthropicMessages),
        crate::selector::SelectionStrategy::Priority
    );
    assert_eq!(
        cfg.routing
            .strategy_for(crate::classify::RouteCapability::CodexResponses),
        crate::selector::SelectionStrategy::RoundRobin
    );
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = GatewayConfig::load(std::path::Path::new("/nonexistent/charon.toml")).unwrap();
    assert_eq!(cfg.proxy_prefix, "/proxy");
}

#[test]
fn test_validate_rejects_bad_prefix() {
    let mut cfg = GatewayConfig::default();
    cfg.proxy_prefix = "proxy".into();
    assert!(cfg.validate().is_err());

    cfg.proxy_prefix = "/proxy/".into();
    assert!(cfg.validate().is_err());

    cfg.proxy_prefix = "/".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_limits() {
    let mut cfg = GatewayConfig::default();
    cfg.limits.max_failover_attempts = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.limits.max_body_bytes = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.log_sink.capacity = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_control_file_validation() {
    let good: ControlFile = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "https://api.example.com/v1"
capabilities = ["openai_chat_compatible"]
credential = "sk-test"

[[api_keys]]
id = "k1"
key_hash = "abc"
key_prefix = "sk-ch"
upstream_ids = ["u1"]
"#,
    )
    .unwrap();
    assert!(good.validate().is_ok());
    assert_eq!(good.upstreams[0].weight, 1);
    assert_eq!(good.upstreams[0].timeout_seconds, 60);
    assert_eq!(good.upstreams[0].billing_input_multiplier, 1.0);
    assert!(good.upstreams[0].is_active);

    // Unknown upstream reference in a key.
    let bad: ControlFile = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "https://api.example.com"
capabilities = ["openai_chat_compatible"]
credential = "sk-test"

[[api_keys]]
id = "k1"
key_hash = "abc"
key_prefix = "sk-ch"
upstream_ids = ["missing"]
"#,
    )
    .unwrap();
    assert!(bad.validate().is_err());

    // Capability tags come from a closed enum.
    let unknown_capability: Result<ControlFile, _> = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "https://api.example.com"
capabilities = ["telnet"]
credential = "sk-test"
"#,
    );
    assert!(unknown_capability.is_err());

    // Base URL scheme is validated at ingest.
    let bad_scheme: ControlFile = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "ftp://api.example.com"
capabilities = ["openai_chat_compatible"]
credential = "sk-test"
"#,
    )
    .unwrap();
    assert!(bad_scheme.validate().is_err());
}

#[test]
fn test_duplicate_upstream_ids_rejected() {
    let dup: ControlFile = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "a"
base_url = "https://a.example.com"
capabilities = ["openai_chat_compatible"]
credential = "sk"

[[upstreams]]
id = "u1"
name = "b"
base_url = "https://b.example.com"
capabilities = ["openai_chat_compatible"]
credential = "sk"
"#,
    )
    .unwrap();
    assert!(dup.validate().is_err());
}

#[test]
fn test_migration_config_shapes() {
    let file: ControlFile = toml::from_str(
        r#"
[[upstreams]]
id = "u1"
name = "primary"
base_url = "https://api.example.com"
capabilities = ["anthropic_messages"]
credential = "sk"

[upstreams.affinity_migration]
enabled = true
metric = "tokens"
threshold = 50000

[upstreams.circuit_breaker]
failure_threshold = 3
open_duration_ms = 10000
"#,
    )
    .unwrap();
    let up = &file.upstreams[0];
    let migration = up.affinity_migration.as_ref().unwrap();
    assert!(migration.enabled);
    assert_eq!(migration.metric, MigrationMetric::Tokens);
    assert_eq!(migration.threshold, 50_000);

    let breaker = up.circuit_breaker.as_ref().unwrap();
    assert_eq!(breaker.failure_threshold, 3);
    assert_eq!(breaker.open_duration_ms, 10_000);
    assert_eq!(breaker.half_open_probes, 1);
}
