pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    /// Apply environment variable overrides for deployment-level settings.
    /// Business data (upstreams, keys, rules, prices) comes exclusively
    /// from the control plane — never from env vars.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHARON_PROXY_PREFIX") {
            self.proxy_prefix = v;
        }
        if let Ok(v) = std::env::var("CHARON_CONTROL_FILE") {
            self.control.file = v;
        }
        if let Ok(v) = std::env::var("CHARON_CONTROL_REFRESH_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.control.refresh_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CHARON_MAX_BODY_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                self.limits.max_body_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("CHARON_MAX_FAILOVER_ATTEMPTS") {
            if let Ok(n) = v.parse::<usize>() {
                self.limits.max_failover_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("CHARON_SSRF_ALLOW_PRIVATE") {
            self.ssrf.allow_private_networks = v == "true" || v == "1";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.proxy_prefix.starts_with('/') || self.proxy_prefix.len() < 2 {
            anyhow::bail!("proxy_prefix must start with '/' and be non-empty");
        }
        if self.proxy_prefix.ends_with('/') {
            anyhow::bail!("proxy_prefix must not end with '/'");
        }
        if self.limits.max_failover_attempts == 0 {
            anyhow::bail!("limits.max_failover_attempts must be at least 1");
        }
        if self.limits.max_body_bytes == 0 {
            anyhow::bail!("limits.max_body_bytes must be positive");
        }
        if self.affinity.sliding_ttl_secs == 0 || self.affinity.absolute_ttl_secs == 0 {
            anyhow::bail!("affinity TTLs must be positive");
        }
        if self.log_sink.capacity == 0 {
            anyhow::bail!("log_sink.capacity must be positive");
        }
        Ok(())
    }
}

impl ControlFile {
    /// Structural validation of a control-plane snapshot. URL reachability
    /// is not checked here; hostname resolution happens per outbound attempt.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for up in &self.upstreams {
            if up.id.is_empty() {
                anyhow::bail!("upstream id cannot be empty");
            }
            if !seen.insert(up.id.as_str()) {
                anyhow::bail!("duplicate upstream id: {}", up.id);
            }
            if up.weight < 1 {
                anyhow::bail!("upstream {} weight must be >= 1", up.id);
            }
            if up.capabilities.is_empty() {
                anyhow::bail!("upstream {} declares no capabilities", up.id);
            }
            if up.timeout_seconds == 0 {
                anyhow::bail!("upstream {} timeout_seconds must be positive", up.id);
            }
            crate::ssrf::validate_base_url_syntax(&up.base_url)
                .map_err(|e| anyhow::anyhow!("upstream {}: {}", up.id, e))?;
        }

        let mut key_ids = std::collections::HashSet::new();
        for key in &self.api_keys {
            if key.id.is_empty() || key.key_hash.is_empty() {
                anyhow::bail!("api key id and key_hash cannot be empty");
            }
            if !key_ids.insert(key.id.as_str()) {
                anyhow::bail!("duplicate api key id: {}", key.id);
            }
            for uid in &key.upstream_ids {
                if !seen.contains(uid.as_str()) {
                    anyhow::bail!("api key {} references unknown upstream {}", key.id, uid);
                }
            }
        }

        for rule in &self.compensation_rules {
            if rule.sources.is_empty() {
                anyhow::bail!("compensation rule {} has no sources", rule.id);
            }
            if rule.target_header.is_empty() {
                anyhow::bail!("compensation rule {} has no target_header", rule.id);
            }
        }

        Ok(())
    }
}
