use crate::affinity::AffinityStore;
use crate::billing::SpendLedger;
use crate::config::GatewayConfig;
use crate::control::{ControlPlane, QuotaCache};
use crate::metrics::Metrics;
use crate::proxy::engine::ProxyEngine;
use crate::recorder::LogSink;
use crate::selector::CandidateSelector;
use crate::ssrf::SsrfPolicy;
use crate::upstream::HealthRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared gateway state, cheaply cloneable. Everything here is either
/// immutable configuration or internally synchronized; nothing holds a lock
/// across a request.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub control: Arc<dyn ControlPlane>,
    pub engine: Arc<ProxyEngine>,
    pub selector: Arc<CandidateSelector>,
    pub registry: Arc<HealthRegistry>,
    pub affinity: Arc<AffinityStore>,
    pub ledger: Arc<SpendLedger>,
    pub quota_cache: Arc<QuotaCache>,
    pub sink: Arc<LogSink>,
    pub metrics: Metrics,
    /// Cancelled once at shutdown; every background loop watches it.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        control: Arc<dyn ControlPlane>,
        ledger: Arc<SpendLedger>,
        metrics: Metrics,
    ) -> Self {
        let registry = Arc::new(HealthRegistry::new());
        let affinity = Arc::new(AffinityStore::new(&config.affinity));
        let selector = Arc::new(CandidateSelector::new(
            registry.clone(),
            affinity.clone(),
            config.routing.clone(),
            config.limits.max_failover_attempts,
        ));
        let engine = Arc::new(ProxyEngine::new(
            &config.keepalive_pool,
            SsrfPolicy::new(config.ssrf.allow_private_networks),
        ));
        let sink = Arc::new(LogSink::new(config.log_sink.capacity));
        let quota_cache = Arc::new(QuotaCache::new(Duration::from_secs(
            config.quota.cache_ttl_secs,
        )));

        Self {
            config: Arc::new(config),
            control,
            engine,
            selector,
            registry,
            affinity,
            ledger,
            quota_cache,
            sink,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the background loops owned by the state: affinity janitor and
    /// log-sink drain. The control-plane refresh loop is started by
    /// bootstrap, which owns the concrete control-plane type.
    pub fn start_background_tasks(&self) {
        self.affinity.spawn_janitor(
            Duration::from_secs(self.config.affinity.janitor_interval_secs),
            self.shutdown.clone(),
        );
        self.sink.spawn_drain(self.shutdown.clone());
    }
}
