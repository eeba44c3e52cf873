use crate::config::{ModelPriceConfig, PriceSource, UpstreamConfig};
use crate::usage::UsageRecord;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Billable,
    Unbillable,
}

/// Cost attribution for one request, computed once at request end.
/// Prices are USD per million tokens; the result is USD rounded to six
/// decimals.
#[derive(Debug, Clone, Serialize)]
pub struct BillingSnapshot {
    pub status: BillingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbillable_reason: Option<&'static str>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_source: Option<PriceSource>,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_read_cost: f64,
    pub cache_write_cost: f64,
    pub final_cost: f64,
}

fn round6(x: f64) -> f64 {
    (x * 1_000_000.0).round() / 1_000_000.0
}

fn per_million(tokens: u64, price: f64) -> f64 {
    tokens as f64 * price / 1_000_000.0
}

/// Build the billing snapshot for a finished request. `price` is the
/// already-resolved catalog entry (`manual_override` beats
/// `synced_catalog`); `None` makes the request unbillable.
pub fn build_snapshot(
    model: &str,
    usage: &UsageRecord,
    upstream: &UpstreamConfig,
    price: Option<&ModelPriceConfig>,
) -> BillingSnapshot {
    let Some(price) = price else {
        return BillingSnapshot {
            status: BillingStatus::Unbillable,
            unbillable_reason: Some("no_price_for_model"),
            model: model.to_string(),
            price_source: None,
            input_cost: 0.0,
            output_cost: 0.0,
            cache_read_cost: 0.0,
            cache_write_cost: 0.0,
            final_cost: 0.0,
        };
    };

    let input_cost = per_million(usage.prompt(), price.input_per_million)
        * upstream.billing_input_multiplier;
    let output_cost = per_million(usage.completion(), price.output_per_million)
        * upstream.billing_output_multiplier;
    let cache_read_cost = per_million(
        usage.cache_read_input_tokens.unwrap_or(0),
        price.cache_read_per_million,
    );
    let cache_write_cost = per_million(
        usage.cache_creation_input_tokens.unwrap_or(0),
        price.cache_write_per_million,
    );

    BillingSnapshot {
        status: BillingStatus::Billable,
        unbillable_reason: None,
        model: model.to_string(),
        price_source: Some(price.source),
        input_cost: round6(input_cost),
        output_cost: round6(output_cost),
        cache_read_cost: round6(cache_read_cost),
        cache_write_cost: round6(cache_write_cost),
        final_cost: round6(input_cost + output_cost + cache_read_cost + cache_write_cost),
    }
}

/// Resolve a model's price from a catalog slice: a manual override always
/// wins over a synced entry for the same model.
pub fn resolve_price<'a>(prices: &'a [ModelPriceConfig], model: &str) -> Option<&'a ModelPriceConfig> {
    let mut synced = None;
    for price in prices {
        if price.model != model {
            continue;
        }
        match price.source {
            PriceSource::ManualOverride => return Some(price),
            PriceSource::SyncedCatalog => synced = Some(price),
        }
    }
    synced
}

/// Day-to-date and month-to-date billed spend per upstream, kept in memory.
/// Buckets roll over automatically when the UTC date changes.
#[derive(Default)]
pub struct SpendLedger {
    day: DashMap<String, (time::Date, f64)>,
    month: DashMap<String, ((i32, time::Month), f64)>,
}

impl SpendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, upstream_id: &str, usd: f64) {
        if usd <= 0.0 {
            return;
        }
        let now = time::OffsetDateTime::now_utc();
        let today = now.date();
        let this_month = (now.year(), now.month());

        self.day
            .entry(upstream_id.to_string())
            .and_modify(|(date, total)| {
                if *date == today {
                    *total += usd;
                } else {
                    *date = today;
                    *total = usd;
                }
            })
            .or_insert((today, usd));

        self.month
            .entry(upstream_id.to_string())
            .and_modify(|(month, total)| {
                if *month == this_month {
                    *total += usd;
                } else {
                    *month = this_month;
                    *total = usd;
                }
            })
            .or_insert((this_month, usd));
    }

    pub fn day_total(&self, upstream_id: &str) -> f64 {
        let today = time::OffsetDateTime::now_utc().date();
        self.day
            .get(upstream_id)
            .filter(|e| e.value().0 == today)
            .map(|e| e.value().1)
            .unwrap_or(0.0)
    }

    pub fn month_total(&self, upstream_id: &str) -> f64 {
        let now = time::OffsetDateTime::now_utc();
        let this_month = (now.year(), now.month());
        self.month
            .get(upstream_id)
            .filter(|e| e.value().0 == this_month)
            .map(|e| e.value().1)
            .unwrap_or(0.0)
    }

    /// The quota probe: upstreams whose configured day or month cap is
    /// already reached.
    pub fn quota_exceeded(&self, upstreams: &[Arc<UpstreamConfig>]) -> HashSet<String> {
        let mut exceeded = HashSet::new();
        for u in upstreams {
            let day_hit = u
                .daily_spending_limit
                .map(|cap| self.day_total(&u.id) >= cap)
                .unwrap_or(false);
            let month_hit = u
                .monthly_spending_limit
                .map(|cap| self.month_total(&u.id) >= cap)
                .unwrap_or(false);
            if day_hit || month_hit {
                exceeded.insert(u.id.clone());
            }
        }
        exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::RouteCapability;

    fn upstream_with_multipliers(input_mul: f64, output_mul: f64) -> UpstreamConfig {
        UpstreamConfig {
            id: "u1".into(),
            name: "u1".into(),
            base_url: "https://api.example.com".into(),
            capabilities: vec![RouteCapability::OpenaiChatCompatible],
            provider_type: "openai".into(),
            priority: 0,
            weight: 1,
            is_active: true,
            allowed_models: None,
            model_redirects: Default::default(),
            credential: "sk".into(),
            timeout_seconds: 60,
            daily_spending_limit: None,
            monthly_spending_limit: None,
            billing_input_multiplier: input_mul,
            billing_output_multiplier: output_mul,
            circuit_breaker: None,
            affinity_migration: None,
        }
    }

    fn price(source: PriceSource) -> ModelPriceConfig {
        ModelPriceConfig {
            model: "gpt-4o".into(),
            input_per_million: 2.5,
            output_per_million: 10.0,
            cache_read_per_million: 1.25,
            cache_write_per_million: 3.125,
            source,
        }
    }

    fn usage(prompt: u64, completion: u64) -> UsageRecord {
        UsageRecord {
            prompt_tokens: Some(prompt),
            completion_tokens: Some(completion),
            ..Default::default()
        }
    }

    #[test]
    fn test_cost_formula() {
        let up = upstream_with_multipliers(1.0, 1.0);
        let p = price(PriceSource::SyncedCatalog);
        let snap = build_snapshot("gpt-4o", &usage(1_000_000, 100_000), &up, Some(&p));
        assert_eq!(snap.status, BillingStatus::Billable);
        assert_eq!(snap.input_cost, 2.5);
        assert_eq!(snap.output_cost, 1.0);
        assert_eq!(snap.final_cost, 3.5);
    }

    #[test]
    fn test_multipliers_apply_per_direction() {
        let up = upstream_with_multipliers(2.0, 0.5);
        let p = price(PriceSource::SyncedCatalog);
        let snap = build_snapshot("gpt-4o", &usage(1_000_000, 100_000), &up, Some(&p));
        assert_eq!(snap.input_cost, 5.0);
        assert_eq!(snap.output_cost, 0.5);
        assert_eq!(snap.final_cost, 5.5);
    }

    #[test]
    fn test_cache_costs_added() {
        let up = upstream_with_multipliers(1.0, 1.0);
        let p = price(PriceSource::SyncedCatalog);
        let mut u = usage(0, 0);
        u.cache_read_input_tokens = Some(1_000_000);
        u.cache_creation_input_tokens = Some(1_000_000);
        let snap = build_snapshot("gpt-4o", &u, &up, Some(&p));
        assert_eq!(snap.cache_read_cost, 1.25);
        assert_eq!(snap.cache_write_cost, 3.125);
        assert_eq!(snap.final_cost, 4.375);
    }

    #[test]
    fn test_rounding_to_six_decimals() {
        let up = upstream_with_multipliers(1.0, 1.0);
        let p = price(PriceSource::SyncedCatalog);
        let snap = build_snapshot("gpt-4o", &usage(1, 1), &up, Some(&p));
        // 2.5e-6 + 10e-6 = 1.25e-5
        assert_eq!(snap.input_cost, 0.000003);
        assert_eq!(snap.output_cost, 0.00001);
        assert_eq!(snap.final_cost, 0.000013);
    }

    #[test]
    fn test_unbillable_without_price() {
        let up = upstream_with_multipliers(1.0, 1.0);
        let snap = build_snapshot("unknown-model", &usage(10, 10), &up, None);
        assert_eq!(snap.status, BillingStatus::Unbillable);
        assert_eq!(snap.unbillable_reason, Some("no_price_for_model"));
        assert_eq!(snap.final_cost, 0.0);
    }

    #[test]
    fn test_manual_override_wins() {
        let mut synced = price(PriceSource::SyncedCatalog);
        synced.input_per_million = 99.0;
        let manual = price(PriceSource::ManualOverride);
        let prices = vec![synced, manual];
        let got = resolve_price(&prices, "gpt-4o").unwrap();
        assert_eq!(got.source, PriceSource::ManualOverride);
        assert_eq!(got.input_per_million, 2.5);
        assert!(resolve_price(&prices, "other").is_none());
    }

    #[test]
    fn test_ledger_accumulates_and_probes() {
        let ledger = SpendLedger::new();
        let mut up = upstream_with_multipliers(1.0, 1.0);
        up.daily_spending_limit = Some(1.0);
        let ups = vec![Arc::new(up)];

        ledger.record("u1", 0.4);
        assert!(ledger.quota_exceeded(&ups).is_empty());

        ledger.record("u1", 0.6);
        assert_eq!(ledger.day_total("u1"), 1.0);
        assert!(ledger.quota_exceeded(&ups).contains("u1"));
    }

    #[test]
    fn test_ledger_monthly_cap() {
        let ledger = SpendLedger::new();
        let mut up = upstream_with_multipliers(1.0, 1.0);
        up.monthly_spending_limit = Some(5.0);
        let ups = vec![Arc::new(up)];
        ledger.record("u1", 5.0);
        assert!(ledger.quota_exceeded(&ups).contains("u1"));
    }

    #[test]
    fn test_uncapped_upstream_never_exceeds() {
        let ledger = SpendLedger::new();
        let ups = vec![Arc::new(upstream_with_multipliers(1.0, 1.0))];
        ledger.record("u1", 1_000_000.0);
        assert!(ledger.quota_exceeded(&ups).is_empty());
    }
}
