use crate::billing::BillingSnapshot;
use crate::selector::{ExcludedUpstream, RoutingType, SelectionStrategy};
use crate::usage::UsageRecord;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why one failover attempt died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverErrorType {
    Timeout,
    Http5xx,
    Http429,
    Http4xx,
    ConnectionError,
    CircuitOpen,
    NoCandidates,
}

/// One entry in a request's failover history.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverAttempt {
    pub upstream_id: String,
    pub upstream_name: String,
    pub attempted_at: String,
    pub error_type: FailoverErrorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

/// Where along the pipeline a failed request died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    CandidateSelection,
    UpstreamConnect,
    UpstreamResponse,
    StreamInterrupt,
}

/// Post-hoc explanation of how a request was routed.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_model: Option<String>,
    pub model_redirect_applied: bool,
    pub routing_type: RoutingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_route_capability: Option<&'static str>,
    pub selection_strategy: SelectionStrategy,
    pub candidates: Vec<String>,
    pub excluded: Vec<ExcludedUpstream>,
    pub candidate_count: usize,
    pub final_candidate_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_upstream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_upstream_id: Option<String>,
    pub did_send_upstream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
}

impl RoutingDecision {
    pub fn empty() -> Self {
        Self {
            original_model: None,
            resolved_model: None,
            model_redirect_applied: false,
            routing_type: RoutingType::None,
            matched_route_capability: None,
            selection_strategy: SelectionStrategy::Weighted,
            candidates: Vec::new(),
            excluded: Vec::new(),
            candidate_count: 0,
            final_candidate_count: 0,
            selected_upstream_id: None,
            actual_upstream_id: None,
            did_send_upstream: false,
            failure_stage: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenCounts {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub cached: u64,
    pub reasoning: u64,
    pub cache_create: u64,
    pub cache_read: u64,
}

impl From<&UsageRecord> for TokenCounts {
    fn from(u: &UsageRecord) -> Self {
        Self {
            prompt: u.prompt(),
            completion: u.completion(),
            total: u.total(),
            cached: u.cached_tokens.unwrap_or(0),
            reasoning: u.reasoning_tokens.unwrap_or(0),
            cache_create: u.cache_creation_input_tokens.unwrap_or(0),
            cache_read: u.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

/// Name-level difference between the inbound and outbound header sets.
/// Values are not recorded — only which names were added, removed, or
/// rewritten — so credentials can never leak through the log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeaderDiff {
    pub inbound_count: usize,
    pub outbound_count: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

pub fn diff_headers(inbound: &http::HeaderMap, outbound: &http::HeaderMap) -> HeaderDiff {
    let collect = |headers: &http::HeaderMap| -> HashMap<String, Vec<Vec<u8>>> {
        let mut map: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for (name, value) in headers {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.as_bytes().to_vec());
        }
        map
    };

    let inbound_map = collect(inbound);
    let outbound_map = collect(outbound);

    let mut added: Vec<String> = outbound_map
        .keys()
        .filter(|k| !inbound_map.contains_key(*k))
        .cloned()
        .collect();
    let mut removed: Vec<String> = inbound_map
        .keys()
        .filter(|k| !outbound_map.contains_key(*k))
        .cloned()
        .collect();
    let mut changed: Vec<String> = inbound_map
        .iter()
        .filter(|(k, v)| outbound_map.get(*k).map(|ov| ov != *v).unwrap_or(false))
        .map(|(k, _)| k.clone())
        .collect();
    added.sort();
    removed.sort();
    changed.sort();

    HeaderDiff {
        inbound_count: inbound.len(),
        outbound_count: outbound.len(),
        added,
        removed,
        changed,
    }
}

/// The complete diagnostic record for one request. Produced at request end
/// and handed to the sink; persistence transport lives behind it.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    pub api_key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tokens: TokenCounts,
    pub status_code: u16,
    pub duration_ms: u64,
    pub routing_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    pub is_stream: bool,
    pub routing_type: RoutingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<&'static str>,
    pub lb_strategy: SelectionStrategy,
    pub failover_attempts: usize,
    pub failover_history: Vec<FailoverAttempt>,
    pub routing_decision: RoutingDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub affinity_hit: bool,
    pub affinity_migrated: bool,
    pub session_id_compensated: bool,
    pub header_diff: HeaderDiff,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingSnapshot>,
    pub created_at: String,
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Bounded fire-and-forget log sink. `write` never blocks the response
/// path: when the queue is full the oldest record is dropped and a counter
/// is bumped.
pub struct LogSink {
    queue: Mutex<VecDeque<RequestLog>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn write(&self, log: RequestLog) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_request_log_dropped_total").increment(1);
            }
            queue.push_back(log);
        }
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<RequestLog> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Drain loop. The default transport is one JSON line per record on the
    /// `request_log` tracing target; a database writer can replace it by
    /// consuming the sink the same way.
    pub fn spawn_drain(self: &Arc<Self>, shutdown: CancellationToken) {
        let sink = self.clone();
        tokio::spawn(async move {
            loop {
                while let Some(log) = sink.pop() {
                    emit(&log);
                }
                tokio::select! {
                    _ = sink.notify.notified() => {}
                    _ = shutdown.cancelled() => {
                        // Final flush before exit.
                        while let Some(log) = sink.pop() {
                            emit(&log);
                        }
                        return;
                    }
                }
            }
        });
    }
}

fn emit(log: &RequestLog) {
    match serde_json::to_string(log) {
        Ok(line) => {
            tracing::info!(target: "request_log", record = %line, "request");
        }
        Err(e) => {
            tracing::error!("recorder: failed to serialize request log, error={}", e);
        }
    }
}
