use crate::affinity::{AffinityKey, AffinityStore};
use crate::billing::{self, SpendLedger};
use crate::classify::{self, ProtocolFamily, SessionSource};
use crate::config::UpstreamConfig;
use crate::control::ControlPlane;
use crate::error::{ErrorCode, ErrorEnvelope};
use crate::proxy::context::{BoxBody, LogDraft, RequestContext};
use crate::proxy::engine::strip_hop_headers;
use crate::proxy::failover::{self, FailoverError, FailoverInput};
use crate::proxy::sse::{BodyCapture, SseObserver};
use crate::recorder::{self, FailureStage};
use crate::selector::{SelectionFailureKind, SelectionInput};
use crate::server::GatewayState;
use crate::usage::UsageRecord;
use bytes::Bytes;
use futures_util::stream;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::{BodyExt, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle one inbound request through the routing pipeline:
///
/// 1. AUTH       — resolve and verify the gateway key
/// 2. BUFFER     — read the inbound body under the hard cap
/// 3. CLASSIFY   — map (path, body shape) to a route capability
/// 4. COMPENSATE — apply header compensation rules, extract the session id
/// 5. SELECT     — build the ordered candidate list
/// 6. FAILOVER   — drive attempts until one succeeds or the list is spent
/// 7. RELAY      — stream the response, observing usage as it passes
/// 8. RECORD     — request log + billing snapshot, off the response path
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let request_id = parts
        .headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());

    let mut ctx = RequestContext::new(request_id.clone(), method.to_string(), path.clone());
    let mut draft = LogDraft::new(state.sink.clone(), &request_id, method.as_str(), &path);

    // Route surface check — everything lives under the proxy prefix.
    let Some(sub_path) = strip_proxy_prefix(&path, &state.config.proxy_prefix) else {
        debug!("proxy: path outside proxy prefix, path={}", path);
        draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
        draft.finish_with_error(404, "unsupported route");
        return Ok(ctx.error_response(ErrorCode::UnsupportedRoute, "unsupported route"));
    };
    let sub_path = sub_path.to_string();

    // AUTH
    let verified = match crate::auth::verify_token(&parts.headers, |hash| {
        state.control.get_api_key_by_hash(hash)
    }) {
        Ok(v) => v,
        Err(failure) => {
            debug!("proxy: auth failed, peer={}, reason={}", peer_addr, failure);
            metrics::counter!("gateway_auth_failures_total").increment(1);
            draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
            draft.finish_with_error(401, failure.to_string());
            return Ok(ctx.error_response(ErrorCode::Unauthorized, "invalid api key"));
        }
    };
    draft.log.api_key_id = verified.key_id.clone();

    // BUFFER — hard cap; a body one byte over is rejected before any
    // upstream is chosen.
    let cap = state.config.limits.max_body_bytes as usize;
    if let Some(len) = content_length(&parts.headers) {
        if len > cap as u64 {
            draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
            draft.finish_with_error(413, "request body too large");
            return Ok(ctx.error_response(ErrorCode::PayloadTooLarge, "request body too large"));
        }
    }
    let body_bytes = match Limited::new(body, cap).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
                draft.finish_with_error(413, "request body too large");
                Ok(ctx.error_response(ErrorCode::PayloadTooLarge, "request body too large"))
            } else {
                warn!("proxy: failed to read request body, error={}", e);
                draft.finish_with_error(400, format!("body read failed: {e}"));
                Ok(ctx.error_response(ErrorCode::ServiceUnavailable, "failed to read request body"))
            };
        }
    };

    let body_json: serde_json::Value = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null)
    };

    // CLASSIFY
    let routing_start = Instant::now();
    let Some(route) = classify::classify(&sub_path, query.as_deref(), &body_json) else {
        debug!("proxy: no capability matched, sub_path={}", sub_path);
        draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
        draft.finish_with_error(404, "no route capability matched");
        return Ok(ctx.error_response(ErrorCode::UnsupportedRoute, "unsupported route"));
    };
    ctx.capability = route.capability.as_str().to_string();
    ctx.is_stream = route.stream_requested;
    draft.log.model = route.model.clone();
    draft.log.is_stream = route.stream_requested;
    draft.log.group_name = Some(route.capability.as_str());
    draft.log.routing_decision.original_model = route.model.clone();
    draft.log.routing_decision.matched_route_capability = Some(route.capability.as_str());

    // COMPENSATE + session extraction. Rules run against a scratch copy of
    // the inbound headers; the outbound set is derived from it later, so a
    // rule-supplied session header also drives affinity.
    let mut effective_headers = parts.headers.clone();
    let rules = state.control.compensation_rules();
    let written_targets = crate::proxy::engine::apply_compensation_rules(
        &mut effective_headers,
        route.capability,
        &rules,
    );
    let session = classify::extract_session(route.capability, &effective_headers, &body_json);
    let session_id_compensated = session
        .as_ref()
        .map(|s| {
            s.source == SessionSource::Header
                && session_header_was_compensated(&parts.headers, &effective_headers, &written_targets)
        })
        .unwrap_or(false);
    draft.log.session_id = session.as_ref().map(|s| s.id.clone());
    draft.log.session_id_compensated = session_id_compensated;

    // SELECT
    let upstreams = state.control.list_upstreams();
    let quota = state.quota_cache.get(state.control.as_ref(), &upstreams);
    for u in upstreams.iter() {
        state.registry.set_quota_exceeded(&u.id, quota.contains(&u.id));
    }

    let selection = match state.selector.select(SelectionInput {
        key: &verified,
        route: &route,
        headers: &parts.headers,
        session: session.as_ref(),
        upstreams: &upstreams,
        quota_exceeded: &quota,
        body_len: body_bytes.len() as u64,
    }) {
        Ok(s) => s,
        Err(failure) => {
            let (code, message) = match failure.kind {
                SelectionFailureKind::NoUpstreamsConfigured => (
                    ErrorCode::NoUpstreamsConfigured,
                    "no upstream serves this route",
                ),
                SelectionFailureKind::NoAuthorizedUpstreams => (
                    ErrorCode::NoAuthorizedUpstreams,
                    "api key is not authorized for any matching upstream",
                ),
                SelectionFailureKind::PinIncompatible => (
                    ErrorCode::UpstreamPinIncompatible,
                    "requested upstream is not available",
                ),
                SelectionFailureKind::NoCandidates => (
                    ErrorCode::AllUpstreamsUnavailable,
                    "all matching upstreams are currently excluded",
                ),
            };
            debug!(
                "proxy: selection failed, key={}, capability={}, detail={}",
                verified.key_prefix, route.capability, failure.detail
            );
            draft.log.routing_decision.excluded = failure.excluded;
            draft.log.routing_decision.failure_stage = Some(FailureStage::CandidateSelection);
            draft.finish_with_error(code.status().as_u16(), failure.detail);
            let envelope = ErrorEnvelope::new(code, message).with_did_send_upstream(false);
            return Ok(ctx.error_response_with(envelope));
        }
    };
    draft.log.routing_duration_ms = routing_start.elapsed().as_millis() as u64;
    draft.log.routing_type = selection.routing_type;
    draft.log.lb_strategy = selection.strategy;
    draft.log.affinity_hit = selection.affinity_hit;
    draft.log.affinity_migrated = selection.affinity_migrated;

    let decision = &mut draft.log.routing_decision;
    decision.routing_type = selection.routing_type;
    decision.selection_strategy = selection.strategy;
    decision.candidates = selection.candidates.iter().map(|u| u.id.clone()).collect();
    decision.excluded = selection.excluded.clone();
    decision.candidate_count = selection.candidate_count;
    decision.final_candidate_count = selection.final_candidate_count;
    decision.selected_upstream_id = selection.candidates.first().map(|u| u.id.clone());

    // FAILOVER
    let cancel = CancellationToken::new();
    ctx.upstream_start = Some(Instant::now());
    let result = failover::run(FailoverInput {
        engine: &state.engine,
        registry: &state.registry,
        selection: &selection,
        default_breaker: &crate::config::CircuitBreakerConfig::default(),
        method: &method,
        sub_path: &sub_path,
        query: query.as_deref(),
        effective_headers: &effective_headers,
        body_bytes: body_bytes.clone(),
        body_json: (!body_json.is_null()).then_some(&body_json),
        family: route.family,
        request_id: &request_id,
        deadline_slack: std::time::Duration::from_secs(
            state.config.limits.failover_deadline_slack_secs,
        ),
        cancel: &cancel,
    })
    .await;

    draft.log.failover_attempts = result.attempts.len();
    draft.log.failover_history = result.attempts.clone();
    draft.log.routing_decision.did_send_upstream = result.did_send_upstream;
    draft.log.routing_decision.resolved_model = result.resolved_model.clone();
    draft.log.routing_decision.model_redirect_applied = result.model_redirect_applied;

    let Some((upstream_response, served_by)) = result.response else {
        let error = result
            .error
            .unwrap_or(FailoverError::Exhausted { last_stage: FailureStage::UpstreamConnect });
        return Ok(failover_error_response(ctx, draft, error, result.did_send_upstream));
    };

    ctx.upstream_id = served_by.id.clone();
    draft.log.upstream_id = Some(served_by.id.clone());
    draft.log.routing_decision.actual_upstream_id = Some(served_by.id.clone());

    // RELAY
    let status = upstream_response.status();
    let (mut resp_parts, resp_body) = upstream_response.into_parts();
    strip_hop_headers(&mut resp_parts.headers);
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp_parts
            .headers
            .insert(HeaderName::from_static("x-request-id"), v);
    }
    draft.log.header_diff = recorder::diff_headers(&parts.headers, &effective_headers);

    let is_sse = resp_parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if result.fatal_passthrough {
        // The upstream's own 4xx goes back verbatim; nothing to meter.
        draft.log.routing_decision.failure_stage = Some(FailureStage::UpstreamResponse);
        draft.finish_with_error(status.as_u16(), "upstream rejected the request");
        ctx.finalize_metrics(status.as_u16());
        let mut response = Response::from_parts(resp_parts, resp_body.boxed());
        *response.status_mut() = status;
        return Ok(response);
    }

    let affinity_binding = session.as_ref().map(|s| {
        (
            state.affinity.clone(),
            AffinityKey {
                key_id: verified.key_id.clone(),
                capability: route.capability,
                session_id: s.id.clone(),
            },
        )
    });

    let finalizer = Finalizer {
        ctx,
        draft: Some(draft),
        status: status.as_u16(),
        affinity: affinity_binding,
        body_len: body_bytes.len() as u64,
        control: state.control.clone(),
        ledger: state.ledger.clone(),
        family: route.family,
        upstream: served_by.clone(),
        model: result
            .resolved_model
            .clone()
            .or_else(|| route.model.clone()),
        peer_addr,
        completed: false,
    };

    let relay = RelayState {
        body: resp_body,
        observer: is_sse.then(|| SseObserver::new(route.family)),
        capture: (!is_sse).then(|| BodyCapture::new(state.config.limits.recording_cap_bytes)),
        finalizer: Some(finalizer),
        // The attempt's total deadline covers the body too; the head has
        // already consumed part of it.
        deadline: tokio::time::Instant::now()
            + std::time::Duration::from_secs(served_by.timeout_seconds)
                .saturating_sub(std::time::Duration::from_millis(result.head_latency_ms)),
        request_start: Instant::now(),
        ttft_ms: None,
        is_sse,
        request_id,
        pending_tail: None,
        done: false,
        _cancel_on_drop: cancel.drop_guard(),
    };

    let response = Response::from_parts(resp_parts, relay_body(relay));
    Ok(response)
}

fn strip_proxy_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some("/");
    }
    rest.starts_with('/').then_some(rest)
}

fn content_length(headers: &http::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Whether the session header used for extraction was written by a
/// compensation rule rather than sent by the client.
fn session_header_was_compensated(
    original: &http::HeaderMap,
    effective: &http::HeaderMap,
    written_targets: &[String],
) -> bool {
    for name in classify::session::SESSION_HEADER_SOURCES {
        let present_effective = effective
            .get(name)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if !present_effective {
            continue;
        }
        // First non-empty source in the effective set is the one the
        // extractor used.
        let was_written = written_targets.iter().any(|t| t == name);
        let was_original = original.get(name).map(|v| !v.is_empty()).unwrap_or(false);
        return was_written && !was_original;
    }
    false
}

fn failover_error_response(
    ctx: RequestContext,
    mut draft: LogDraft,
    error: FailoverError,
    did_send: bool,
) -> Response<BoxBody> {
    let (code, message, stage) = match error {
        FailoverError::InvalidUpstreamUrl(detail) => (
            ErrorCode::InvalidUpstreamUrl,
            format!("upstream base url rejected: {detail}"),
            FailureStage::UpstreamConnect,
        ),
        FailoverError::DeadlineExceeded => (
            ErrorCode::RequestTimeout,
            "request deadline exceeded".to_string(),
            FailureStage::UpstreamResponse,
        ),
        FailoverError::Cancelled => (
            ErrorCode::ClientDisconnected,
            "client disconnected".to_string(),
            if did_send {
                FailureStage::StreamInterrupt
            } else {
                FailureStage::UpstreamConnect
            },
        ),
        FailoverError::Exhausted { last_stage } => (
            ErrorCode::AllUpstreamsUnavailable,
            "all upstreams failed".to_string(),
            last_stage,
        ),
    };

    draft.log.routing_decision.failure_stage = Some(stage);
    draft.finish_with_error(code.status().as_u16(), message.clone());

    let envelope = ErrorEnvelope::new(code, message).with_did_send_upstream(did_send);
    ctx.error_response_with(envelope)
}

// ---------------------------------------------------------------------------
// Response relay — streams upstream bytes to the client while observing
// them for usage, then finalizes the request record off the hot path.
// ---------------------------------------------------------------------------

struct RelayState {
    body: Incoming,
    observer: Option<SseObserver>,
    capture: Option<BodyCapture>,
    finalizer: Option<Finalizer>,
    deadline: tokio::time::Instant,
    request_start: Instant,
    ttft_ms: Option<u64>,
    is_sse: bool,
    request_id: String,
    /// A terminal frame (SSE error event) queued for emission before close.
    pending_tail: Option<Bytes>,
    done: bool,
    /// Aborts the upstream attempt if the relay is dropped mid-stream.
    _cancel_on_drop: tokio_util::sync::DropGuard,
}

fn relay_body(state: RelayState) -> BoxBody {
    let stream = stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            if let Some(tail) = st.pending_tail.take() {
                st.done = true;
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(tail));
                return Some((frame, st));
            }

            let next = tokio::time::timeout_at(st.deadline, st.body.frame()).await;
            match next {
                Err(_) => {
                    // Total deadline hit mid-stream. Failover is off the
                    // table once bytes have been flushed; terminate.
                    st.interrupt("upstream deadline exceeded mid-stream");
                    if st.pending_tail.is_none() {
                        return None;
                    }
                    continue;
                }
                Ok(None) => {
                    st.complete();
                    return None;
                }
                Ok(Some(Ok(frame))) => {
                    let Some(data) = frame.data_ref() else {
                        // Trailers and other non-data frames are dropped.
                        continue;
                    };
                    if st.ttft_ms.is_none() {
                        let ttft = st.request_start.elapsed().as_millis() as u64;
                        st.ttft_ms = Some(ttft);
                        metrics::histogram!("gateway_ttft_seconds")
                            .record(ttft as f64 / 1000.0);
                    }
                    if let Some(observer) = st.observer.as_mut() {
                        observer.observe(data);
                    }
                    if let Some(capture) = st.capture.as_mut() {
                        capture.observe(data);
                    }
                    return Some((Ok(frame), st));
                }
                Ok(Some(Err(e))) => {
                    st.interrupt(&format!("upstream stream error: {e}"));
                    if st.pending_tail.is_none() {
                        return None;
                    }
                    continue;
                }
            }
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

impl RelayState {
    /// Mid-stream failure after the first flush: emit the SSE terminal
    /// error event when the protocol supports it, then close.
    fn interrupt(&mut self, message: &str) {
        warn!("proxy: stream interrupted, reason={}", message);
        if self.is_sse {
            let envelope = ErrorEnvelope::new(ErrorCode::StreamError, message)
                .with_did_send_upstream(true)
                .with_request_id(self.request_id.clone());
            self.pending_tail = Some(Bytes::from(envelope.to_sse_frame()));
        } else {
            self.done = true;
        }
        let usage = self.observer.take().and_then(|o| o.finish());
        if let Some(f) = self.finalizer.as_mut() {
            f.complete_interrupted(usage, self.ttft_ms, message);
        }
    }

    /// Clean end of stream.
    fn complete(&mut self) {
        self.done = true;
        let usage = match (self.observer.take(), self.capture.take()) {
            (Some(observer), _) => observer.finish(),
            (None, Some(capture)) => capture.parse_json().and_then(|payload| {
                self.finalizer
                    .as_ref()
                    .map(|f| f.family_usage(&payload))
                    .unwrap_or(None)
            }),
            (None, None) => None,
        };
        if let Some(f) = self.finalizer.as_mut() {
            f.complete_ok(usage, self.ttft_ms);
        }
    }
}

/// Owns everything needed to close out the request record once the relay
/// ends, including when it ends by being dropped (client disconnect).
struct Finalizer {
    ctx: RequestContext,
    draft: Option<LogDraft>,
    status: u16,
    affinity: Option<(Arc<AffinityStore>, AffinityKey)>,
    body_len: u64,
    control: Arc<dyn ControlPlane>,
    ledger: Arc<SpendLedger>,
    family: ProtocolFamily,
    upstream: Arc<UpstreamConfig>,
    model: Option<String>,
    peer_addr: SocketAddr,
    completed: bool,
}

impl Finalizer {
    fn family_usage(&self, payload: &serde_json::Value) -> Option<UsageRecord> {
        crate::usage::from_response(self.family, payload)
    }

    fn complete_ok(&mut self, usage: Option<UsageRecord>, ttft_ms: Option<u64>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let Some(mut draft) = self.draft.take() else {
            return;
        };

        if let Some(usage) = usage.as_ref() {
            draft.log.tokens = usage.into();
            record_usage_metrics(&self.ctx.capability, usage);

            // Sticky-session bookkeeping counts only usage that was
            // actually delivered to the client.
            if let Some((store, key)) = self.affinity.as_ref() {
                store.record_success(
                    key.clone(),
                    &self.upstream.id,
                    self.body_len,
                    usage.prompt(),
                );
            }

            if let Some(model) = self.model.as_deref() {
                let price = self.control.resolve_model_price(model);
                let snapshot =
                    billing::build_snapshot(model, usage, &self.upstream, price.as_ref());
                self.ledger.record(&self.upstream.id, snapshot.final_cost);
                draft.log.billing = Some(snapshot);
            }
        } else if let Some((store, key)) = self.affinity.as_ref() {
            // No usage extracted (e.g. an extended route without token
            // accounting) — still bind the session to the serving upstream.
            store.record_success(key.clone(), &self.upstream.id, self.body_len, 0);
        }

        draft.log.ttft_ms = ttft_ms;
        draft.finish(self.status);
        self.emit_access_log(self.status, None);
        self.ctx.finalize_metrics(self.status);
    }

    fn complete_interrupted(
        &mut self,
        usage: Option<UsageRecord>,
        ttft_ms: Option<u64>,
        message: &str,
    ) {
        if self.completed {
            return;
        }
        self.completed = true;
        let Some(mut draft) = self.draft.take() else {
            return;
        };

        // Partial usage from a broken stream is recorded for diagnostics
        // but is neither billed nor added to the session's token total.
        if let Some(usage) = usage.as_ref() {
            draft.log.tokens = usage.into();
        }
        draft.log.ttft_ms = ttft_ms;
        draft.log.routing_decision.failure_stage = Some(FailureStage::StreamInterrupt);
        let status = ErrorCode::StreamError.status().as_u16();
        draft.finish_with_error(status, message);
        metrics::counter!("gateway_stream_errors_total").increment(1);
        self.emit_access_log(status, Some(message));
        self.ctx.finalize_metrics(status);
    }

    fn emit_access_log(&self, status: u16, error: Option<&str>) {
        tracing::info!(
            client = %self.peer_addr,
            method = %self.ctx.method,
            path = %self.ctx.path,
            status = status,
            capability = %self.ctx.capability,
            upstream = %self.ctx.upstream_id,
            latency_ms = %self.ctx.start.elapsed().as_millis(),
            error = error.unwrap_or(""),
            "access"
        );
    }
}

fn record_usage_metrics(capability: &str, usage: &UsageRecord) {
    metrics::counter!(
        "gateway_usage_tokens_total",
        "capability" => capability.to_string(),
        "direction" => "input",
    )
    .increment(usage.prompt());
    metrics::counter!(
        "gateway_usage_tokens_total",
        "capability" => capability.to_string(),
        "direction" => "output",
    )
    .increment(usage.completion());
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        // Client went away mid-stream: the draft's own drop records the
        // 499; metrics are closed out here.
        let status = StatusCode::from_u16(499)
            .map(|s| s.as_u16())
            .unwrap_or(499);
        self.emit_access_log(status, Some("client disconnected"));
        self.ctx.finalize_metrics(status);
    }
}
