use crate::classify::ProtocolFamily;
use crate::config::{CircuitBreakerConfig, UpstreamConfig};
use crate::proxy::engine::{self, AttemptError, ProxyEngine};
use crate::recorder::{FailoverAttempt, FailoverErrorType, FailureStage};
use crate::selector::Selection;
use crate::upstream::{BreakerCheck, HealthRegistry};
use bytes::Bytes;
use http::{HeaderMap, Method};
use hyper::body::Incoming;
use hyper::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How one attempt's result steers the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx — serve it.
    Success,
    /// Try the next candidate.
    Retriable(FailoverErrorType),
    /// 4xx that belongs to the caller — return verbatim, stop the loop.
    FatalClient,
}

/// Status classification: 5xx and 429 are upstream problems worth retrying;
/// 408/409/425 sit in the retriable band too (they are transient by
/// definition); every other 4xx is the caller's and is never retried.
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        429 => Outcome::Retriable(FailoverErrorType::Http429),
        500..=599 => Outcome::Retriable(FailoverErrorType::Http5xx),
        408 | 409 | 425 => Outcome::Retriable(FailoverErrorType::Http4xx),
        400..=499 => Outcome::FatalClient,
        // 1xx/3xx pass through untouched, like a fatal-client response.
        _ => Outcome::FatalClient,
    }
}

/// Terminal failure of the whole loop.
#[derive(Debug)]
pub enum FailoverError {
    /// SSRF rejection — 400 before the attempt is recorded.
    InvalidUpstreamUrl(String),
    /// The request-wide deadline expired with nothing sent to the client.
    DeadlineExceeded,
    /// Inbound client went away mid-loop.
    Cancelled,
    /// Every candidate failed retriably.
    Exhausted { last_stage: FailureStage },
}

pub struct FailoverInput<'a> {
    pub engine: &'a ProxyEngine,
    pub registry: &'a HealthRegistry,
    pub selection: &'a Selection,
    pub default_breaker: &'a CircuitBreakerConfig,
    pub method: &'a Method,
    pub sub_path: &'a str,
    pub query: Option<&'a str>,
    /// Inbound headers with compensation rules already applied.
    pub effective_headers: &'a HeaderMap,
    pub body_bytes: Bytes,
    pub body_json: Option<&'a serde_json::Value>,
    pub family: ProtocolFamily,
    pub request_id: &'a str,
    pub deadline_slack: Duration,
    pub cancel: &'a CancellationToken,
}

pub struct FailoverResult {
    /// The served response and the upstream that produced it. `None` when
    /// the loop failed outright.
    pub response: Option<(Response<Incoming>, Arc<UpstreamConfig>)>,
    pub attempts: Vec<FailoverAttempt>,
    pub did_send_upstream: bool,
    pub error: Option<FailoverError>,
    /// True when the served response is a fatal 4xx relayed verbatim.
    pub fatal_passthrough: bool,
    /// Model actually sent to the serving upstream (after redirects).
    pub resolved_model: Option<String>,
    pub model_redirect_applied: bool,
    /// Time to response head for the served attempt.
    pub head_latency_ms: u64,
}

/// Drive one request through the ordered candidate list.
pub async fn run(input: FailoverInput<'_>) -> FailoverResult {
    let mut attempts: Vec<FailoverAttempt> = Vec::new();
    let mut did_send = false;
    let mut any_dispatched = false;

    // Request-wide deadline: the slowest candidate's budget plus slack, so
    // a full failover sweep cannot run unbounded.
    let max_timeout = input
        .selection
        .candidates
        .iter()
        .map(|u| u.timeout_seconds)
        .max()
        .unwrap_or(60);
    let overall_deadline =
        Instant::now() + Duration::from_secs(max_timeout) + input.deadline_slack;

    let mut result_model: Option<String> = None;
    let mut result_redirected = false;

    for candidate in &input.selection.candidates {
        let breaker = breaker_for(candidate, input.default_breaker);

        let remaining = overall_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return FailoverResult {
                response: None,
                attempts,
                did_send_upstream: did_send,
                error: Some(FailoverError::DeadlineExceeded),
                fatal_passthrough: false,
                resolved_model: result_model,
                model_redirect_applied: result_redirected,
                head_latency_ms: 0,
            };
        }

        match input.registry.check(&candidate.id, breaker) {
            BreakerCheck::Allowed | BreakerCheck::Probe => {}
            BreakerCheck::Rejected => {
                attempts.push(attempt_record(
                    candidate,
                    FailoverErrorType::CircuitOpen,
                    None,
                    Some("circuit open".to_string()),
                    0,
                ));
                continue;
            }
        }

        // Per-candidate model redirect; the body is recomputed only when a
        // redirect actually applies.
        let (body, model, redirected) = candidate_body(
            candidate,
            &input.body_bytes,
            input.body_json,
        );
        result_model = model.clone();
        result_redirected = redirected;

        let credential = match crate::auth::CredentialVault::decrypt(&candidate.credential) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(
                    "failover: credential decrypt failed, upstream={}, error={}",
                    candidate.id,
                    e
                );
                attempts.push(attempt_record(
                    candidate,
                    FailoverErrorType::ConnectionError,
                    None,
                    Some("credential unavailable".to_string()),
                    0,
                ));
                continue;
            }
        };

        let headers = engine::prepare_outbound_headers(
            input.effective_headers,
            input.family,
            &credential,
            input.request_id,
        );

        let per_attempt = Duration::from_secs(candidate.timeout_seconds).min(remaining);
        let attempt_deadline = tokio::time::Instant::now() + per_attempt;
        let attempt_start = Instant::now();

        input.registry.record_connection(&candidate.id);
        let outcome = input
            .engine
            .forward(
                candidate,
                input.method,
                input.sub_path,
                input.query,
                &headers,
                body,
                attempt_deadline,
                input.cancel,
            )
            .await;
        input.registry.release_connection(&candidate.id);

        let elapsed_ms = attempt_start.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                any_dispatched = true;
                did_send = true;
                let status = response.status().as_u16();
                match classify_status(status) {
                    Outcome::Success => {
                        input.registry.mark_healthy(&candidate.id, elapsed_ms);
                        return FailoverResult {
                            response: Some((response, candidate.clone())),
                            attempts,
                            did_send_upstream: true,
                            error: None,
                            fatal_passthrough: false,
                            resolved_model: result_model,
                            model_redirect_applied: result_redirected,
                            head_latency_ms: elapsed_ms,
                        };
                    }
                    Outcome::Retriable(error_type) => {
                        input
                            .registry
                            .mark_unhealthy(&candidate.id, breaker, error_type_label(error_type));
                        record_retry_metric(error_type);
                        attempts.push(attempt_record(
                            candidate,
                            error_type,
                            Some(status),
                            None,
                            elapsed_ms,
                        ));
                        continue;
                    }
                    Outcome::FatalClient => {
                        // The caller's problem — relay verbatim, never burn
                        // further candidates, never punish the upstream.
                        attempts.push(attempt_record(
                            candidate,
                            FailoverErrorType::Http4xx,
                            Some(status),
                            None,
                            elapsed_ms,
                        ));
                        return FailoverResult {
                            response: Some((response, candidate.clone())),
                            attempts,
                            did_send_upstream: true,
                            error: None,
                            fatal_passthrough: true,
                            resolved_model: result_model,
                            model_redirect_applied: result_redirected,
                            head_latency_ms: elapsed_ms,
                        };
                    }
                }
            }
            Err(AttemptError::Ssrf(e)) => {
                // Not failover-eligible and not recorded as an attempt.
                tracing::warn!(
                    "failover: ssrf rejection, upstream={}, error={}",
                    candidate.id,
                    e
                );
                return FailoverResult {
                    response: None,
                    attempts,
                    did_send_upstream: did_send,
                    error: Some(FailoverError::InvalidUpstreamUrl(e.to_string())),
                    fatal_passthrough: false,
                    resolved_model: result_model,
                    model_redirect_applied: result_redirected,
                    head_latency_ms: 0,
                };
            }
            Err(AttemptError::Cancelled) => {
                return FailoverResult {
                    response: None,
                    attempts,
                    did_send_upstream: did_send,
                    error: Some(FailoverError::Cancelled),
                    fatal_passthrough: false,
                    resolved_model: result_model,
                    model_redirect_applied: result_redirected,
                    head_latency_ms: 0,
                };
            }
            Err(AttemptError::Timeout) => {
                any_dispatched = true;
                did_send = true;
                input
                    .registry
                    .mark_unhealthy(&candidate.id, breaker, "timeout");
                record_retry_metric(FailoverErrorType::Timeout);
                attempts.push(attempt_record(
                    candidate,
                    FailoverErrorType::Timeout,
                    None,
                    Some(format!("deadline {}s exceeded", candidate.timeout_seconds)),
                    elapsed_ms,
                ));
                continue;
            }
            Err(AttemptError::Connect(message)) | Err(AttemptError::BuildRequest(message)) => {
                input
                    .registry
                    .mark_unhealthy(&candidate.id, breaker, "connection_error");
                record_retry_metric(FailoverErrorType::ConnectionError);
                attempts.push(attempt_record(
                    candidate,
                    FailoverErrorType::ConnectionError,
                    None,
                    Some(message),
                    elapsed_ms,
                ));
                continue;
            }
        }
    }

    FailoverResult {
        response: None,
        attempts,
        did_send_upstream: did_send,
        error: Some(FailoverError::Exhausted {
            last_stage: if any_dispatched {
                FailureStage::UpstreamResponse
            } else {
                FailureStage::UpstreamConnect
            },
        }),
        fatal_passthrough: false,
        resolved_model: result_model,
        model_redirect_applied: result_redirected,
        head_latency_ms: 0,
    }
}

pub fn breaker_for<'a>(
    upstream: &'a UpstreamConfig,
    default_breaker: &'a CircuitBreakerConfig,
) -> &'a CircuitBreakerConfig {
    upstream.circuit_breaker.as_ref().unwrap_or(default_breaker)
}

fn candidate_body(
    candidate: &UpstreamConfig,
    body_bytes: &Bytes,
    body_json: Option<&serde_json::Value>,
) -> (Bytes, Option<String>, bool) {
    let model = body_json
        .and_then(|b| b.get("model"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string());

    if candidate.model_redirects.is_empty() {
        return (body_bytes.clone(), model, false);
    }
    let Some(json) = body_json else {
        return (body_bytes.clone(), model, false);
    };

    let mut rewritten = json.clone();
    match engine::apply_model_redirect(&mut rewritten, &candidate.model_redirects) {
        Some((_, redirected)) => match serde_json::to_vec(&rewritten) {
            Ok(bytes) => (Bytes::from(bytes), Some(redirected), true),
            Err(_) => (body_bytes.clone(), model, false),
        },
        None => (body_bytes.clone(), model, false),
    }
}

fn attempt_record(
    upstream: &UpstreamConfig,
    error_type: FailoverErrorType,
    status_code: Option<u16>,
    error_message: Option<String>,
    duration_ms: u64,
) -> FailoverAttempt {
    FailoverAttempt {
        upstream_id: upstream.id.clone(),
        upstream_name: upstream.name.clone(),
        attempted_at: crate::recorder::now_rfc3339(),
        error_type,
        status_code,
        error_message,
        duration_ms,
    }
}

fn error_type_label(error_type: FailoverErrorType) -> &'static str {
    match error_type {
        FailoverErrorType::Timeout => "timeout",
        FailoverErrorType::Http5xx => "http_5xx",
        FailoverErrorType::Http429 => "http_429",
        FailoverErrorType::Http4xx => "http_4xx",
        FailoverErrorType::ConnectionError => "connection_error",
        FailoverErrorType::CircuitOpen => "circuit_open",
        FailoverErrorType::NoCandidates => "no_candidates",
    }
}

fn record_retry_metric(error_type: FailoverErrorType) {
    metrics::counter!(
        "gateway_failover_attempts_total",
        "reason" => error_type_label(error_type),
    )
    .increment(1);
}
