use crate::error::{ErrorCode, ErrorEnvelope};
use crate::recorder::{FailureStage, LogSink, RequestLog, RoutingDecision, TokenCounts};
use crate::selector::{RoutingType, SelectionStrategy};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through all phases. Carries identity and
/// timing; the heavyweight diagnostic state lives in the `LogDraft`.
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub path: String,
    /// Capability tag once classified; empty until then. Used as the metric
    /// label so unclassified failures still aggregate.
    pub capability: String,
    pub upstream_id: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    pub is_stream: bool,
}

impl RequestContext {
    pub fn new(request_id: String, method: String, path: String) -> Self {
        metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);
        Self {
            request_id,
            method,
            path,
            capability: String::new(),
            upstream_id: String::new(),
            start: Instant::now(),
            upstream_start: None,
            is_stream: false,
        }
    }

    /// Build a canonical error response and record metrics in one place —
    /// the single exit point for all pre-stream error paths.
    pub fn error_response(&self, code: ErrorCode, message: &str) -> hyper::Response<BoxBody> {
        self.error_response_with(ErrorEnvelope::new(code, message))
    }

    pub fn error_response_with(&self, envelope: ErrorEnvelope) -> hyper::Response<BoxBody> {
        let code_status = self.status_for_envelope(&envelope).status();
        let envelope = envelope.with_request_id(self.request_id.clone());

        self.finalize_metrics(code_status.as_u16());

        hyper::Response::builder()
            .status(code_status)
            .header("content-type", "application/json")
            .header("x-request-id", self.request_id.as_str())
            .body(full_body(envelope.to_json()))
            .unwrap_or_else(|_| {
                hyper::Response::new(full_body(r#"{"error":{"message":"internal error"}}"#))
            })
    }

    fn status_for_envelope(&self, envelope: &ErrorEnvelope) -> ErrorCode {
        // The envelope stores the code as a string; map it back for status
        // selection. Unknown strings fall through to 503.
        match envelope.code {
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "UNSUPPORTED_ROUTE" => ErrorCode::UnsupportedRoute,
            "UPSTREAM_PIN_INCOMPATIBLE" => ErrorCode::UpstreamPinIncompatible,
            "INVALID_UPSTREAM_URL" => ErrorCode::InvalidUpstreamUrl,
            "PAYLOAD_TOO_LARGE" => ErrorCode::PayloadTooLarge,
            "NO_UPSTREAMS_CONFIGURED" => ErrorCode::NoUpstreamsConfigured,
            "NO_AUTHORIZED_UPSTREAMS" => ErrorCode::NoAuthorizedUpstreams,
            "ALL_UPSTREAMS_UNAVAILABLE" => ErrorCode::AllUpstreamsUnavailable,
            "REQUEST_TIMEOUT" => ErrorCode::RequestTimeout,
            "CLIENT_DISCONNECTED" => ErrorCode::ClientDisconnected,
            "STREAM_ERROR" => ErrorCode::StreamError,
            _ => ErrorCode::ServiceUnavailable,
        }
    }

    /// Record final request metrics. Called exactly once per request, on
    /// both success and error paths.
    pub fn finalize_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "gateway_http_requests_total",
            "capability" => self.capability.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream" => self.upstream_id.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "capability" => self.capability.clone(),
            "upstream" => self.upstream_id.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "capability" => self.capability.clone(),
                "upstream" => self.upstream_id.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}

/// A request log under construction. `finish` writes it to the sink exactly
/// once; dropping an unfinished draft records the request as a client
/// disconnect — that is how mid-stream aborts and cancelled handlers are
/// still accounted for.
pub struct LogDraft {
    sink: Arc<LogSink>,
    start: Instant,
    finished: bool,
    pub log: RequestLog,
}

impl LogDraft {
    pub fn new(sink: Arc<LogSink>, request_id: &str, method: &str, path: &str) -> Self {
        Self {
            sink,
            start: Instant::now(),
            finished: false,
            log: RequestLog {
                id: request_id.to_string(),
                api_key_id: String::new(),
                upstream_id: None,
                method: method.to_string(),
                path: path.to_string(),
                model: None,
                tokens: TokenCounts::default(),
                status_code: 0,
                duration_ms: 0,
                routing_duration_ms: 0,
                ttft_ms: None,
                is_stream: false,
                routing_type: RoutingType::None,
                group_name: None,
                lb_strategy: SelectionStrategy::Weighted,
                failover_attempts: 0,
                failover_history: Vec::new(),
                routing_decision: RoutingDecision::empty(),
                session_id: None,
                affinity_hit: false,
                affinity_migrated: false,
                session_id_compensated: false,
                header_diff: Default::default(),
                error_message: None,
                billing: None,
                created_at: crate::recorder::now_rfc3339(),
            },
        }
    }

    pub fn finish(mut self, status: u16) {
        self.log.status_code = status;
        self.write();
    }

    pub fn finish_with_error(mut self, status: u16, message: impl Into<String>) {
        self.log.status_code = status;
        self.log.error_message = Some(message.into());
        self.write();
    }

    fn write(&mut self) {
        self.finished = true;
        self.log.duration_ms = self.start.elapsed().as_millis() as u64;
        self.sink.write(self.log.clone());
    }
}

impl Drop for LogDraft {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.log.status_code = ErrorCode::ClientDisconnected.status().as_u16();
        self.log.error_message = Some("client disconnected".to_string());
        self.log.routing_decision.failure_stage = Some(if self.log.routing_decision.did_send_upstream {
            FailureStage::StreamInterrupt
        } else {
            FailureStage::CandidateSelection
        });
        self.write();
        metrics::counter!("gateway_client_disconnects_total").increment(1);
    }
}
