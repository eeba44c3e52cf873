use http::StatusCode;
use serde::Serialize;

/// Closed set of canonical gateway error codes with stable HTTP mappings.
///
/// Every client-visible failure funnels through one of these; upstream 4xx
/// bodies are the only responses returned verbatim without this envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    UnsupportedRoute,
    UpstreamPinIncompatible,
    InvalidUpstreamUrl,
    PayloadTooLarge,
    NoUpstreamsConfigured,
    NoAuthorizedUpstreams,
    AllUpstreamsUnavailable,
    RequestTimeout,
    ClientDisconnected,
    StreamError,
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::UnsupportedRoute => StatusCode::NOT_FOUND,
            ErrorCode::UpstreamPinIncompatible => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidUpstreamUrl => StatusCode::BAD_REQUEST,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::NoUpstreamsConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NoAuthorizedUpstreams => StatusCode::FORBIDDEN,
            ErrorCode::AllUpstreamsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            // 499 is the nginx convention for "client closed request".
            ErrorCode::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ErrorCode::StreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::UnsupportedRoute => "UNSUPPORTED_ROUTE",
            ErrorCode::UpstreamPinIncompatible => "UPSTREAM_PIN_INCOMPATIBLE",
            ErrorCode::InvalidUpstreamUrl => "INVALID_UPSTREAM_URL",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::NoUpstreamsConfigured => "NO_UPSTREAMS_CONFIGURED",
            ErrorCode::NoAuthorizedUpstreams => "NO_AUTHORIZED_UPSTREAMS",
            ErrorCode::AllUpstreamsUnavailable => "ALL_UPSTREAMS_UNAVAILABLE",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::ClientDisconnected => "CLIENT_DISCONNECTED",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    /// The `type` field of the envelope — coarse grouping clients can
    /// branch on without enumerating every code.
    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "authentication_error",
            ErrorCode::UnsupportedRoute
            | ErrorCode::UpstreamPinIncompatible
            | ErrorCode::InvalidUpstreamUrl
            | ErrorCode::PayloadTooLarge => "invalid_request",
            ErrorCode::NoAuthorizedUpstreams => "permission_error",
            ErrorCode::NoUpstreamsConfigured
            | ErrorCode::AllUpstreamsUnavailable
            | ErrorCode::ServiceUnavailable => "upstream_unavailable",
            ErrorCode::RequestTimeout => "timeout_error",
            ErrorCode::ClientDisconnected => "client_error",
            ErrorCode::StreamError => "stream_error",
        }
    }
}

/// The single canonical error body shape, serialized as
/// `{"error": {"message", "type", "code", ...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did_send_upstream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_hint: Option<String>,
}

#[derive(Serialize)]
struct Wrapped<'a> {
    error: &'a ErrorEnvelope,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: code.error_type(),
            code: code.as_str(),
            reason: None,
            did_send_upstream: None,
            request_id: None,
            user_hint: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_did_send_upstream(mut self, sent: bool) -> Self {
        self.did_send_upstream = Some(sent);
        self
    }

    pub fn with_user_hint(mut self, hint: impl Into<String>) -> Self {
        self.user_hint = Some(hint.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&Wrapped { error: self })
            .unwrap_or_else(|_| r#"{"error":{"message":"internal error"}}"#.to_string())
    }

    /// SSE terminal form: the same JSON as an `error` event, after which the
    /// stream must be closed.
    pub fn to_sse_frame(&self) -> String {
        format!("event: error\ndata: {}\n\n", self.to_json())
    }
}

/// Internal error kinds used along the request path before they are mapped
/// to a canonical envelope.
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum GatewayError {
    #[error("classification failed: {0}")]
    Classification(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("no candidates: {0}")]
    CandidateEmpty(String),

    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("upstream fatal response: status={0}")]
    UpstreamFatal(u16),

    #[error("client cancelled")]
    ClientCancelled,

    #[error("stream broken: {0}")]
    StreamBroken(String),

    #[error("internal error: {0}")]
    Internal(String),
}
