use crate::classify::{ProtocolFamily, RouteCapability};
use crate::config::{CompensationMode, CompensationRuleConfig, KeepalivePoolConfig, UpstreamConfig};
use crate::proxy::context::{full_body, BoxBody};
use crate::ssrf::{SsrfError, SsrfPolicy};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Per-attempt failure, classified for the failover loop.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// URL failed SSRF validation — 400, never failover-eligible.
    #[error("ssrf rejection: {0}")]
    Ssrf(#[from] SsrfError),

    #[error("failed to build upstream request: {0}")]
    BuildRequest(String),

    /// Connection-level failure before any byte reached the upstream.
    #[error("upstream connect error: {0}")]
    Connect(String),

    /// Per-attempt deadline exceeded.
    #[error("upstream timeout")]
    Timeout,

    /// Inbound client went away; abort without recording a failure.
    #[error("client cancelled")]
    Cancelled,
}

/// Builds and dispatches one outbound attempt. Owns the shared connection
/// pool; per-upstream state (credentials, redirects, timeouts) arrives with
/// each call.
pub struct ProxyEngine {
    client: HttpClient,
    ssrf: SsrfPolicy,
}

impl ProxyEngine {
    pub fn new(pool: &KeepalivePoolConfig, ssrf: SsrfPolicy) -> Self {
        Self {
            client: build_http_client(pool),
            ssrf,
        }
    }

    pub fn ssrf(&self) -> &SsrfPolicy {
        &self.ssrf
    }

    /// Dispatch one attempt. The URI is re-validated (including a fresh DNS
    /// resolution) on every call — an admin-edited base URL that now points
    /// somewhere private is caught here, not just at creation.
    pub async fn forward(
        &self,
        upstream: &UpstreamConfig,
        method: &Method,
        sub_path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> Result<Response<Incoming>, AttemptError> {
        let uri = build_upstream_uri(&upstream.base_url, sub_path, query)
            .map_err(AttemptError::BuildRequest)?;

        self.ssrf.validate_uri(&uri).await?;

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(full_body(body))
            .map_err(|e| AttemptError::BuildRequest(e.to_string()))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.client.request(request)) => {
                match result {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(AttemptError::Connect(e.to_string())),
                    Err(_) => Err(AttemptError::Timeout),
                }
            }
        }
    }
}

/// One shared pooled client for all upstreams. TLS is always verified
/// against webpki roots — upstreams here are public provider APIs, not
/// mesh-internal services.
fn build_http_client(pool: &KeepalivePoolConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(pool.idle_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs(pool.connect_timeout_secs)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool.idle_timeout))
        .pool_max_idle_per_host(pool.size)
        .build(https)
}

/// Headers that never cross the proxy boundary: hop-by-hop headers, inbound
/// credentials (the gateway key must not leak upstream), and gateway
/// control headers.
const BLOCKED_OUTBOUND: [&str; 12] = [
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "te",
    "trailers",
    "upgrade",
];

pub fn is_blocked_outbound(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    BLOCKED_OUTBOUND.contains(&lower.as_str()) || lower.starts_with("x-upstream-")
}

/// Assemble the outbound header set: inbound headers minus the block-list,
/// the upstream credential in the family-appropriate header, and a
/// deterministic request id.
pub fn prepare_outbound_headers(
    effective_inbound: &HeaderMap,
    family: ProtocolFamily,
    credential: &str,
    request_id: &str,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(effective_inbound.len() + 3);
    for (name, value) in effective_inbound {
        if !is_blocked_outbound(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }

    match family {
        ProtocolFamily::Openai => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {credential}")) {
                out.insert(http::header::AUTHORIZATION, v);
            }
        }
        ProtocolFamily::Anthropic => {
            if let Ok(v) = HeaderValue::from_str(credential) {
                out.insert(HeaderName::from_static("x-api-key"), v);
            }
            if !out.contains_key("anthropic-version") {
                out.insert(
                    HeaderName::from_static("anthropic-version"),
                    HeaderValue::from_static("2023-06-01"),
                );
            }
        }
        ProtocolFamily::Gemini => {
            if let Ok(v) = HeaderValue::from_str(credential) {
                out.insert(HeaderName::from_static("x-goog-api-key"), v);
            }
        }
    }

    if let Ok(v) = HeaderValue::from_str(request_id) {
        out.insert(HeaderName::from_static("x-request-id"), v);
    }

    out
}

/// Apply compensation rules in place. Returns the target header names that
/// were written, so callers can tell whether the session id was supplied by
/// a rule rather than the client.
///
/// A rule whose target sits on the outbound block-list is dropped silently.
pub fn apply_compensation_rules(
    headers: &mut HeaderMap,
    capability: RouteCapability,
    rules: &[CompensationRuleConfig],
) -> Vec<String> {
    let mut written = Vec::new();
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if !rule.capabilities.is_empty() && !rule.capabilities.contains(&capability) {
            continue;
        }
        if is_blocked_outbound(&rule.target_header) {
            continue;
        }
        let Ok(target) = HeaderName::from_bytes(rule.target_header.as_bytes()) else {
            continue;
        };
        if rule.mode == CompensationMode::MissingOnly && headers.contains_key(&target) {
            continue;
        }
        let source_value = rule.sources.iter().find_map(|source| {
            headers
                .get(source.as_str())
                .filter(|v| !v.is_empty())
                .cloned()
        });
        if let Some(value) = source_value {
            headers.insert(target, value);
            written.push(rule.target_header.clone());
        }
    }
    written
}

/// Rewrite the body's `model` field through the upstream's redirect map.
/// Returns `(original, redirected)` when a rewrite happened. Applying the
/// map twice is a no-op as long as the redirect target is not itself a
/// redirect source.
pub fn apply_model_redirect(
    body: &mut serde_json::Value,
    redirects: &HashMap<String, String>,
) -> Option<(String, String)> {
    if redirects.is_empty() {
        return None;
    }
    let model = body.get("model")?.as_str()?.to_string();
    let target = redirects.get(&model)?.clone();
    if target == model {
        return None;
    }
    body["model"] = serde_json::Value::String(target.clone());
    Some((model, target))
}

/// `base_url` origin (plus optional path prefix) + the original sub-path
/// after the proxy prefix. The query string passes through untouched.
pub fn build_upstream_uri(
    base_url: &str,
    sub_path: &str,
    query: Option<&str>,
) -> Result<Uri, String> {
    let base: Uri = base_url.parse().map_err(|e| format!("base url: {e}"))?;
    let scheme = base.scheme_str().ok_or("base url has no scheme")?;
    let authority = base.authority().ok_or("base url has no authority")?;

    let base_path = base.path().trim_end_matches('/');
    let mut path_and_query = String::with_capacity(
        base_path.len() + sub_path.len() + query.map(|q| q.len() + 1).unwrap_or(0),
    );
    path_and_query.push_str(base_path);
    if !sub_path.starts_with('/') {
        path_and_query.push('/');
    }
    path_and_query.push_str(sub_path);
    if let Some(q) = query {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| format!("upstream uri: {e}"))
}

/// Strip hop-by-hop headers from an upstream response before relaying it.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in hop_headers {
        headers.remove(h);
    }
    // Content-Length is recomputed by hyper from the relayed body.
    headers.remove(CONTENT_LENGTH);
    headers.remove(HOST);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upstream_uri_joins_prefix() {
        let uri =
            build_upstream_uri("https://api.example.com/openai", "/v1/chat/completions", None)
                .unwrap();
        assert_eq!(uri.to_string(), "https://api.example.com/openai/v1/chat/completions");

        let uri = build_upstream_uri("https://api.example.com", "/v1/messages", Some("beta=true"))
            .unwrap();
        assert_eq!(uri.to_string(), "https://api.example.com/v1/messages?beta=true");
    }

    #[test]
    fn test_outbound_headers_strip_gateway_credentials() {
        let mut inbound = HeaderMap::new();
        inbound.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-gateway-key"),
        );
        inbound.insert("x-api-key", HeaderValue::from_static("sk-gateway-key"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        inbound.insert("x-upstream-name", HeaderValue::from_static("pin"));

        let out = prepare_outbound_headers(
            &inbound,
            ProtocolFamily::Openai,
            "sk-upstream",
            "req-1",
        );
        assert_eq!(out.get("authorization").unwrap(), "Bearer sk-upstream");
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("x-upstream-name").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-request-id").unwrap(), "req-1");
    }

    #[test]
    fn test_anthropic_credential_and_version() {
        let inbound = HeaderMap::new();
        let out = prepare_outbound_headers(
            &inbound,
            ProtocolFamily::Anthropic,
            "sk-ant",
            "req-1",
        );
        assert_eq!(out.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(out.get("anthropic-version").unwrap(), "2023-06-01");

        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-version", HeaderValue::from_static("2024-10-22"));
        let out = prepare_outbound_headers(
            &inbound,
            ProtocolFamily::Anthropic,
            "sk-ant",
            "req-1",
        );
        assert_eq!(out.get("anthropic-version").unwrap(), "2024-10-22");
    }

    #[test]
    fn test_gemini_credential_header() {
        let out = prepare_outbound_headers(
            &HeaderMap::new(),
            ProtocolFamily::Gemini,
            "sk-goog",
            "req-1",
        );
        assert_eq!(out.get("x-goog-api-key").unwrap(), "sk-goog");
    }

    fn rule(
        target: &str,
        sources: &[&str],
        mode: CompensationMode,
    ) -> CompensationRuleConfig {
        CompensationRuleConfig {
            id: "r1".into(),
            capabilities: vec![],
            sources: sources.iter().map(|s| s.to_string()).collect(),
            target_header: target.into(),
            mode,
            enabled: true,
            builtin: false,
        }
    }

    #[test]
    fn test_compensation_missing_only_is_idempotent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("s1"));
        let rules = vec![rule(
            "session_id",
            &["x-session-id"],
            CompensationMode::MissingOnly,
        )];

        let written =
            apply_compensation_rules(&mut headers, RouteCapability::OpenaiChatCompatible, &rules);
        assert_eq!(written, vec!["session_id"]);
        assert_eq!(headers.get("session_id").unwrap(), "s1");
        let snapshot = headers.clone();

        // Second application changes nothing.
        let written =
            apply_compensation_rules(&mut headers, RouteCapability::OpenaiChatCompatible, &rules);
        assert!(written.is_empty());
        assert_eq!(headers, snapshot);
    }

    #[test]
    fn test_compensation_always_overwrites() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("new"));
        headers.insert("session_id", HeaderValue::from_static("old"));
        let rules = vec![rule("session_id", &["x-session-id"], CompensationMode::Always)];
        apply_compensation_rules(&mut headers, RouteCapability::OpenaiChatCompatible, &rules);
        assert_eq!(headers.get("session_id").unwrap(), "new");
    }

    #[test]
    fn test_compensation_blocked_target_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-source", HeaderValue::from_static("v"));
        let rules = vec![rule("authorization", &["x-source"], CompensationMode::Always)];
        let written =
            apply_compensation_rules(&mut headers, RouteCapability::OpenaiChatCompatible, &rules);
        assert!(written.is_empty());
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_compensation_capability_scoped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("s1"));
        let mut scoped = rule("session_id", &["x-session-id"], CompensationMode::MissingOnly);
        scoped.capabilities = vec![RouteCapability::CodexResponses];
        let rules = vec![scoped];
        let written =
            apply_compensation_rules(&mut headers, RouteCapability::AnthropicMessages, &rules);
        assert!(written.is_empty());
    }

    #[test]
    fn test_model_redirect() {
        let mut body = serde_json::json!({"model": "gpt-4o", "messages": []});
        let mut redirects = HashMap::new();
        redirects.insert("gpt-4o".to_string(), "gpt-4o-mini".to_string());

        let applied = apply_model_redirect(&mut body, &redirects).unwrap();
        assert_eq!(applied, ("gpt-4o".to_string(), "gpt-4o-mini".to_string()));
        assert_eq!(body["model"], "gpt-4o-mini");

        // Idempotent when the target is not itself redirected.
        assert!(apply_model_redirect(&mut body, &redirects).is_none());
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_model_redirect_absent_model() {
        let mut body = serde_json::json!({"messages": []});
        let mut redirects = HashMap::new();
        redirects.insert("a".to_string(), "b".to_string());
        assert!(apply_model_redirect(&mut body, &redirects).is_none());
    }
}
