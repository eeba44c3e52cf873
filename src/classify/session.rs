use super::RouteCapability;
use http::HeaderMap;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Where the session id was found — recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Header,
    Body,
}

#[derive(Debug, Clone)]
pub struct SessionRef {
    pub id: String,
    pub source: SessionSource,
}

/// Header names probed for OpenAI-family session ids, in order.
pub const SESSION_HEADER_SOURCES: [&str; 3] = ["session_id", "x-session-id", "x_session_id"];

fn anthropic_session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"session_([0-9a-fA-F-]{36})").expect("anthropic session regex")
    })
}

/// Extract the logical session id for affinity, using the capability's
/// strategy:
///
/// - Anthropic: `session_<uuid>` embedded in `metadata.user_id`.
/// - OpenAI / Codex: session headers first, then body fields
///   (`prompt_cache_key`, `metadata.session_id`, `previous_response_id`).
/// - Gemini: none — affinity is disabled for that family.
pub fn extract_session(
    capability: RouteCapability,
    headers: &HeaderMap,
    body: &Value,
) -> Option<SessionRef> {
    match capability {
        RouteCapability::AnthropicMessages => extract_anthropic(body),
        RouteCapability::OpenaiChatCompatible
        | RouteCapability::OpenaiExtended
        | RouteCapability::CodexResponses => extract_openai(headers, body),
        RouteCapability::GeminiNativeGenerate | RouteCapability::GeminiCodeAssistInternal => None,
    }
}

fn extract_anthropic(body: &Value) -> Option<SessionRef> {
    let user_id = body.get("metadata")?.get("user_id")?.as_str()?;
    let captured = anthropic_session_re().captures(user_id)?.get(1)?;
    Some(SessionRef {
        id: captured.as_str().to_ascii_lowercase(),
        source: SessionSource::Body,
    })
}

fn extract_openai(headers: &HeaderMap, body: &Value) -> Option<SessionRef> {
    for name in SESSION_HEADER_SOURCES {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !v.is_empty() {
                return Some(SessionRef {
                    id: v.to_string(),
                    source: SessionSource::Header,
                });
            }
        }
    }

    let body_fields = [
        body.get("prompt_cache_key"),
        body.get("metadata").and_then(|m| m.get("session_id")),
        body.get("previous_response_id"),
    ];
    for field in body_fields.into_iter().flatten() {
        if let Some(s) = field.as_str() {
            if !s.is_empty() {
                return Some(SessionRef {
                    id: s.to_string(),
                    source: SessionSource::Body,
                });
            }
        }
    }
    None
}
