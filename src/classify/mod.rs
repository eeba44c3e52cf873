pub mod session;

pub use session::{extract_session, SessionRef, SessionSource};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of route capabilities. Each one pins a wire-format family and
/// a session-extraction strategy; an upstream declares the capabilities it
/// can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCapability {
    AnthropicMessages,
    OpenaiChatCompatible,
    OpenaiExtended,
    CodexResponses,
    GeminiNativeGenerate,
    GeminiCodeAssistInternal,
}

impl RouteCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteCapability::AnthropicMessages => "anthropic_messages",
            RouteCapability::OpenaiChatCompatible => "openai_chat_compatible",
            RouteCapability::OpenaiExtended => "openai_extended",
            RouteCapability::CodexResponses => "codex_responses",
            RouteCapability::GeminiNativeGenerate => "gemini_native_generate",
            RouteCapability::GeminiCodeAssistInternal => "gemini_code_assist_internal",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "anthropic_messages" => Some(RouteCapability::AnthropicMessages),
            "openai_chat_compatible" => Some(RouteCapability::OpenaiChatCompatible),
            "openai_extended" => Some(RouteCapability::OpenaiExtended),
            "codex_responses" => Some(RouteCapability::CodexResponses),
            "gemini_native_generate" => Some(RouteCapability::GeminiNativeGenerate),
            "gemini_code_assist_internal" => Some(RouteCapability::GeminiCodeAssistInternal),
            _ => None,
        }
    }

    pub fn protocol_family(&self) -> ProtocolFamily {
        match self {
            RouteCapability::AnthropicMessages => ProtocolFamily::Anthropic,
            RouteCapability::OpenaiChatCompatible
            | RouteCapability::OpenaiExtended
            | RouteCapability::CodexResponses => ProtocolFamily::Openai,
            RouteCapability::GeminiNativeGenerate | RouteCapability::GeminiCodeAssistInternal => {
                ProtocolFamily::Gemini
            }
        }
    }
}

impl std::fmt::Display for RouteCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-format family — decides credential header shape and how usage is
/// extracted from responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    Anthropic,
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMatchSource {
    Path,
    ModelFallback,
}

/// Classifier output: everything downstream stages need to know about the
/// shape of the request.
#[derive(Debug, Clone)]
pub struct RouteClass {
    pub capability: RouteCapability,
    pub family: ProtocolFamily,
    pub model: Option<String>,
    pub stream_requested: bool,
    pub match_source: RouteMatchSource,
}

/// Map `(path, query, body shape)` under the proxy prefix to a route
/// capability.
///
/// Path suffix matching wins; when the path is ambiguous the body's `model`
/// vendor prefix decides. No match is a 404-level failure — the gateway
/// refuses to guess a wire format.
pub fn classify(sub_path: &str, query: Option<&str>, body: &Value) -> Option<RouteClass> {
    let model = extract_model(body);
    let stream_requested = stream_requested(sub_path, query, body);

    if let Some(capability) = match_path(sub_path) {
        return Some(RouteClass {
            capability,
            family: capability.protocol_family(),
            model,
            stream_requested,
            match_source: RouteMatchSource::Path,
        });
    }

    let capability = model.as_deref().and_then(capability_from_model)?;
    Some(RouteClass {
        capability,
        family: capability.protocol_family(),
        model,
        stream_requested,
        match_source: RouteMatchSource::ModelFallback,
    })
}

/// Fixed path-suffix table. Order matters: the Gemini internal surface is
/// checked before the public `v1beta` one, and `/chat/completions` before
/// the bare `/completions` fallback.
fn match_path(sub_path: &str) -> Option<RouteCapability> {
    let path = sub_path.split('?').next().unwrap_or(sub_path);

    if path.contains("/v1internal") {
        return Some(RouteCapability::GeminiCodeAssistInternal);
    }
    if path.contains("/v1beta/")
        && (path.ends_with(":generateContent") || path.ends_with(":streamGenerateContent"))
    {
        return Some(RouteCapability::GeminiNativeGenerate);
    }
    if path.ends_with("/messages") {
        return Some(RouteCapability::AnthropicMessages);
    }
    if path.ends_with("/chat/completions") {
        return Some(RouteCapability::OpenaiChatCompatible);
    }
    if path.ends_with("/responses") {
        return Some(RouteCapability::CodexResponses);
    }
    if path.ends_with("/completions") || path.ends_with("/embeddings") {
        return Some(RouteCapability::OpenaiExtended);
    }
    None
}

/// Vendor prefix → family, for paths the table does not recognize.
fn capability_from_model(model: &str) -> Option<RouteCapability> {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        return Some(RouteCapability::AnthropicMessages);
    }
    if m.starts_with("gemini") {
        return Some(RouteCapability::GeminiNativeGenerate);
    }
    if m.starts_with("gpt")
        || m.starts_with("chatgpt")
        || m.starts_with("o1")
        || m.starts_with("o3")
        || m.starts_with("o4")
    {
        return Some(RouteCapability::OpenaiChatCompatible);
    }
    None
}

fn extract_model(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// `stream: true`, vendor stream markers, or the `alt=sse` query form.
fn stream_requested(sub_path: &str, query: Option<&str>, body: &Value) -> bool {
    if sub_path.ends_with(":streamGenerateContent") {
        return true;
    }
    if let Some(q) = query {
        if q.split('&').any(|kv| kv == "alt=sse") {
            return true;
        }
    }
    if body.get("stream").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    if body.get("stream_options").map(|v| !v.is_null()).unwrap_or(false) {
        return true;
    }
    body.get("sse").and_then(|v| v.as_bool()) == Some(true)
}
