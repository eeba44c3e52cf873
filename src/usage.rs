use crate::classify::ProtocolFamily;
use serde::Serialize;
use serde_json::Value;

/// Normalized token usage. Vendor payloads are mapped into this record at
/// the extraction boundary; raw JSON never travels further.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageRecord {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
}

impl UsageRecord {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.total_tokens.is_none()
    }

    pub fn prompt(&self) -> u64 {
        self.prompt_tokens.unwrap_or(0)
    }

    pub fn completion(&self) -> u64 {
        self.completion_tokens.unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or_else(|| self.prompt() + self.completion())
    }

    /// Overlay `incoming` on top of `self` — later frames win field-by-field.
    /// Anthropic streams report input tokens at `message_start` and output
    /// tokens at `message_delta`, so neither frame alone is complete.
    pub fn merge(&mut self, incoming: UsageRecord) {
        if incoming.prompt_tokens.is_some() {
            self.prompt_tokens = incoming.prompt_tokens;
        }
        if incoming.completion_tokens.is_some() {
            self.completion_tokens = incoming.completion_tokens;
        }
        if incoming.total_tokens.is_some() {
            self.total_tokens = incoming.total_tokens;
        }
        if incoming.cached_tokens.is_some() {
            self.cached_tokens = incoming.cached_tokens;
        }
        if incoming.reasoning_tokens.is_some() {
            self.reasoning_tokens = incoming.reasoning_tokens;
        }
        if incoming.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = incoming.cache_creation_input_tokens;
        }
        if incoming.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = incoming.cache_read_input_tokens;
        }
    }
}

/// Extract usage from a complete (non-stream) response payload.
pub fn from_response(family: ProtocolFamily, payload: &Value) -> Option<UsageRecord> {
    match family {
        ProtocolFamily::Anthropic => payload.get("usage").map(from_anthropic_usage),
        ProtocolFamily::Openai => payload.get("usage").map(from_openai_usage),
        ProtocolFamily::Gemini => payload.get("usageMetadata").map(from_gemini_usage),
    }
}

/// Extract usage from one parsed SSE event payload, if this event carries
/// any. Callers merge results across frames.
pub fn from_stream_event(family: ProtocolFamily, payload: &Value) -> Option<UsageRecord> {
    match family {
        ProtocolFamily::Anthropic => from_anthropic_stream(payload),
        ProtocolFamily::Openai => from_openai_stream(payload),
        ProtocolFamily::Gemini => payload.get("usageMetadata").map(from_gemini_usage),
    }
}

fn get_u64(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(|n| n.as_u64())
}

/// Anthropic `usage` object: `input_tokens` / `output_tokens` plus cache
/// accounting fields.
fn from_anthropic_usage(usage: &Value) -> UsageRecord {
    UsageRecord {
        prompt_tokens: get_u64(usage, "input_tokens"),
        completion_tokens: get_u64(usage, "output_tokens"),
        total_tokens: None,
        cached_tokens: get_u64(usage, "cache_read_input_tokens"),
        reasoning_tokens: None,
        cache_creation_input_tokens: get_u64(usage, "cache_creation_input_tokens"),
        cache_read_input_tokens: get_u64(usage, "cache_read_input_tokens"),
    }
}

fn from_anthropic_stream(payload: &Value) -> Option<UsageRecord> {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("message_start") => payload
            .get("message")
            .and_then(|m| m.get("usage"))
            .map(from_anthropic_usage),
        Some("message_delta") => payload.get("usage").map(from_anthropic_usage),
        _ => None,
    }
}

/// OpenAI-family usage. Chat completions use `prompt_tokens` /
/// `completion_tokens`; the responses surface uses `input_tokens` /
/// `output_tokens`. Detail objects carry cached and reasoning counts.
fn from_openai_usage(usage: &Value) -> UsageRecord {
    let prompt = get_u64(usage, "prompt_tokens").or_else(|| get_u64(usage, "input_tokens"));
    let completion =
        get_u64(usage, "completion_tokens").or_else(|| get_u64(usage, "output_tokens"));

    let cached = usage
        .get("prompt_tokens_details")
        .or_else(|| usage.get("input_tokens_details"))
        .and_then(|d| get_u64(d, "cached_tokens"))
        .or_else(|| get_u64(usage, "cached_tokens"));

    let reasoning = usage
        .get("completion_tokens_details")
        .or_else(|| usage.get("output_tokens_details"))
        .and_then(|d| get_u64(d, "reasoning_tokens"))
        .or_else(|| get_u64(usage, "reasoning_tokens"));

    UsageRecord {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: get_u64(usage, "total_tokens"),
        cached_tokens: cached,
        reasoning_tokens: reasoning,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: cached,
    }
}

fn from_openai_stream(payload: &Value) -> Option<UsageRecord> {
    // Responses surface: terminal `response.completed` event wraps the final
    // response object.
    if payload.get("type").and_then(|t| t.as_str()) == Some("response.completed") {
        return payload
            .get("response")
            .and_then(|r| r.get("usage"))
            .map(from_openai_usage);
    }
    // Chat completions: a usage frame near the end of the stream
    // (stream_options.include_usage).
    payload
        .get("usage")
        .filter(|u| !u.is_null())
        .map(from_openai_usage)
}

/// Gemini `usageMetadata`.
fn from_gemini_usage(usage: &Value) -> UsageRecord {
    let cached = get_u64(usage, "cachedContentTokenCount");
    UsageRecord {
        prompt_tokens: get_u64(usage, "promptTokenCount"),
        completion_tokens: get_u64(usage, "candidatesTokenCount"),
        total_tokens: get_u64(usage, "totalTokenCount"),
        cached_tokens: cached,
        reasoning_tokens: get_u64(usage, "thoughtsTokenCount"),
        cache_creation_input_tokens: None,
        cache_read_input_tokens: cached,
    }
}
