//! Wire and domain types shared across the proxy.
//!
//! Request/response shapes are intentionally minimal: the proxy relays
//! upstream bodies byte-for-byte and only decodes the fields it needs for
//! routing, caching, and token accounting. Unknown fields pass through
//! untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single message in a chat conversation.
///
/// `content` is kept as a raw JSON value so that Anthropic-style content
/// blocks (arrays of typed parts) survive decoding and cache hashing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

/// OpenAI-compatible chat completion request (decoded fields only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
}

/// OpenAI-compatible chat completion response (decoded fields only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One SSE chunk of an OpenAI streaming response.
///
/// Only `model` and the terminal `usage` matter to accounting; `choices`
/// deltas are relayed without interpretation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Anthropic-compatible messages request (decoded fields only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<serde_json::Value>,
}

/// Anthropic-compatible messages response (decoded fields only).
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// Token counts as Anthropic reports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl AnthropicUsage {
    /// Convert to the proxy's normalized usage shape (total = input + output).
    pub fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        }
    }
}

/// One event of an Anthropic SSE stream.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicStreamEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub message: Option<AnthropicMessageStart>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// The message object carried by a `message_start` event.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessageStart {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// Wire-level style of a dialect route: request/response JSON shapes and
/// credential header conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

impl Dialect {
    /// Upstream path the dialect posts to.
    pub fn path(self) -> &'static str {
        match self {
            Dialect::OpenAi => "/v1/chat/completions",
            Dialect::Anthropic => "/v1/messages",
        }
    }

    /// Provider tag recorded on audit entries.
    pub fn provider_tag(self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }

    /// Decode a buffered response body and pull out the echoed model name
    /// and token usage. Returns `None` when the body does not parse or
    /// carries no usage.
    pub fn extract_usage(self, body: &[u8]) -> Option<(String, Usage)> {
        match self {
            Dialect::OpenAi => {
                let resp: ChatCompletionResponse = serde_json::from_slice(body).ok()?;
                let usage = resp.usage?;
                Some((resp.model, usage))
            }
            Dialect::Anthropic => {
                let resp: AnthropicResponse = serde_json::from_slice(body).ok()?;
                let usage = resp.usage?.to_usage();
                Some((resp.model, usage))
            }
        }
    }
}

/// Normalized token usage from an LLM response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// Per-request token usage, immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub id: i64,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub session_id: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub env: String,
    pub created_at: DateTime<Utc>,
}

/// Usage aggregated by API key and model.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub api_key: String,
    pub model: String,
    pub request_count: i64,
    pub total_prompt: i64,
    pub total_completion: i64,
    pub total_tokens: i64,
}

/// A grouping of consecutive requests from the same API key.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub api_key: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub request_count: i64,
    pub total_tokens: i64,
}

/// Per-request detail within a session, ordered by creation time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// `prompt_tokens[seq] - prompt_tokens[seq-1]`; zero for the first request.
    pub context_growth: i64,
}

/// Time window for a budget policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    #[default]
    Daily,
    Monthly,
}

/// Max tokens per API key (and optionally per model) per period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// `"*"` matches every key; anything else matches literally.
    pub api_key: String,
    /// Empty means the policy applies to all models.
    #[serde(default)]
    pub model: String,
    pub max_tokens: i64,
    #[serde(default)]
    pub period: BudgetPeriod,
}

/// Current usage against a single policy.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub policy: BudgetPolicy,
    pub used: i64,
    pub remaining: i64,
}

/// Cache performance counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub hits: i64,
    pub misses: i64,
}

/// A single audited request/response pair.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditEntry {
    pub request_id: String,
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub model: String,
    pub session_id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HashMap<String, String>>,
    pub status_code: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Filters for querying audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQueryOpts {
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub api_key_prefix: Option<String>,
    pub session_id: Option<String>,
    /// Defaults to 100 when unset or non-positive.
    pub limit: Option<i64>,
}

/// Aggregate audit counts for one model/day combination.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStat {
    pub model: String,
    pub day: String,
    pub count: i64,
}

/// Attribution labels stamped on usage records for cost allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostLabel {
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub env: String,
}

/// Per-1K-token costs for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    #[serde(rename = "prompt_cost_per_1k")]
    pub prompt_cost: f64,
    #[serde(rename = "completion_cost_per_1k")]
    pub completion_cost: f64,
}

/// Aggregated cost row grouped by team, project, and model.
#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub team: String,
    pub project: String,
    pub model: String,
    pub request_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost: f64,
}

/// Fill in `estimated_cost` on each report from the configured pricing table.
/// Models without a pricing entry keep a zero cost.
pub fn apply_costs(reports: &mut [CostReport], pricing: &[ModelPricing]) {
    let by_model: HashMap<&str, &ModelPricing> =
        pricing.iter().map(|p| (p.model.as_str(), p)).collect();
    for report in reports.iter_mut() {
        if let Some(p) = by_model.get(report.model.as_str()) {
            report.estimated_cost = (report.prompt_tokens as f64 / 1000.0) * p.prompt_cost
                + (report.completion_tokens as f64 / 1000.0) * p.completion_cost;
        }
    }
}
