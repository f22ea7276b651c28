//! Chat Completions wire types
//!
//! Inbound requests, upstream responses/chunks (decoded leniently, with the optional
//! `time_info` timing extension), and the normalized completion returned to callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    /// Tool calls, names and other provider fields pass through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            extra: Map::new(),
        }
    }
}

/// Inbound `POST /chat/completions` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Provider-specific parameters forwarded verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
            n: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            seed: None,
            extra: Map::new(),
        }
    }

    /// Body sent upstream: the caller's payload with the resolved model name and,
    /// for streams, usage reporting switched on.
    pub fn upstream_body(&self, model: &str, stream: bool) -> Value {
        let mut body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.insert("model".into(), Value::String(model.to_string()));
        body.insert("stream".into(), Value::Bool(stream));
        if stream {
            body.insert(
                "stream_options".into(),
                serde_json::json!({ "include_usage": true }),
            );
        } else {
            body.remove("stream_options");
        }
        Value::Object(body)
    }

    /// Serialized message list, stored on the usage record.
    pub fn prompt_text(&self) -> String {
        serde_json::to_string(&self.messages).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Total as reported, or the sum when the provider leaves it out.
    pub fn total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// Provider timing extension, in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeInfo {
    pub queue_time: Option<f64>,
    pub prompt_time: Option<f64>,
    pub completion_time: Option<f64>,
    pub total_time: Option<f64>,
}

/// Upstream non-streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: Option<String>,
    pub created: Option<i64>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<Usage>,
    pub time_info: Option<TimeInfo>,
    /// In-band provider error (some gateways answer 200 with an error object)
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    pub message: Option<AssistantMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<String>,
    pub refusal: Option<String>,
}

impl ChatCompletion {
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
    }
}

/// One upstream SSE `data:` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: Option<String>,
    pub choices: Option<Vec<ChunkChoice>>,
    pub usage: Option<Usage>,
    pub time_info: Option<TimeInfo>,
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub delta: Option<ChunkDelta>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn content_deltas(&self) -> impl Iterator<Item = &str> {
        self.choices
            .iter()
            .flatten()
            .filter_map(|c| c.delta.as_ref())
            .filter_map(|d| d.content.as_deref())
    }
}

/// Normalized completion returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub logprobs: Option<Value>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    pub refusal: Option<String>,
    pub annotations: Vec<Value>,
}

impl ChatCompletionResponse {
    pub fn from_upstream(upstream: &ChatCompletion, fallback_model: &str) -> Self {
        let first = upstream.choices.first();
        let finish_reason = first
            .and_then(|c| c.finish_reason.clone())
            .unwrap_or_else(|| "stop".to_string());
        let message = first.and_then(|c| c.message.as_ref());

        Self {
            id: upstream
                .id
                .clone()
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: upstream
                .created
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: upstream
                .model
                .clone()
                .unwrap_or_else(|| fallback_model.to_string()),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: message.and_then(|m| m.content.clone()),
                    refusal: message.and_then(|m| m.refusal.clone()),
                    annotations: Vec::new(),
                },
                logprobs: None,
                finish_reason,
            }],
            usage: upstream.usage.unwrap_or_default(),
        }
    }
}
