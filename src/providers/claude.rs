//! Claude (Anthropic) provider adapter
//!
//! Implements [`ProviderAdapter`] for the Anthropic Messages API, including
//! SSE streaming, and the [`ClaudeFormatter`] used to put internal messages
//! on the wire.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::providers::{claude::ClaudeAdapter, ProviderAdapter};
//!
//! let adapter = ClaudeAdapter::new("sk-ant-api03-xxx");
//! assert_eq!(adapter.name(), "anthropic");
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::agent::tokenizer::ProviderFamily;
use crate::error::{ConduitError, Result};
use crate::session::{ContentPart, Message, Role, TokenUsage, ToolCall};

use super::error_classifier::classify_error_message;
use super::format::{file_block, split_system, text_or_file, MessageFormatter, WirePrompt};
use super::sse::{spawn_sse, SseDecoder};
use super::{
    parse_provider_error, transport_error, ProviderAdapter, ProviderRequest, StreamChunk,
    ToolDefinition,
};

/// The Anthropic API base URL.
const CLAUDE_API_BASE: &str = "https://api.anthropic.com";

/// The default Claude model to use.
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// The Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Output token cap used when the request does not set one.
const DEFAULT_MAX_TOKENS: u32 = 8192;

// ============================================================================
// Formatter
// ============================================================================

/// Anthropic Messages wire format.
///
/// Content is always sent as a block array. Consecutive tool results are
/// grouped into one user message of `tool_result` blocks, which is the shape
/// the API expects after an assistant turn with several `tool_use` blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeFormatter;

impl ClaudeFormatter {
    fn user_blocks(parts: &[ContentPart]) -> Vec<Value> {
        parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if text.is_empty() => None,
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::Image { media_type, data } => Some(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data}
                })),
                ContentPart::File {
                    name,
                    media_type,
                    content,
                } => Some(json!({
                    "type": "text",
                    "text": file_block(name, media_type, content)
                })),
            })
            .collect()
    }

    fn assistant_blocks(msg: &Message) -> Vec<Value> {
        let mut blocks = Self::user_blocks(&msg.content);
        for call in msg.tool_calls.iter().flatten() {
            let input = match &call.arguments {
                Value::Object(_) => call.arguments.clone(),
                _ => Value::Object(Map::new()),
            };
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": input
            }));
        }
        blocks
    }

    fn tool_result_block(msg: &Message) -> Value {
        let mut block = json!({
            "type": "tool_result",
            "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
            "content": msg.text(),
        });
        if msg.is_error {
            block["is_error"] = Value::Bool(true);
        }
        block
    }
}

impl MessageFormatter for ClaudeFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn format(&self, messages: &[Message]) -> WirePrompt {
        let (system, rest) = split_system(messages);
        let mut out: Vec<Value> = Vec::with_capacity(rest.len());
        let mut results: Vec<Value> = Vec::new();

        for msg in rest {
            if msg.role == Role::Tool {
                results.push(Self::tool_result_block(msg));
                continue;
            }
            if !results.is_empty() {
                out.push(json!({"role": "user", "content": std::mem::take(&mut results)}));
            }
            match msg.role {
                Role::Assistant => out.push(json!({
                    "role": "assistant",
                    "content": Self::assistant_blocks(msg)
                })),
                _ => out.push(json!({
                    "role": "user",
                    "content": Self::user_blocks(&msg.content)
                })),
            }
        }
        if !results.is_empty() {
            out.push(json!({"role": "user", "content": results}));
        }

        WirePrompt {
            system,
            messages: out,
        }
    }

    fn parse(&self, prompt: &WirePrompt) -> Vec<Message> {
        let mut out = Vec::new();
        if let Some(system) = &prompt.system {
            out.push(Message::system(system));
        }
        let mut tool_names: HashMap<String, String> = HashMap::new();

        for wire in &prompt.messages {
            let role = wire["role"].as_str().unwrap_or("user");
            let blocks: Vec<Value> = match &wire["content"] {
                Value::String(text) => vec![json!({"type": "text", "text": text})],
                Value::Array(blocks) => blocks.clone(),
                _ => Vec::new(),
            };

            let mut parts = Vec::new();
            let mut calls = Vec::new();
            for block in &blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        parts.push(text_or_file(block["text"].as_str().unwrap_or_default()))
                    }
                    Some("image") => parts.push(ContentPart::Image {
                        media_type: block["source"]["media_type"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        data: block["source"]["data"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default();
                        let name = block["name"].as_str().unwrap_or_default();
                        tool_names.insert(id.to_string(), name.to_string());
                        calls.push(ToolCall::new(id, name, block["input"].clone()));
                    }
                    Some("tool_result") => {
                        let id = block["tool_use_id"].as_str().unwrap_or_default();
                        let name = tool_names.get(id).map(String::as_str).unwrap_or("unknown");
                        out.push(Message::tool_result(
                            id,
                            name,
                            &tool_result_text(&block["content"]),
                            block["is_error"].as_bool().unwrap_or(false),
                        ));
                    }
                    _ => {}
                }
            }

            if role == "assistant" {
                let mut msg = if calls.is_empty() {
                    Message::assistant("")
                } else {
                    Message::assistant_with_tools("", calls)
                };
                msg.content = parts;
                out.push(msg);
            } else if !parts.is_empty() {
                let mut msg = Message::user("");
                msg.content = parts;
                out.push(msg);
            }
        }
        out
    }
}

/// `tool_result.content` may be a string or a list of text blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Claude/Anthropic provider adapter.
pub struct ClaudeAdapter {
    /// API key for authentication
    api_key: String,
    /// Base URL, without the `/v1/messages` suffix
    api_base: String,
    /// Model used when the run does not name one
    default_model: String,
    /// HTTP client for making requests
    client: Client,
    formatter: ClaudeFormatter,
}

impl ClaudeAdapter {
    /// Create an adapter with the given API key and a 120 second request
    /// timeout.
    pub fn new(api_key: &str) -> Self {
        Self::with_timeout(api_key, Duration::from_secs(120))
    }

    /// Create an adapter whose HTTP client uses `timeout` per request.
    pub fn with_timeout(api_key: &str, timeout: Duration) -> Self {
        Self::with_client(
            api_key,
            Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        )
    }

    /// Create an adapter with a custom HTTP client (proxies, test servers).
    pub fn with_client(api_key: &str, client: Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: CLAUDE_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            client,
            formatter: ClaudeFormatter,
        }
    }

    /// Point the adapter at a different base URL.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.api_base)
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": request.prompt.messages,
        });
        if let Some(system) = &request.prompt.system {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(stop) = &request.options.stop {
            body["stop_sequences"] = json!(stop);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<Response> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            let body = match serde_json::from_str::<ClaudeErrorResponse>(&error_text) {
                Ok(err) => format!("Claude API error: {} - {}", err.error.r#type, err.error.message),
                Err(_) => format!("Claude API error: {}", error_text),
            };
            return Err(ConduitError::from(parse_provider_error(status, &body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn model_max_input_tokens(&self, model: &str) -> usize {
        if model.starts_with("claude-2") {
            100_000
        } else {
            200_000
        }
    }

    fn formatter(&self) -> &dyn MessageFormatter {
        &self.formatter
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters
                })
            })
            .collect()
    }

    async fn send(&self, request: &ProviderRequest) -> Result<Value> {
        let response = self.post(&self.build_body(request, false)).await?;
        let body: Value = response.json().await.map_err(transport_error)?;
        debug!(model = %request.model, "Claude response received");
        Ok(body)
    }

    async fn send_stream(&self, request: &ProviderRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let response = self.post(&self.build_body(request, true)).await?;
        Ok(spawn_sse(response, ClaudeSseDecoder::default()))
    }

    fn extract_text(&self, body: &Value) -> String {
        body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }

    fn extract_tool_calls(&self, body: &Value) -> Vec<ToolCall> {
        body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "tool_use")
                    .map(|b| {
                        ToolCall::new(
                            b["id"].as_str().unwrap_or_default(),
                            b["name"].as_str().unwrap_or_default(),
                            b["input"].clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn extract_usage(&self, body: &Value) -> TokenUsage {
        usage_from(&body["usage"])
    }
}

/// Anthropic reports cache reads and writes separately from `input_tokens`;
/// the prompt size is their sum.
fn usage_from(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage[name].as_u64().unwrap_or(0);
    let cache_read = field("cache_read_input_tokens");
    let cache_write = field("cache_creation_input_tokens");
    TokenUsage {
        input_tokens: field("input_tokens") + cache_read + cache_write,
        output_tokens: field("output_tokens"),
        reasoning_tokens: 0,
        cache_read_tokens: cache_read,
        cache_write_tokens: cache_write,
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Claude API error response.
#[derive(Debug, Deserialize)]
struct ClaudeErrorResponse {
    error: ClaudeError,
}

/// Claude API error details.
#[derive(Debug, Deserialize)]
struct ClaudeError {
    r#type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    content_block: Option<SseContentBlock>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    message: Option<SseMessage>,
    #[serde(default)]
    error: Option<ClaudeError>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseMessage {
    #[serde(default)]
    usage: Option<Value>,
}

/// Decodes Anthropic `message_*` / `content_block_*` events.
///
/// Input-side usage arrives on `message_start` and output tokens on
/// `message_delta`; both are reported together at `message_stop`.
#[derive(Debug, Default)]
pub(crate) struct ClaudeSseDecoder {
    usage: TokenUsage,
}

impl SseDecoder for ClaudeSseDecoder {
    fn decode(&mut self, data: &str) -> Vec<StreamChunk> {
        let event: SseEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(_) => return Vec::new(),
        };

        match event.event_type.as_str() {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    let output = self.usage.output_tokens;
                    self.usage = usage_from(&usage);
                    self.usage.output_tokens = self.usage.output_tokens.max(output);
                }
                Vec::new()
            }
            "content_block_start" => match event.content_block {
                Some(block) if block.block_type == "tool_use" => vec![StreamChunk::ToolCallStart {
                    index: event.index.unwrap_or(0),
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                }],
                _ => Vec::new(),
            },
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return Vec::new();
                };
                match delta.delta_type.as_deref() {
                    Some("text_delta") => delta
                        .text
                        .filter(|t| !t.is_empty())
                        .map(StreamChunk::Text)
                        .into_iter()
                        .collect(),
                    Some("input_json_delta") => delta
                        .partial_json
                        .map(|arguments| StreamChunk::ToolCallDelta {
                            index: event.index.unwrap_or(0),
                            id: None,
                            arguments,
                        })
                        .into_iter()
                        .collect(),
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(output) = event.usage.as_ref().and_then(|u| u["output_tokens"].as_u64())
                {
                    self.usage.output_tokens = output;
                }
                Vec::new()
            }
            "message_stop" => vec![StreamChunk::Usage(self.usage), StreamChunk::Done],
            "error" => {
                let message = event
                    .error
                    .map(|e| format!("Claude API error: {} - {}", e.r#type, e.message))
                    .unwrap_or_else(|| "Claude API stream error".to_string());
                vec![StreamChunk::Error(classify_error_message(&message))]
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk::Usage(self.usage), StreamChunk::Done]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::session::ImageData;

    fn strip_ids(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                    "tool_calls": m.tool_calls.as_ref().map(|calls| calls
                        .iter()
                        .map(|c| json!([c.id, c.name, c.arguments]))
                        .collect::<Vec<_>>()),
                    "tool_call_id": m.tool_call_id,
                    "tool_name": m.tool_name,
                    "is_error": m.is_error,
                })
            })
            .collect()
    }

    #[test]
    fn test_adapter_identity() {
        let adapter = ClaudeAdapter::new("sk-ant-test");
        assert_eq!(adapter.name(), "anthropic");
        assert_eq!(adapter.default_model(), DEFAULT_MODEL);
        assert_eq!(adapter.family(), ProviderFamily::Anthropic);
        assert_eq!(adapter.model_max_input_tokens("claude-opus-4-1"), 200_000);
        assert_eq!(
            adapter
                .with_api_base("http://localhost:8080/")
                .endpoint(),
            "http://localhost:8080/v1/messages"
        );
    }

    #[test]
    fn test_format_groups_tool_results() {
        let calls = vec![
            ToolCall::new("toolu_1", "read", json!({"path": "a"})),
            ToolCall::new("toolu_2", "read", json!({"path": "b"})),
        ];
        let messages = vec![
            Message::system("Be brief."),
            Message::user("read both"),
            Message::assistant_with_tools("", calls),
            Message::tool_result("toolu_1", "read", "A", false),
            Message::tool_result("toolu_2", "read", "missing", true),
        ];
        let prompt = ClaudeFormatter.format(&messages);

        assert_eq!(prompt.system.as_deref(), Some("Be brief."));
        assert_eq!(prompt.messages.len(), 3);
        assert_eq!(prompt.messages[1]["content"][0]["type"], "tool_use");
        let results = prompt.messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["tool_use_id"], "toolu_2");
        assert_eq!(results[1]["is_error"], true);
        assert!(results[0].get("is_error").is_none());
    }

    #[test]
    fn test_round_trip_within_family() {
        let messages = vec![
            Message::system("You are terse."),
            Message::user_with_attachments(
                "what is this?",
                Some(ImageData {
                    media_type: "image/png".into(),
                    data: "iVBORw0KGgo=".into(),
                }),
                None,
            ),
            Message::assistant_with_tools(
                "Checking.",
                vec![ToolCall::new("toolu_9", "inspect", json!({"deep": true}))],
            ),
            Message::tool_result("toolu_9", "inspect", "a cat", false),
            Message::assistant("A cat."),
        ];
        let parsed = ClaudeFormatter.parse(&ClaudeFormatter.format(&messages));
        assert_eq!(strip_ids(&parsed), strip_ids(&messages));
    }

    #[test]
    fn test_format_tools() {
        let adapter = ClaudeAdapter::new("k");
        let tools = adapter.format_tools(&[ToolDefinition::new(
            "search",
            "Search",
            json!({"type": "object"}),
        )]);
        assert_eq!(tools[0]["input_schema"], json!({"type": "object"}));
        assert!(tools[0].get("parameters").is_none());
    }

    #[test]
    fn test_build_body() {
        let adapter = ClaudeAdapter::new("k");
        let request = ProviderRequest {
            model: "claude-x".into(),
            prompt: WirePrompt {
                system: Some("sys".into()),
                messages: vec![json!({"role": "user", "content": []})],
            },
            tools: Vec::new(),
            options: Default::default(),
        };
        let body = adapter.build_body(&request, true);
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["system"], "sys");
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert!(adapter.build_body(&request, false).get("stream").is_none());
    }

    #[test]
    fn test_extract_from_body() {
        let adapter = ClaudeAdapter::new("k");
        let body = json!({
            "content": [
                {"type": "text", "text": "Let me "},
                {"type": "text", "text": "check."},
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "rust"}}
            ],
            "usage": {
                "input_tokens": 100,
                "output_tokens": 20,
                "cache_read_input_tokens": 900,
                "cache_creation_input_tokens": 50
            }
        });
        assert_eq!(adapter.extract_text(&body), "Let me check.");
        let calls = adapter.extract_tool_calls(&body);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"q": "rust"}));

        let usage = adapter.extract_usage(&body);
        assert_eq!(usage.input_tokens, 1050);
        assert_eq!(usage.cache_read_tokens, 900);
        assert_eq!(usage.cache_write_tokens, 50);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn test_sse_decoder_sequence() {
        let mut decoder = ClaudeSseDecoder::default();
        let events = [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_01","name":"web_search","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let chunks: Vec<StreamChunk> = events.iter().flat_map(|e| decoder.decode(e)).collect();

        assert_eq!(chunks[0], StreamChunk::Text("Hi".into()));
        assert_eq!(
            chunks[1],
            StreamChunk::ToolCallStart {
                index: 1,
                id: "toolu_01".into(),
                name: "web_search".into()
            }
        );
        assert!(matches!(&chunks[2], StreamChunk::ToolCallDelta { index: 1, arguments, .. } if arguments == "{\"q\":"));
        assert_eq!(chunks[4], StreamChunk::Usage(TokenUsage::new(12, 42)));
        assert_eq!(chunks[5], StreamChunk::Done);
    }

    #[test]
    fn test_sse_decoder_error_event() {
        let mut decoder = ClaudeSseDecoder::default();
        let chunks = decoder.decode(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(
            &chunks[0],
            StreamChunk::Error(ProviderError::Overloaded(_))
        ));
    }
}
