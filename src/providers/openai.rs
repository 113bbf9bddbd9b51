//! OpenAI provider adapter
//!
//! Implements [`ProviderAdapter`] for the Chat Completions API. Any
//! OpenAI-compatible endpoint (Azure, OpenRouter, vLLM, Ollama) works by
//! pointing the adapter at its base URL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::agent::tokenizer::ProviderFamily;
use crate::error::{ConduitError, Result};
use crate::session::{ContentPart, Message, Role, TokenUsage, ToolCall};

use super::format::{
    file_block, split_system, text_or_file, text_parts, MessageFormatter, WirePrompt,
};
use super::sse::{spawn_sse, SseDecoder};
use super::{
    parse_provider_error, transport_error, ProviderAdapter, ProviderRequest, StreamChunk,
    ToolDefinition,
};

/// The OpenAI API base URL.
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// The default OpenAI model to use.
const DEFAULT_MODEL: &str = "gpt-4o";

/// Tool results starting with this prefix are read back as errors; the wire
/// format has no error flag of its own.
const ERROR_PREFIX: &str = "Error (";

// ============================================================================
// Formatter
// ============================================================================

/// Chat Completions wire format.
///
/// System text is not part of [`WirePrompt::messages`]; the adapter puts it
/// in front as a `system` message when building the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAIFormatter;

impl OpenAIFormatter {
    fn user_content(parts: &[ContentPart]) -> Value {
        if let [ContentPart::Text { text }] = parts {
            return Value::String(text.clone());
        }
        let parts: Vec<Value> = parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { media_type, data } => json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
                }),
                ContentPart::File {
                    name,
                    media_type,
                    content,
                } => json!({"type": "text", "text": file_block(name, media_type, content)}),
            })
            .collect();
        Value::Array(parts)
    }

    fn parse_user_content(content: &Value) -> Vec<ContentPart> {
        match content {
            Value::String(text) => vec![text_or_file(text)],
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| match part["type"].as_str() {
                    Some("text") => Some(text_or_file(part["text"].as_str().unwrap_or_default())),
                    Some("image_url") => {
                        let url = part["image_url"]["url"].as_str().unwrap_or_default();
                        parse_data_url(url).map(|(media_type, data)| ContentPart::Image {
                            media_type,
                            data,
                        })
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Split `data:<type>;base64,<payload>`.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

impl MessageFormatter for OpenAIFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAI
    }

    fn format(&self, messages: &[Message]) -> WirePrompt {
        let (system, rest) = split_system(messages);
        let messages = rest
            .into_iter()
            .map(|msg| match msg.role {
                Role::Assistant => {
                    let text = text_parts(&msg.content);
                    let mut wire = json!({
                        "role": "assistant",
                        "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                    });
                    if msg.has_tool_calls() {
                        let calls: Vec<Value> = msg
                            .tool_calls
                            .iter()
                            .flatten()
                            .map(|call| {
                                let arguments = match &call.arguments {
                                    Value::String(raw) => raw.clone(),
                                    other => other.to_string(),
                                };
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {"name": call.name, "arguments": arguments}
                                })
                            })
                            .collect();
                        wire["tool_calls"] = Value::Array(calls);
                    }
                    wire
                }
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                    "content": msg.text(),
                }),
                _ => json!({"role": "user", "content": Self::user_content(&msg.content)}),
            })
            .collect();
        WirePrompt { system, messages }
    }

    fn parse(&self, prompt: &WirePrompt) -> Vec<Message> {
        let mut out = Vec::new();
        if let Some(system) = &prompt.system {
            out.push(Message::system(system));
        }
        let mut tool_names: HashMap<String, String> = HashMap::new();

        for wire in &prompt.messages {
            match wire["role"].as_str() {
                Some("system") => out.push(Message::system(wire["content"].as_str().unwrap_or_default())),
                Some("assistant") => {
                    let calls: Vec<ToolCall> = wire["tool_calls"]
                        .as_array()
                        .map(|calls| {
                            calls
                                .iter()
                                .map(|c| {
                                    let id = c["id"].as_str().unwrap_or_default();
                                    let name = c["function"]["name"].as_str().unwrap_or_default();
                                    tool_names.insert(id.to_string(), name.to_string());
                                    ToolCall::from_raw(
                                        id,
                                        name,
                                        c["function"]["arguments"].as_str().unwrap_or_default(),
                                    )
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    let text = wire["content"].as_str().unwrap_or_default();
                    if calls.is_empty() {
                        out.push(Message::assistant(text));
                    } else {
                        out.push(Message::assistant_with_tools(text, calls));
                    }
                }
                Some("tool") => {
                    let id = wire["tool_call_id"].as_str().unwrap_or_default();
                    let content = wire["content"].as_str().unwrap_or_default();
                    let name = tool_names.get(id).map(String::as_str).unwrap_or("unknown");
                    out.push(Message::tool_result(
                        id,
                        name,
                        content,
                        content.starts_with(ERROR_PREFIX),
                    ));
                }
                _ => {
                    let mut msg = Message::user("");
                    msg.content = Self::parse_user_content(&wire["content"]);
                    out.push(msg);
                }
            }
        }
        out
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// OpenAI (and compatible) provider adapter.
pub struct OpenAIAdapter {
    api_key: String,
    /// Base URL including the version segment, e.g. `https://api.openai.com/v1`
    api_base: String,
    default_model: String,
    client: Client,
    formatter: OpenAIFormatter,
}

impl OpenAIAdapter {
    /// Create an adapter for api.openai.com with a 120 second request timeout.
    pub fn new(api_key: &str) -> Self {
        Self::with_timeout(api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(api_key: &str, timeout: Duration) -> Self {
        Self::with_client(
            api_key,
            Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        )
    }

    pub fn with_client(api_key: &str, client: Client) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_base: OPENAI_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            client,
            formatter: OpenAIFormatter,
        }
    }

    /// Use an OpenAI-compatible endpoint.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.prompt.messages.len() + 1);
        if let Some(system) = &request.prompt.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.prompt.messages.iter().cloned());

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        if let Some(max_tokens) = request.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(stop) = &request.options.stop {
            body["stop"] = json!(stop);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<Response> {
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            let body = match serde_json::from_str::<OpenAIErrorResponse>(&error_text) {
                Ok(err) => format!("OpenAI API error: {}", err.error.message),
                Err(_) => format!("OpenAI API error: {}", error_text),
            };
            return Err(ConduitError::from(parse_provider_error(status, &body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAI
    }

    fn model_max_input_tokens(&self, model: &str) -> usize {
        if model.starts_with("gpt-4.1") {
            1_047_576
        } else if model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4") {
            200_000
        } else if model.starts_with("gpt-3.5") {
            16_385
        } else if model.starts_with("gpt-4-") || model == "gpt-4" {
            8_192
        } else {
            128_000
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
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                })
            })
            .collect()
    }

    async fn send(&self, request: &ProviderRequest) -> Result<Value> {
        let response = self.post(&self.build_body(request, false)).await?;
        let body: Value = response.json().await.map_err(transport_error)?;
        debug!(model = %request.model, "OpenAI response received");
        Ok(body)
    }

    async fn send_stream(&self, request: &ProviderRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let response = self.post(&self.build_body(request, true)).await?;
        Ok(spawn_sse(response, OpenAISseDecoder::default()))
    }

    fn extract_text(&self, body: &Value) -> String {
        body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    fn extract_tool_calls(&self, body: &Value) -> Vec<ToolCall> {
        body["choices"][0]["message"]["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        ToolCall::from_raw(
                            c["id"].as_str().unwrap_or_default(),
                            c["function"]["name"].as_str().unwrap_or_default(),
                            c["function"]["arguments"].as_str().unwrap_or_default(),
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

/// `prompt_tokens` already includes cached tokens; `cached_tokens` is a
/// breakdown of it.
fn usage_from(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        reasoning_tokens: usage["completion_tokens_details"]["reasoning_tokens"]
            .as_u64()
            .unwrap_or(0),
        cache_read_tokens: usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

/// Decodes `chat.completion.chunk` payloads.
#[derive(Debug, Default)]
pub(crate) struct OpenAISseDecoder {
    usage: Option<TokenUsage>,
}

impl SseDecoder for OpenAISseDecoder {
    fn decode(&mut self, data: &str) -> Vec<StreamChunk> {
        if data == "[DONE]" {
            return self.finish();
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        if let Some(message) = chunk["error"]["message"].as_str() {
            return vec![StreamChunk::Error(super::error_classifier::classify_error_message(
                message,
            ))];
        }

        let mut out = Vec::new();
        if chunk["usage"].is_object() {
            self.usage = Some(usage_from(&chunk["usage"]));
        }
        let delta = &chunk["choices"][0]["delta"];
        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            out.push(StreamChunk::Text(text.to_string()));
        }
        for call in delta["tool_calls"].as_array().into_iter().flatten() {
            let index = call["index"].as_u64().unwrap_or(0) as usize;
            let id = call["id"].as_str().map(str::to_string);
            if let (Some(id), Some(name)) = (&id, call["function"]["name"].as_str()) {
                out.push(StreamChunk::ToolCallStart {
                    index,
                    id: id.clone(),
                    name: name.to_string(),
                });
            }
            if let Some(arguments) = call["function"]["arguments"]
                .as_str()
                .filter(|a| !a.is_empty())
            {
                out.push(StreamChunk::ToolCallDelta {
                    index,
                    id,
                    arguments: arguments.to_string(),
                });
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::with_capacity(2);
        if let Some(usage) = self.usage.take() {
            out.push(StreamChunk::Usage(usage));
        }
        out.push(StreamChunk::Done);
        out
    }
}
