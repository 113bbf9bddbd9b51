//! Provider types for Conduit
//!
//! This module defines the [`ProviderAdapter`] trait the agent loop is
//! generic over, the request handed to an adapter, and the normalized
//! response and stream chunks it produces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::tokenizer::ProviderFamily;
use crate::error::{ProviderError, Result};
use crate::session::{TokenUsage, ToolCall};

use super::format::{MessageFormatter, WirePrompt};

/// Definition of a tool that can be called by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (must be unique)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    ///
    /// # Example
    /// ```
    /// use conduit::providers::ToolDefinition;
    /// use serde_json::json;
    ///
    /// let tool = ToolDefinition::new(
    ///     "web_search",
    ///     "Search the web for information",
    ///     json!({
    ///         "type": "object",
    ///         "properties": { "query": { "type": "string" } },
    ///         "required": ["query"]
    ///     }),
    /// );
    /// assert_eq!(tool.name, "web_search");
    /// ```
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Sampling options for one provider call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Maximum number of tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    pub temperature: Option<f32>,
    /// Stop sequences that halt generation
    pub stop: Option<Vec<String>>,
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// Everything an adapter needs for one call, already in wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    /// Formatted history plus the system prompt
    pub prompt: WirePrompt,
    /// Tool schemas as returned by [`ProviderAdapter::format_tools`]
    pub tools: Vec<Value>,
    pub options: ChatOptions,
}

/// One increment of a streamed response.
///
/// Tool call fragments carry the provider's stream index; `id` is present
/// whenever the provider repeats it on a fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Text delta
    Text(String),
    /// A tool call block opened
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    /// A fragment of a tool call's JSON arguments
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        arguments: String,
    },
    /// Usage totals (may arrive more than once; later values win per field)
    Usage(TokenUsage),
    /// The response is complete
    Done,
    /// The stream failed mid-way
    Error(ProviderError),
}

/// Provider-neutral view of one completed model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl ProviderResponse {
    /// Normalize a raw response body with the adapter's extractors.
    pub fn from_body<A: ProviderAdapter + ?Sized>(adapter: &A, body: &Value) -> Self {
        Self {
            text: adapter.extract_text(body),
            tool_calls: adapter.extract_tool_calls(body),
            usage: adapter.extract_usage(body),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Turn a complete response into the chunk sequence a stream would have
/// produced. Used by adapters without native streaming.
pub fn replay(response: ProviderResponse) -> mpsc::Receiver<StreamChunk> {
    let mut chunks = Vec::with_capacity(response.tool_calls.len() * 2 + 3);
    if !response.text.is_empty() {
        chunks.push(StreamChunk::Text(response.text));
    }
    for (index, call) in response.tool_calls.into_iter().enumerate() {
        let arguments = match &call.arguments {
            Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        chunks.push(StreamChunk::ToolCallStart {
            index,
            id: call.id.clone(),
            name: call.name,
        });
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            id: Some(call.id),
            arguments,
        });
    }
    chunks.push(StreamChunk::Usage(response.usage));
    chunks.push(StreamChunk::Done);

    let (tx, rx) = mpsc::channel(chunks.len());
    for chunk in chunks {
        let _ = tx.try_send(chunk);
    }
    rx
}

/// Adapter between the generic agent loop and one provider's API.
///
/// The loop never looks inside wire bodies itself: formatting goes through
/// [`formatter`](Self::formatter) and [`format_tools`](Self::format_tools),
/// and results come back through the `extract_*` methods.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as used in config (`"anthropic"`, `"openai"`).
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;

    fn family(&self) -> ProviderFamily;

    /// Context window of `model` in tokens.
    fn model_max_input_tokens(&self, model: &str) -> usize;

    fn formatter(&self) -> &dyn MessageFormatter;

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<Value>;

    /// Perform one non-streaming call and return the raw response body.
    async fn send(&self, request: &ProviderRequest) -> Result<Value>;

    /// Perform one streaming call.
    ///
    /// The default performs a batch call and replays it as chunks.
    async fn send_stream(&self, request: &ProviderRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let body = self.send(request).await?;
        Ok(replay(ProviderResponse::from_body(self, &body)))
    }

    fn extract_text(&self, body: &Value) -> String;

    fn extract_tool_calls(&self, body: &Value) -> Vec<ToolCall>;

    fn extract_usage(&self, body: &Value) -> TokenUsage;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_options_builder() {
        let options = ChatOptions::new()
            .with_max_tokens(1000)
            .with_temperature(0.2)
            .with_stop(vec!["END".into()]);
        assert_eq!(options.max_tokens, Some(1000));
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.stop.as_deref(), Some(&["END".to_string()][..]));
    }

    #[tokio::test]
    async fn test_replay_emits_text_calls_usage_done() {
        let response = ProviderResponse {
            text: "checking".into(),
            tool_calls: vec![ToolCall::new("c1", "read", json!({"path": "a"}))],
            usage: TokenUsage::new(10, 2),
        };
        let mut rx = replay(response);
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0], StreamChunk::Text("checking".into()));
        assert!(matches!(&chunks[1], StreamChunk::ToolCallStart { name, .. } if name == "read"));
        assert!(
            matches!(&chunks[2], StreamChunk::ToolCallDelta { arguments, .. } if arguments == r#"{"path":"a"}"#)
        );
        assert_eq!(chunks[4], StreamChunk::Done);
    }

    #[test]
    fn test_tool_definition_serialization() {
        let tool = ToolDefinition::new("search", "Search the web", json!({"type": "object"}));
        let json = serde_json::to_string(&tool).unwrap();
        let parsed: ToolDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tool);
    }
}
