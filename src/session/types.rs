//! Session types for Conduit
//!
//! Core types for conversation state: messages with multi-part content, tool
//! calls, token-budget bookkeeping and compaction checkpoints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::usage::{ModelUsage, TokenUsage};
use crate::agent::tokenizer::ProviderFamily;

/// A conversation session: message log plus budget and usage state.
///
/// A session is mutated only by its own loop; nothing in the runtime shares
/// one across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier for this session (e.g., "cli:1739523000")
    pub id: String,
    /// Ordered list of messages in this conversation
    pub messages: Vec<Message>,
    /// Token budget bookkeeping
    #[serde(default)]
    pub budget: TokenBudget,
    /// Usage statistics keyed by model name
    #[serde(default)]
    pub usage: HashMap<String, ModelUsage>,
    /// Every compaction that has run on this session, oldest first
    #[serde(default)]
    pub compactions: Vec<CompactionCheckpoint>,
    /// Provider family whose adapter last wrote tool calls into this log
    #[serde(default)]
    pub provider_family: Option<ProviderFamily>,
    /// When this session was created
    pub created_at: DateTime<Utc>,
    /// When this session was last modified
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session with the given id.
    ///
    /// # Example
    /// ```
    /// use conduit::session::Session;
    ///
    /// let session = Session::new("cli:42");
    /// assert!(session.messages.is_empty());
    /// ```
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            budget: TokenBudget::default(),
            usage: HashMap::new(),
            compactions: Vec::new(),
            provider_family: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a message to this session and touch `updated_at`.
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Record provider usage for `model`.
    pub fn record_usage(&mut self, model: &str, usage: &TokenUsage) {
        self.usage
            .entry(model.to_string())
            .or_insert_with(ModelUsage::new)
            .record(model, usage);
        self.updated_at = Utc::now();
    }

    /// Get the number of messages in this session.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Check if this session is empty (no messages).
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get the last message in this session, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Token budget state for a session.
///
/// `last_actual_tokens` is the provider-reported prompt size of the most
/// recent completed turn, valid for the first `actual_covers_messages`
/// messages of the log. Anything appended afterwards is estimated on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Configured max input tokens (after capping by the model limit)
    pub max_input_tokens: usize,
    /// Tokens reserved for system prompt, tool schema and safety buffer
    pub reserved_tokens: usize,
    /// Most recent running estimate for the history
    pub estimated_tokens: usize,
    /// Provider-reported prompt tokens for the last completed turn
    pub last_actual_tokens: Option<usize>,
    /// Number of leading messages that `last_actual_tokens` already covers
    #[serde(default)]
    pub actual_covers_messages: usize,
}

impl TokenBudget {
    /// Tokens available for history after the reserve.
    pub fn available(&self) -> usize {
        self.max_input_tokens.saturating_sub(self.reserved_tokens)
    }
}

/// Which compaction phase a run had to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPhase {
    /// Old tool-result payloads replaced with placeholders.
    PruneToolResults,
    /// Oldest turns outside the recent window dropped into a summary note.
    DropOldTurns,
    /// Recent window reduced too (tool results pruned, then older recent turns dropped).
    ShrinkRecent,
}

/// A record of one compaction run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionCheckpoint {
    /// When compaction ran
    pub timestamp: DateTime<Utc>,
    /// History estimate before compaction
    pub tokens_before: usize,
    /// History estimate after compaction
    pub tokens_after: usize,
    /// Budget the run was targeting
    pub target_tokens: usize,
    /// Number of tool-result payloads replaced with placeholders
    pub pruned_tool_results: usize,
    /// Number of messages removed from the log
    pub dropped_messages: usize,
    /// Whether dropped turns were folded into a summary note
    pub summarized: bool,
    /// Furthest phase reached
    pub phase: CompactionPhase,
}

/// A single part of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Base64-encoded image
    Image { media_type: String, data: String },
    /// Text file attached by the user
    File {
        name: String,
        media_type: String,
        content: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// Image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. "image/png"
    pub media_type: String,
    /// Base64 payload
    pub data: String,
}

/// File attached to a user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    /// Display name, e.g. "notes.md"
    pub name: String,
    /// MIME type
    pub media_type: String,
    /// Text content of the file
    pub content: String,
}

/// A single message in a conversation.
///
/// Messages can be from users, assistants, system prompts, or tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier, used to deduplicate history on read
    pub id: String,
    /// The role of the message sender
    pub role: Role,
    /// Content parts in order
    pub content: Vec<ContentPart>,
    /// Tool calls made by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to (for tool results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Name of the tool that produced this result (for tool results)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Whether this tool result represents a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    /// Provider-reported usage for the turn that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    ///
    /// # Example
    /// ```
    /// use conduit::session::{Message, Role};
    ///
    /// let msg = Message::user("Hello, assistant!");
    /// assert_eq!(msg.role, Role::User);
    /// assert_eq!(msg.text(), "Hello, assistant!");
    /// ```
    pub fn user(content: &str) -> Self {
        Self::base(Role::User, vec![ContentPart::text(content)])
    }

    /// Create a user message with optional image and file attachments.
    pub fn user_with_attachments(
        content: &str,
        image: Option<ImageData>,
        file: Option<FileData>,
    ) -> Self {
        let mut parts = vec![ContentPart::text(content)];
        if let Some(image) = image {
            parts.push(ContentPart::Image {
                media_type: image.media_type,
                data: image.data,
            });
        }
        if let Some(file) = file {
            parts.push(ContentPart::File {
                name: file.name,
                media_type: file.media_type,
                content: file.content,
            });
        }
        Self::base(Role::User, parts)
    }

    /// Create a new assistant message.
    pub fn assistant(content: &str) -> Self {
        Self::base(Role::Assistant, vec![ContentPart::text(content)])
    }

    /// Create an assistant message with tool calls.
    ///
    /// Each call's `message_id` is set to the new message's id.
    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        let parts = if content.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(content)]
        };
        let mut msg = Self::base(Role::Assistant, parts);
        let id = msg.id.clone();
        msg.tool_calls = Some(
            tool_calls
                .into_iter()
                .map(|mut call| {
                    call.message_id = Some(id.clone());
                    call
                })
                .collect(),
        );
        msg
    }

    /// Create a new system message.
    pub fn system(content: &str) -> Self {
        Self::base(Role::System, vec![ContentPart::text(content)])
    }

    /// Create a new tool result message.
    ///
    /// # Example
    /// ```
    /// use conduit::session::{Message, Role};
    ///
    /// let msg = Message::tool_result("call_123", "read_file", "contents", false);
    /// assert_eq!(msg.role, Role::Tool);
    /// assert_eq!(msg.tool_call_id.as_deref(), Some("call_123"));
    /// ```
    pub fn tool_result(tool_call_id: &str, tool_name: &str, content: &str, is_error: bool) -> Self {
        let mut msg = Self::base(Role::Tool, vec![ContentPart::text(content)]);
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg.tool_name = Some(tool_name.to_string());
        msg.is_error = is_error;
        msg
    }

    /// Attach provider usage to this message.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Replace all content with a single text part.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content = vec![ContentPart::text(text)];
    }

    /// Check if this message has tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls
            .as_ref()
            .map(|tc| !tc.is_empty())
            .unwrap_or(false)
    }

    /// Check if this is a tool result message.
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_call_id.is_some()
    }

    /// Check if this message carries image content.
    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }))
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompts and instructions
    System,
    /// Messages from the user
    User,
    /// Messages from the AI assistant
    Assistant,
    /// Results from tool executions
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Name of the tool to call
    pub name: String,
    /// Arguments as a JSON value
    pub arguments: Value,
    /// Id of the assistant message that issued this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ToolCall {
    /// Create a new tool call.
    ///
    /// # Example
    /// ```
    /// use conduit::session::ToolCall;
    /// use serde_json::json;
    ///
    /// let call = ToolCall::new("call_123", "web_search", json!({"query": "rust"}));
    /// assert_eq!(call.name, "web_search");
    /// ```
    pub fn new(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
            message_id: None,
        }
    }

    /// Build a call from a raw JSON argument string as providers send it.
    ///
    /// Unparseable input is kept as a JSON string so validation can reject it
    /// with a proper error instead of the call disappearing.
    pub fn from_raw(id: &str, name: &str, raw_arguments: &str) -> Self {
        let trimmed = raw_arguments.trim();
        let arguments = if trimmed.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw_arguments.into()))
        };
        Self::new(id, name, arguments)
    }
}
