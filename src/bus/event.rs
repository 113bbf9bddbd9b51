//! Event types published on the [`SessionEventBus`](super::SessionEventBus).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{CompactionCheckpoint, TokenUsage};
use crate::tools::approval::{ApprovalRequest, ApprovalStatus};
use crate::tools::ToolResult;

/// Lifecycle event of a run.
///
/// Serialized with a `type` tag (`"thinking"`, `"toolCall"`, ...) and
/// camelCase field names (`sessionId`, `callId`), so that a transport can
/// forward events to a web client unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AgentEvent {
    /// An iteration started and the provider is about to be called.
    Thinking { session_id: String, iteration: u32 },
    /// Streamed text delta. The final chunk of a response has `is_complete`.
    Chunk {
        session_id: String,
        content: String,
        is_complete: bool,
    },
    /// The model issued a tool call.
    ToolCall {
        session_id: String,
        call_id: String,
        tool_name: String,
        args: Value,
    },
    /// A tool call finished (in any way).
    ToolResult {
        session_id: String,
        call_id: String,
        tool_name: String,
        success: bool,
        result: ToolResult,
    },
    /// Final answer of a run.
    Response {
        session_id: String,
        content: String,
        model: String,
        token_usage: TokenUsage,
    },
    /// A run-level failure.
    Error {
        session_id: String,
        error: String,
        context: String,
        recoverable: bool,
    },
    ApprovalRequested {
        session_id: String,
        request: ApprovalRequest,
    },
    ApprovalResolved {
        session_id: String,
        request_id: String,
        tool_name: String,
        status: ApprovalStatus,
        source: String,
    },
    /// The context manager compacted history.
    Compaction {
        session_id: String,
        checkpoint: CompactionCheckpoint,
    },
}

/// Discriminant of [`AgentEvent`], used to filter handler subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Thinking,
    Chunk,
    ToolCall,
    ToolResult,
    Response,
    Error,
    ApprovalRequested,
    ApprovalResolved,
    Compaction,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Thinking => "thinking",
            EventKind::Chunk => "chunk",
            EventKind::ToolCall => "toolCall",
            EventKind::ToolResult => "toolResult",
            EventKind::Response => "response",
            EventKind::Error => "error",
            EventKind::ApprovalRequested => "approvalRequested",
            EventKind::ApprovalResolved => "approvalResolved",
            EventKind::Compaction => "compaction",
        };
        write!(f, "{}", name)
    }
}

impl AgentEvent {
    /// Session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::Thinking { session_id, .. }
            | AgentEvent::Chunk { session_id, .. }
            | AgentEvent::ToolCall { session_id, .. }
            | AgentEvent::ToolResult { session_id, .. }
            | AgentEvent::Response { session_id, .. }
            | AgentEvent::Error { session_id, .. }
            | AgentEvent::ApprovalRequested { session_id, .. }
            | AgentEvent::ApprovalResolved { session_id, .. }
            | AgentEvent::Compaction { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::Thinking { .. } => EventKind::Thinking,
            AgentEvent::Chunk { .. } => EventKind::Chunk,
            AgentEvent::ToolCall { .. } => EventKind::ToolCall,
            AgentEvent::ToolResult { .. } => EventKind::ToolResult,
            AgentEvent::Response { .. } => EventKind::Response,
            AgentEvent::Error { .. } => EventKind::Error,
            AgentEvent::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            AgentEvent::ApprovalResolved { .. } => EventKind::ApprovalResolved,
            AgentEvent::Compaction { .. } => EventKind::Compaction,
        }
    }
}
