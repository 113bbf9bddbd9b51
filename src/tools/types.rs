//! Tool types for Conduit
//!
//! This module defines the `Tool` trait that all tools implement, the
//! `ToolContext` handed to them at execution time, and the structured
//! `ToolResult` the loop appends to context for every issued call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Risk category of a tool, consulted by the permission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Read-only filesystem operations (read, list, glob).
    FilesystemRead,
    /// Write/modify filesystem operations (write, edit, delete).
    FilesystemWrite,
    /// Read-only network operations (web search, fetch).
    NetworkRead,
    /// Network operations that modify external state (HTTP POST, API calls).
    NetworkWrite,
    /// Shell command execution and process spawning.
    Shell,
    /// Memory read/write operations.
    Memory,
    /// Messaging operations (send messages to people).
    Messaging,
    /// Destructive or high-risk operations.
    Destructive,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilesystemRead => write!(f, "filesystem_read"),
            Self::FilesystemWrite => write!(f, "filesystem_write"),
            Self::NetworkRead => write!(f, "network_read"),
            Self::NetworkWrite => write!(f, "network_write"),
            Self::Shell => write!(f, "shell"),
            Self::Memory => write!(f, "memory"),
            Self::Messaging => write!(f, "messaging"),
            Self::Destructive => write!(f, "destructive"),
        }
    }
}

/// What a tool hands back on success.
///
/// `raw` is kept verbatim for the UI. `for_llm` optionally overrides the
/// text the model sees; when absent the raw payload is rendered instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub raw: Value,
    pub for_llm: Option<String>,
}

impl ToolOutput {
    /// Plain text result, same for model and UI.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            raw: Value::String(content.into()),
            for_llm: None,
        }
    }

    /// Structured JSON result.
    pub fn json(raw: Value) -> Self {
        Self { raw, for_llm: None }
    }

    /// Structured result for the UI with a condensed rendering for the model.
    pub fn split(raw: Value, for_llm: impl Into<String>) -> Self {
        Self {
            raw,
            for_llm: Some(for_llm.into()),
        }
    }
}

/// Trait that all tools must implement.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use conduit::tools::{Tool, ToolContext, ToolOutput};
/// use conduit::error::Result;
///
/// struct MyTool;
///
/// #[async_trait]
/// impl Tool for MyTool {
///     fn name(&self) -> &str { "my_tool" }
///     fn description(&self) -> &str { "Does something useful" }
///     fn parameters(&self) -> Value {
///         serde_json::json!({
///             "type": "object",
///             "properties": {},
///             "required": []
///         })
///     }
///     async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
///         Ok(ToolOutput::text("Done!"))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call this tool.
    fn name(&self) -> &str;

    /// Description sent to the model.
    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Execute with arguments that have already passed schema validation.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;

    /// Risk category for the permission policy.
    ///
    /// Defaults to `Shell` so a tool that forgets to override this ends up
    /// gated rather than silently trusted.
    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    /// Key under which an "always allow" decision is remembered.
    ///
    /// Defaults to the tool name, so approving once covers every later call.
    /// Tools with path-like arguments should narrow this (e.g. tool plus
    /// parent directory).
    fn policy_key(&self, _args: &Value) -> String {
        self.name().to_string()
    }
}

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Session the call belongs to
    pub session_id: String,
    /// Provider-assigned id of the call
    pub call_id: String,
    /// Workspace directory for file operations
    pub workspace: Option<String>,
    /// Fires when the run is cancelled; long-running tools should watch it
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Create a context for one call.
    ///
    /// # Example
    /// ```
    /// use conduit::tools::ToolContext;
    ///
    /// let ctx = ToolContext::new("cli:1", "call_7").with_workspace("/tmp/ws");
    /// assert_eq!(ctx.session_id, "cli:1");
    /// assert_eq!(ctx.workspace.as_deref(), Some("/tmp/ws"));
    /// ```
    pub fn new(session_id: &str, call_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            workspace: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ============================================================================
// Tool results
// ============================================================================

/// Why a tool call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Unknown tool or arguments rejected by the schema.
    ValidationError,
    /// The tool ran and failed.
    ExecutionError,
    /// Approval was not granted.
    Denied,
    /// The tool did not finish within its timeout.
    Timeout,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationError => write!(f, "validation_error"),
            Self::ExecutionError => write!(f, "execution_error"),
            Self::Denied => write!(f, "denied"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Machine-readable reason attached to a `denied` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    UserDenied,
    Timeout,
    SystemDenied,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserDenied => write!(f, "user_denied"),
            Self::Timeout => write!(f, "timeout"),
            Self::SystemDenied => write!(f, "system_denied"),
        }
    }
}

/// Structured error carried by a failed `ToolResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    pub message: String,
}

/// Outcome of one tool call. Produced for every issued call, whatever happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    /// Text safe to put in model context
    pub sanitized: String,
    /// Unprocessed payload for the UI
    pub raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    /// Successful result.
    pub fn ok(call_id: &str, tool_name: &str, sanitized: String, raw: Value) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            success: true,
            sanitized,
            raw,
            error: None,
            duration_ms: 0,
        }
    }

    /// Failed result of the given kind.
    pub fn failure(
        call_id: &str,
        tool_name: &str,
        kind: ToolErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::build_error(call_id, tool_name, kind, None, message.into())
    }

    /// Denied result with a machine-readable reason.
    pub fn denied(
        call_id: &str,
        tool_name: &str,
        reason: DenialReason,
        message: impl Into<String>,
    ) -> Self {
        Self::build_error(
            call_id,
            tool_name,
            ToolErrorKind::Denied,
            Some(reason),
            message.into(),
        )
    }

    fn build_error(
        call_id: &str,
        tool_name: &str,
        kind: ToolErrorKind,
        reason: Option<DenialReason>,
        message: String,
    ) -> Self {
        let label = match reason {
            Some(reason) => format!("{}: {}", kind, reason),
            None => kind.to_string(),
        };
        let sanitized = format!("Error ({}): {}", label, message);
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            success: false,
            sanitized,
            raw: serde_json::json!({
                "error": message,
                "kind": kind,
                "reason": reason,
            }),
            error: Some(ToolError {
                kind,
                reason,
                message,
            }),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Error kind, if this result is a failure.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Denial reason, if this result is a denial.
    pub fn denial_reason(&self) -> Option<DenialReason> {
        self.error.as_ref().and_then(|e| e.reason)
    }
}
