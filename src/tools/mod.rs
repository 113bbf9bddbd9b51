//! Tools module - tool definitions, validation, approval and execution
//!
//! - [`Tool`]: the interface every tool implements
//! - [`ToolRegistry`]: the set of tools a run may call
//! - [`filesystem`]: workspace-confined file tools
//! - [`validate`]: JSON-schema argument validation with defaults and coercion
//! - [`policy`]: which calls need a human decision
//! - [`approval`]: the per-session approval table shared by all transports
//! - [`ToolManager`]: the full pipeline from a model's tool call to a
//!   [`ToolResult`] that is safe to put back into context
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use conduit::config::ApprovalConfig;
//! use conduit::session::ToolCall;
//! use conduit::tools::{approval::ApprovalCoordinator, EchoTool, ToolManager, ToolRegistry};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(EchoTool));
//!
//! let manager = ToolManager::new(registry, ApprovalCoordinator::new(&ApprovalConfig::default()));
//! let call = ToolCall::new("call_1", "echo", json!({"message": "Hello!"}));
//! let result = manager.execute_tool(&call, "cli:1", &CancellationToken::new()).await;
//!
//! assert!(result.success);
//! assert_eq!(result.sanitized, "Hello!");
//! # });
//! ```

pub mod approval;
pub mod filesystem;
mod manager;
pub mod policy;
mod registry;
mod types;
pub mod validate;

pub use approval::{ApprovalCoordinator, ApprovalDecision, ApprovalRequest, ApprovalStatus};
pub use manager::ToolManager;
pub use policy::{ApprovalRequirement, ConfigPolicy, PermissionPolicy};
pub use registry::ToolRegistry;
pub use types::{
    DenialReason, Tool, ToolCategory, ToolContext, ToolError, ToolErrorKind, ToolOutput,
    ToolResult,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A simple echo tool for testing purposes.
///
/// # Example
///
/// ```rust
/// use conduit::tools::{Tool, ToolContext, EchoTool};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let ctx = ToolContext::new("cli:1", "call_1");
/// let output = EchoTool.execute(json!({"message": "Hello"}), &ctx).await.unwrap();
/// assert_eq!(output.raw, json!("Hello"));
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FilesystemRead
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(ToolOutput::text(message))
    }
}
