//! Conduit - a provider-agnostic LLM agent runtime
//!
//! One agentic loop drives any chat-completion backend through a
//! [`ProviderAdapter`]. The loop keeps the conversation inside the model's
//! token budget, executes tool calls behind an approval gate, and publishes
//! every step on a per-session event bus.

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod hooks;
pub mod providers;
pub mod session;
pub mod tools;
pub mod utils;

pub use agent::{
    ContextManager, ContributorContext, LLMService, LlmContext, LlmServiceConfig, RunRequest,
    RuntimeContext,
};
pub use bus::{AgentEvent, EventKind, SessionEventBus};
pub use config::Config;
pub use error::{ConduitError, ProviderError, Result};
pub use providers::{ChatOptions, ProviderAdapter, RetryPolicy, StreamChunk, ToolDefinition};
pub use session::{HistoryProvider, Message, Role, Session, TokenUsage, ToolCall};
pub use tools::{ApprovalCoordinator, Tool, ToolManager, ToolRegistry, ToolResult};
