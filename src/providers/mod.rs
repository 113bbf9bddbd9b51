//! Providers module - LLM provider adapters
//!
//! The agent loop is generic over [`ProviderAdapter`]. Each adapter owns
//! its wire format ([`MessageFormatter`]), tool schema shape, HTTP transport
//! and response extraction; everything above it sees only
//! [`ProviderResponse`] and [`StreamChunk`].
//!
//! - [`claude`]: Anthropic Messages API
//! - [`openai`]: Chat Completions and compatible endpoints
//! - [`retry`]: the shared backoff policy
//! - [`error_classifier`]: HTTP status and message classification
//!
//! # Example
//!
//! ```rust
//! use conduit::providers::{claude::ClaudeAdapter, ProviderAdapter, ToolDefinition};
//! use serde_json::json;
//!
//! let adapter = ClaudeAdapter::new("your-api-key");
//! let tools = adapter.format_tools(&[ToolDefinition::new(
//!     "echo",
//!     "Echo a message",
//!     json!({"type": "object"}),
//! )]);
//! assert_eq!(tools[0]["name"], "echo");
//! ```

pub mod claude;
pub mod error_classifier;
pub mod format;
pub mod openai;
mod registry;
pub mod retry;
pub mod sse;
mod types;

use crate::error::{ConduitError, ProviderError};

pub use format::{flatten_tool_history, formatter_for, MessageFormatter, WirePrompt};
pub use registry::{build_adapter, lookup, ProviderSpec, PROVIDER_REGISTRY};
pub use retry::RetryPolicy;
pub use types::{
    replay, ChatOptions, ProviderAdapter, ProviderRequest, ProviderResponse, StreamChunk,
    ToolDefinition,
};

/// Parse an HTTP status code and response body into a structured [`ProviderError`].
///
/// Both adapters go through here so they produce the same classification
/// for the same failure.
pub fn parse_provider_error(status: u16, body: &str) -> ProviderError {
    error_classifier::classify_http(status, body)
}

/// Map a transport-level reqwest failure. Timeouts and refused connections
/// become retryable provider errors; anything else stays an HTTP error.
pub(crate) fn transport_error(err: reqwest::Error) -> ConduitError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string()).into()
    } else if err.is_connect() {
        ProviderError::ServerError(format!("connection failed: {}", err)).into()
    } else {
        ConduitError::Http(err)
    }
}
