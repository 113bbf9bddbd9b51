//! Configuration type definitions for Conduit
//!
//! All types implement serde traits for JSON serialization and carry sensible
//! defaults, so a partial `config.json` is always valid input.

use serde::{Deserialize, Serialize};

use crate::tools::ToolCategory;

/// Main configuration struct for Conduit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent loop configuration (provider, model, iterations)
    pub agent: AgentConfig,
    /// Context window budget and compaction
    pub context: ContextConfig,
    /// Tool approval gating
    pub approval: ApprovalConfig,
    /// Tool execution limits
    pub tools: ToolsConfig,
    /// LLM provider credentials, retry and timeouts
    pub providers: ProvidersConfig,
    /// Hook rules evaluated around tool execution
    pub hooks: crate::hooks::HooksConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

// ============================================================================
// Agent Configuration
// ============================================================================

/// Agent loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Provider adapter name ("anthropic" or "openai").
    pub provider: String,
    /// Model override. `None` uses the adapter's default model.
    pub model: Option<String>,
    /// Maximum provider round-trips per run before the loop gives up.
    pub max_iterations: u32,
    /// Maximum output tokens per provider call.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether runs stream by default when the caller does not say.
    pub streaming: bool,
    /// Base system prompt prepended to every request.
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: None,
            max_iterations: 20,
            max_tokens: 8192,
            temperature: 0.7,
            streaming: false,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Default system prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
Use the available tools when they help you complete the user's request. \
Be concise and accurate.";

// ============================================================================
// Context Configuration
// ============================================================================

/// Context window budget and compaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Configured maximum input tokens. Capped by the model's own limit;
    /// `None` means use the model limit as-is.
    pub max_input_tokens: Option<usize>,
    /// Fraction (0.0-1.0] of the budget that triggers compaction.
    pub compaction_threshold: f64,
    /// Number of most recent turns compaction tries to keep intact.
    pub keep_recent_turns: usize,
    /// Tokens held back for response framing and estimation error.
    pub safety_buffer_tokens: usize,
    /// Upper bound on the characters in a compaction summary note.
    pub summary_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: None,
            compaction_threshold: 0.9,
            keep_recent_turns: 4,
            safety_buffer_tokens: 512,
            summary_max_chars: 2000,
        }
    }
}

// ============================================================================
// Approval Configuration
// ============================================================================

/// When tool calls require approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Every tool call requires approval (unless in `always_allow`).
    Always,
    /// No tool call requires approval (unless in `always_require`).
    Never,
    /// Tool calls in `require_for` categories require approval.
    Categories,
}

/// Tool approval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Base policy.
    pub mode: ApprovalMode,
    /// Categories gated when `mode` is `categories`.
    pub require_for: Vec<ToolCategory>,
    /// Tools that never require approval.
    pub always_allow: Vec<String>,
    /// Tools that always require approval, whatever the mode.
    pub always_require: Vec<String>,
    /// Seconds a request waits for a decision before it resolves as timed out.
    pub timeout_secs: u64,
    /// Resolve as `system_denied` when no transport is subscribed for the session.
    pub deny_without_subscribers: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Categories,
            require_for: vec![
                ToolCategory::FilesystemWrite,
                ToolCategory::Shell,
                ToolCategory::NetworkWrite,
                ToolCategory::Destructive,
            ],
            always_allow: Vec::new(),
            always_require: Vec::new(),
            timeout_secs: 300,
            deny_without_subscribers: true,
        }
    }
}

// ============================================================================
// Tools Configuration
// ============================================================================

/// Tool execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Per-call execution timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum bytes of a tool result forwarded to the model.
    pub max_result_bytes: usize,
    /// Root directory for filesystem tools. Paths may not leave it.
    pub workspace: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_result_bytes: 50_000,
            workspace: None,
        }
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// LLM provider configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Anthropic (Claude) provider
    pub anthropic: Option<ProviderConfig>,
    /// OpenAI or any OpenAI-compatible endpoint
    pub openai: Option<ProviderConfig>,
    /// Retry behavior for transient provider failures
    pub retry: RetryConfig,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: None,
            openai: None,
            retry: RetryConfig::default(),
            request_timeout_secs: 120,
        }
    }
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key for authentication
    pub api_key: Option<String>,
    /// Custom API base URL
    pub api_base: Option<String>,
}

/// Retry behavior for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable automatic retry for transient provider errors.
    pub enabled: bool,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds (doubled per attempt).
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// Compact single-line output with component tags.
    Component,
    /// Structured JSON lines.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default filter level when `RUST_LOG` is unset.
    pub level: String,
    /// Optional file to append to instead of stderr.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}
