//! Hook system for the tool pipeline.
//!
//! Config-driven hooks that fire at fixed points of every tool call:
//!
//! - `before_tool`: before approval and execution (can log, block or patch args)
//! - `after_tool`: after a successful execution (can log)
//! - `on_error`: when a call fails for any reason (can log)
//!
//! # Configuration
//!
//! ```json
//! {
//!     "hooks": {
//!         "enabled": true,
//!         "before_tool": [
//!             { "action": "log", "tools": ["delete_file"], "level": "warn" },
//!             { "action": "block", "tools": ["delete_file"], "sessions": ["webhook:*"], "message": "Deletes disabled for webhooks" },
//!             { "action": "patch", "tools": ["list_dir"], "sessions": ["webhook:*"], "set_args": { "path": "public" } }
//!         ],
//!         "after_tool": [
//!             { "action": "log", "tools": ["*"], "level": "info" }
//!         ],
//!         "on_error": [
//!             { "action": "log", "tools": ["*"], "level": "error" }
//!         ]
//!     }
//! }
//! ```
//!
//! # Example
//!
//! ```rust
//! use conduit::hooks::{HooksConfig, HookEngine, HookResult, HookAction, HookRule};
//!
//! let config = HooksConfig {
//!     enabled: true,
//!     before_tool: vec![HookRule {
//!         action: HookAction::Block,
//!         tools: vec!["delete_file".to_string()],
//!         sessions: vec!["webhook:*".to_string()],
//!         message: Some("Deletes disabled for webhooks".to_string()),
//!         ..Default::default()
//!     }],
//!     ..Default::default()
//! };
//! let engine = HookEngine::new(config);
//! let result = engine.before_tool("delete_file", &serde_json::json!({}), "webhook:42");
//! assert!(matches!(result, HookResult::Block(_)));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Hook action enum
// ---------------------------------------------------------------------------

/// What a hook rule does when triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    /// Log the event via tracing.
    Log,
    /// Block the tool from executing (before_tool only).
    Block,
    /// Overwrite argument fields with `set_args` (before_tool only).
    Patch,
}

// ---------------------------------------------------------------------------
// Hook rule
// ---------------------------------------------------------------------------

/// A single hook rule that matches tool calls and performs an action.
///
/// Rules are evaluated in order. For `before_tool`, the first `Block` rule
/// that matches wins; `Patch` rules apply cumulatively to the arguments the
/// later rules see. `Log` rules never short-circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookRule {
    /// Action to perform.
    pub action: HookAction,
    /// Tool names to match. `["*"]` matches all tools. Empty = match none.
    pub tools: Vec<String>,
    /// Session id patterns to match. Empty = match all sessions. A trailing
    /// `*` matches by prefix (`"webhook:*"`).
    pub sessions: Vec<String>,
    /// Log level for `Log` action (trace/debug/info/warn/error).
    pub level: Option<String>,
    /// Custom message for `Block` action.
    pub message: Option<String>,
    /// Fields merged into the arguments for `Patch` action.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub set_args: Map<String, Value>,
}

impl Default for HookRule {
    fn default() -> Self {
        Self {
            action: HookAction::Log,
            tools: vec![],
            sessions: vec![],
            level: None,
            message: None,
            set_args: Map::new(),
        }
    }
}

impl HookRule {
    /// Check if this rule matches the given tool name.
    pub fn matches_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t == "*" || t == tool_name)
    }

    /// Check if this rule matches the given session id.
    /// Empty sessions list means match all.
    pub fn matches_session(&self, session_id: &str) -> bool {
        self.sessions.is_empty()
            || self.sessions.iter().any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => session_id.starts_with(prefix),
                None => pattern == session_id,
            })
    }

    fn matches(&self, tool_name: &str, session_id: &str) -> bool {
        self.matches_tool(tool_name) && self.matches_session(session_id)
    }
}

// ---------------------------------------------------------------------------
// Hooks config
// ---------------------------------------------------------------------------

/// Hooks configuration for `config.json`.
///
/// # Defaults
///
/// - `enabled`: `false`
/// - All rule lists: empty
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Master switch for hooks.
    pub enabled: bool,
    /// Rules evaluated before each tool execution.
    pub before_tool: Vec<HookRule>,
    /// Rules evaluated after each tool execution.
    pub after_tool: Vec<HookRule>,
    /// Rules evaluated when a tool call fails.
    pub on_error: Vec<HookRule>,
}

// ---------------------------------------------------------------------------
// Hook result
// ---------------------------------------------------------------------------

/// Result of evaluating before_tool hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum HookResult {
    /// Run the tool with its original arguments.
    Continue,
    /// Run the tool with these arguments instead.
    Patch(Value),
    /// Block the tool with the given message.
    Block(String),
}

// ---------------------------------------------------------------------------
// Hook engine
// ---------------------------------------------------------------------------

fn log_at(level: &str, hook: &str, tool: &str, session: &str, detail: &str, msg: &str) {
    match level {
        "error" => tracing::error!(hook, tool, session, detail, "{}", msg),
        "warn" => tracing::warn!(hook, tool, session, detail, "{}", msg),
        "debug" => tracing::debug!(hook, tool, session, detail, "{}", msg),
        "trace" => tracing::trace!(hook, tool, session, detail, "{}", msg),
        _ => tracing::info!(hook, tool, session, detail, "{}", msg),
    }
}

/// Runtime hook engine that evaluates rules from [`HooksConfig`].
///
/// Owned by the tool manager and called at 3 points:
/// 1. `before_tool`: before the approval gate and execution
/// 2. `after_tool`: after a successful execution
/// 3. `on_error`: after a failed, denied or timed-out call
#[derive(Debug, Clone, Default)]
pub struct HookEngine {
    config: HooksConfig,
}

impl HookEngine {
    /// Create a new HookEngine from configuration.
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    /// Evaluate before_tool hooks.
    ///
    /// Returns `Block` on the first matching block rule. Otherwise returns
    /// `Patch` with the merged arguments if any patch rule matched, or
    /// `Continue`.
    pub fn before_tool(&self, tool_name: &str, args: &Value, session_id: &str) -> HookResult {
        if !self.config.enabled {
            return HookResult::Continue;
        }

        let mut patched: Option<Value> = None;
        for rule in &self.config.before_tool {
            if !rule.matches(tool_name, session_id) {
                continue;
            }

            match rule.action {
                HookAction::Log => {
                    let current = patched.as_ref().unwrap_or(args);
                    log_at(
                        rule.level.as_deref().unwrap_or("info"),
                        "before_tool",
                        tool_name,
                        session_id,
                        &current.to_string(),
                        "Hook: tool call",
                    );
                }
                HookAction::Block => {
                    let msg = rule
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Tool '{}' blocked by hook", tool_name));
                    tracing::info!(
                        hook = "before_tool",
                        tool = tool_name,
                        session = session_id,
                        "Hook: blocking tool"
                    );
                    return HookResult::Block(msg);
                }
                HookAction::Patch => {
                    if rule.set_args.is_empty() {
                        continue;
                    }
                    let mut current = match patched.take().unwrap_or_else(|| args.clone()) {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    for (key, value) in &rule.set_args {
                        current.insert(key.clone(), value.clone());
                    }
                    tracing::debug!(
                        hook = "before_tool",
                        tool = tool_name,
                        session = session_id,
                        fields = rule.set_args.len(),
                        "Hook: patching arguments"
                    );
                    patched = Some(Value::Object(current));
                }
            }
        }

        match patched {
            Some(args) => HookResult::Patch(args),
            None => HookResult::Continue,
        }
    }

    /// Evaluate after_tool hooks (logging only).
    pub fn after_tool(
        &self,
        tool_name: &str,
        result: &str,
        elapsed: std::time::Duration,
        session_id: &str,
    ) {
        if !self.config.enabled {
            return;
        }

        for rule in &self.config.after_tool {
            if rule.action != HookAction::Log || !rule.matches(tool_name, session_id) {
                continue;
            }
            let detail = format!("{}ms, {} bytes", elapsed.as_millis(), result.len());
            log_at(
                rule.level.as_deref().unwrap_or("info"),
                "after_tool",
                tool_name,
                session_id,
                &detail,
                "Hook: tool completed",
            );
        }
    }

    /// Evaluate on_error hooks (logging only).
    pub fn on_error(&self, tool_name: &str, error: &str, session_id: &str) {
        if !self.config.enabled {
            return;
        }

        for rule in &self.config.on_error {
            if rule.action != HookAction::Log || !rule.matches(tool_name, session_id) {
                continue;
            }
            log_at(
                rule.level.as_deref().unwrap_or("error"),
                "on_error",
                tool_name,
                session_id,
                error,
                "Hook: tool error",
            );
        }
    }

    /// Whether hooks are enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
